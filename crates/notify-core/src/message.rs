//! The payload carried on the broker: a flat `{id, text, author_id}` record.

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{0}` must not be empty")]
    MissingField(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub author_id: UserId,
}

impl Message {
    pub fn new(id: MessageId, text: impl Into<String>, author_id: UserId) -> Self {
        Self {
            id,
            text: text.into(),
            author_id,
        }
    }

    /// Every field is required before a message may be published.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.text.is_empty() {
            return Err(ValidationError::MissingField("text"));
        }
        if self.author_id.is_empty() {
            return Err(ValidationError::MissingField("author_id"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    /// Decoding checks shape only; consumers forward the original bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}
