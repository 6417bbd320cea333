//! Shared domain types for the notification gateway: identities, the wire
//! message and the error taxonomy used across registries.

pub mod errors;
pub mod ids;
pub mod message;

pub use errors::GatewayError;
pub use ids::{MessageId, UserId};
pub use message::{CodecError, Message, ValidationError};
