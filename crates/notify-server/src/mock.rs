//! In-memory [`Connection`] that records what was written to it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connections::Connection;
use crate::error::ConnectionError;

pub struct MockConnection {
    endpoint: SocketAddr,
    written: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    closes: AtomicUsize,
}

impl MockConnection {
    pub fn new(endpoint: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    /// Connection from `127.0.0.1:port`.
    pub fn at(port: u16) -> Arc<Self> {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Connection whose writes always fail.
    pub fn failing(port: u16) -> Arc<Self> {
        let conn = Self::at(port);
        conn.set_fail_writes(true);
        conn
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    async fn write_text(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(ConnectionError::Write("injected write failure".into()));
        }
        self.written.lock().push(payload.to_vec());
        Ok(())
    }

    async fn close(&self) {
        let _ = self.closes.fetch_add(1, Ordering::Relaxed);
    }
}
