//! Realtime fan-out for the notification gateway.
//!
//! Each user may hold several live WebSocket connections. The first session
//! for a user starts a broker consumer bound to that user's routing key; every
//! delivery is written to all of the user's connections. The consumer retires
//! itself once a delivery finds nobody connected.

#![deny(unsafe_code)]

pub mod auth;
pub mod connections;
pub mod consumers;
pub mod error;
pub mod health;
pub mod mock;
pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use auth::{resolver_from_settings, AuthError, JwtResolver, PassthroughResolver, PrincipalResolver};
pub use connections::{Connection, ConnectionRegistry};
pub use consumers::ConsumerRegistry;
pub use error::{ConnectionError, SessionError};
pub use orchestrator::{FanoutOrchestrator, SessionHandler};
pub use server::{router, start, AppState, ServerHandle, FEED_PATH};
pub use shutdown::ShutdownCoordinator;
