//! portaldrop: two-party file drop between peers that discover each other
//! through a small signaling relay.
//!
//! The relay maps opaque room keys to participants and forwards
//! connection-negotiation messages; it never sees file contents. Once a
//! direct channel exists (provided by an injected transport
//! implementation), files move as one metadata frame followed by ordered
//! binary chunks, with heartbeat liveness checks and bounded reconnection.

pub mod config;
pub mod error;
pub mod portal;
pub mod relay;
pub mod wire;

pub use config::Config;
pub use error::{PortalError, Result};
