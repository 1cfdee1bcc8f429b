//! Call-code signaling for one-to-one voice calls.
//!
//! The relay side (`relay`, `server`) hands every WebSocket connection an
//! identity and forwards negotiation frames by identity. The client side
//! (`session`) turns those frames into a negotiated peer transport.

pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

pub use config::{ClientConfig, Config};
pub use error::{RelayError, SessionError, SignalingError};
pub use protocol::{ClientMessage, ConnectionId, ServerMessage};
pub use relay::Relay;
pub use session::{Session, SessionEvent, SessionState, SignalingClient};
