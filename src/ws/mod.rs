// WebSocket command channel: framing, upgrade handshake, sessions
pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::{Frame, FrameError};
pub use session::{AttachOutcome, Role, SessionArbiter, SessionId};
