//! Protocol engine: framing, wire model, sessions, dispatch, listeners.

pub mod dispatch;
pub mod frame;
pub mod message;
pub mod registry;
pub mod serde_safe;
pub mod server;
pub mod session;

// Re-exports
pub use dispatch::{dispatch_message, Outcome};
pub use frame::{read_message, write_message, FrameError};
pub use message::{
    Body, ConversationPayload, ConversationRequest, ConversationResponse, Message, Request,
    RequestKind, Response, SinglePayload, SingleRequest, SingleResponse, Status,
};
pub use registry::{ClientRegistry, RegistryStats};
pub use serde_safe::{from_bytes, to_bytes, BoundedBytes, BoundedVec};
pub use server::{start, ServerContext};
pub use session::{PendingRequest, Session, SessionState};
