//! Request handlers, grouped by concern.
//!
//! Every handler returns `(Option<ConversationResponse>, Outcome)`; `None`
//! means the request was suspended (the relay case) or will be answered
//! asynchronously. Errors never cross handler boundaries as control flow —
//! they are mapped to response statuses in place.

pub mod conversation;
pub mod hosting;
pub mod profile;
pub mod relations;

use crate::net::dispatch::Outcome;
use crate::net::message::ConversationResponse;

pub type Handled = (Option<ConversationResponse>, Outcome);

/// Immediate response, connection stays open.
pub fn reply(response: ConversationResponse) -> Handled {
    (Some(response), Outcome::Continue)
}

/// Immediate error response, connection stays open.
pub fn reply_error(status: crate::net::message::Status) -> Handled {
    (Some(ConversationResponse::error(status)), Outcome::Continue)
}
