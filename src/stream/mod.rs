//! Streaming conversation protocol.
//!
//! - [`event`]: typed [`StreamEvent`]s and the `data:` line parser.
//! - [`codec`]: bounded line framing for the response body.
//! - [`form`]: the form request/response convention.
//! - [`session`]: [`StreamSession`], the generation-tracked conversation.

pub mod codec;
pub mod event;
pub mod form;
pub mod session;

pub use event::{parse_line, StreamEvent};
pub use form::{FormButton, FormField, FormResponse};
pub use session::{SessionUpdate, SessionUpdates, StreamSession, TurnPhase};
