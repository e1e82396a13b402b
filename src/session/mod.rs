//! Dialogue session: server channel, uploads and the state machine

mod channel;
mod messages;
mod orchestrator;
mod uploader;

pub use channel::{MessageSink, ReconnectPolicy, SessionChannel};
pub use messages::{InboundMessage, OutboundMessage};
pub use orchestrator::{
    SessionEvent, SessionOrchestrator, SessionParts, SessionState, SessionStreams,
};
pub use uploader::{UPLOAD_FILENAME, Uploader};
