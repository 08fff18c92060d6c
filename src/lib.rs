//! syncwire — real-time server-to-client state synchronization.
//!
//! Keeps server-side objects and a remote client (typically a browser) in
//! continuous agreement over a long-lived, reconnectable message channel:
//! - JSON projections of registered objects, shipped as full `SET` events
//!   and RFC 6902 `PATCH` deltas against the last acknowledged snapshot
//! - Client-invoked *actions* (short, strictly sequential) and *tasks*
//!   (long-running, concurrent, cancellable)
//! - Sessions that survive transport drops: every reattach replays full
//!   state, nothing is lost while the client is away
//! - Out-of-band binary transfer for bulk fields
//!
//! The transport is pluggable; an axum WebSocket adapter is included.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use syncwire::{Session, SyncUnit, TypeSpec, UnitBuilder};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Notepad {
//!     title: String,
//!     notes: Vec<String>,
//! }
//!
//! let session = Session::new();
//! let unit = session.scope(|| {
//!     UnitBuilder::new("NOTES")
//!         .typed("title", TypeSpec::String)
//!         .action("add", &[("note", TypeSpec::String)], |unit: SyncUnit<Notepad>, args| async move {
//!             let note = args["note"].as_str().unwrap_or_default().to_string();
//!             unit.lock().notes.push(note);
//!             unit.sync().await?;
//!             Ok(())
//!         })
//!         .build(Notepad { title: "Untitled".into(), notes: vec![] })
//! });
//! ```

pub mod axum_ws;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod unit;
pub mod validate;

pub use protocol::{
    BinaryMeta, Envelope, ErrorCode, ErrorReport, ProtocolError, TaskDone, TaskOutcome, Toast,
    ToastLevel,
};
pub use registry::{Identity, SessionRegistry};
pub use session::{current_session, Session};
pub use transport::{
    memory_pair, Frame, MemoryPeer, MemoryTransport, Transport, TransportError, TransportReader,
    TransportWriter,
};
pub use unit::{HandlerError, HandlerResult, SyncUnit, UnitBuilder};
pub use validate::{SchemaValidator, TypeSpec, ValidateError, Validator};

use thiserror::Error;

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the synchronization engine
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error(transparent)]
    Validation(#[from] validate::ValidateError),

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("no session in scope; construct synced objects inside Session::scope")]
    NoAmbientSession,

    #[error("event {0:?} already has a handler")]
    DuplicateEvent(String),

    #[error("invalid sync declaration: {0}")]
    Config(String),

    #[error("session is closed")]
    Closed,

    #[error("no transport attached")]
    NotAttached,

    #[error("identification failed: {0}")]
    Identify(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::DuplicateEvent("NOTES:SET".into());
        assert_eq!(err.to_string(), "event \"NOTES:SET\" already has a handler");

        let err = SyncError::Config("duplicate action \"ADD\"".into());
        assert!(err.to_string().starts_with("invalid sync declaration"));
    }
}
