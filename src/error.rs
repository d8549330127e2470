use crate::state::StreamState;

/// Unified session error type.
///
/// Every variant is a send-admission rejection: inbound problems (malformed
/// packets, stale INFO, duplicate serials) are dropped inside the run loop
/// and never surface as errors. The consumer learns about the peer only
/// through [`crate::Message::State`] values.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session has been stopped; nothing further is accepted.
    #[error("session is closed")]
    Closed,

    /// The peer aborted its read half; outbound data would be discarded.
    #[error("remote read half aborted")]
    RemoteAborted,

    /// The local send half was already finished or aborted.
    #[error("local send half is {state:?}")]
    SendHalfClosed { state: StreamState },
}
