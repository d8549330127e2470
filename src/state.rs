use std::sync::atomic::{AtomicU8, Ordering};

/// Half-state of one direction (send or read) on one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Normal = 0,
    /// Graceful half-close; already-sent data still drains.
    Finish = 1,
    /// Immediate half-close; in-flight data is discarded.
    Abort = 2,
}

impl StreamState {
    pub(crate) fn from_u8(raw: u8) -> StreamState {
        match raw {
            1 => StreamState::Finish,
            2 => StreamState::Abort,
            _ => StreamState::Normal,
        }
    }

    /// Both halves closed is the session's terminal condition.
    pub fn is_closed(self) -> bool {
        !matches!(self, StreamState::Normal)
    }
}

/// Atomically shared [`StreamState`].
///
/// The run loop is the main writer; the public API writes the local halves
/// from other tasks. `transition` is a swap, so a transition to a given state
/// is observed exactly once even with two writers racing.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Set the state, reporting whether it actually changed.
    pub(crate) fn transition(&self, to: StreamState) -> bool {
        StreamState::from_u8(self.0.swap(to as u8, Ordering::AcqRel)) != to
    }
}

/// State codes carried by STATE packets and surfaced in
/// [`crate::Message::State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StateCode {
    FinishSend = 0x01,
    FinishRead = 0x02,
    AbortSend = 0x03,
    AbortRead = 0x04,
    /// Never sent on the wire; produced locally as the final message.
    Stop = 0x05,
}

impl StateCode {
    pub(crate) fn from_u8(raw: u8) -> Option<StateCode> {
        match raw {
            0x01 => Some(StateCode::FinishSend),
            0x02 => Some(StateCode::FinishRead),
            0x03 => Some(StateCode::AbortSend),
            0x04 => Some(StateCode::AbortRead),
            0x05 => Some(StateCode::Stop),
            _ => None,
        }
    }

    /// Finish codes carry the sender's outbound serial; aborts carry nothing.
    pub(crate) fn carries_serial(self) -> bool {
        matches!(self, StateCode::FinishSend | StateCode::FinishRead)
    }
}
