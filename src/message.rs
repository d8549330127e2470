use std::time::SystemTime;

use bytes::Bytes;

use crate::state::StateCode;

/// What a session hands to its consumer: in-order payloads interleaved with
/// half-state notifications, terminated by [`StateCode::Stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data { data: Bytes, time: SystemTime },
    State { code: StateCode, time: SystemTime },
}

impl Message {
    pub(crate) fn data(data: Bytes) -> Self {
        Message::Data { data, time: SystemTime::now() }
    }

    pub(crate) fn state(code: StateCode) -> Self {
        Message::State { code, time: SystemTime::now() }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Message::Data { .. })
    }

    /// True for the final message of a session.
    pub fn is_stop(&self) -> bool {
        matches!(self, Message::State { code: StateCode::Stop, .. })
    }
}
