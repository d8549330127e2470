use bytes::Bytes;

use crate::session::Session;

/// Queue tag for a framed packet handed to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTag {
    Data,
    State,
    Info,
}

/// A complete packet body queued for the pool to ship, together with the
/// session that produced it.
#[derive(Debug, Clone)]
pub struct ToSend {
    pub tag: SendTag,
    pub session: Session,
    pub payload: Bytes,
}

/// The pool-side endpoints a session writes to.
///
/// Both queues are unbounded multi-producer FIFOs shared by every session;
/// enqueueing never blocks. INFO packets travel on their own queue so
/// telemetry is not stuck behind bulk data.
#[derive(Clone)]
pub struct PoolHandle {
    pub send_queue: flume::Sender<ToSend>,
    pub info_chan: flume::Sender<ToSend>,
    /// When registered, a session pushes a handle to itself here as part of
    /// its finalization, letting the pool reap it.
    pub stop_notify: Option<flume::Sender<Session>>,
}

impl PoolHandle {
    pub fn new(send_queue: flume::Sender<ToSend>, info_chan: flume::Sender<ToSend>) -> Self {
        Self { send_queue, info_chan, stop_notify: None }
    }

    pub fn with_stop_notify(mut self, notify: flume::Sender<Session>) -> Self {
        self.stop_notify = Some(notify);
        self
    }
}
