use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::config::SessionConfig;
use crate::delivery;
use crate::error::SessionError;
use crate::message::Message;
use crate::packet::{InfoPayload, Packet};
use crate::pool::{PoolHandle, SendTag, ToSend};
use crate::reorder::ReorderQueue;
use crate::state::{AtomicState, StateCode, StreamState};
use crate::{Serial, SessionId};

/// Handle to one logical bidirectional stream multiplexed over the pool.
///
/// Cloning is cheap; all clones drive the same session. Each session runs
/// two background tasks: the run loop (packet dispatch, state machine,
/// heartbeat) and the delivery worker feeding [`Session::messages`].
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: SessionId,
    /// Post-increment outbound serial; its value is carried by the packet.
    serial: AtomicU32,
    closed: AtomicBool,

    send_state: AtomicState,
    read_state: AtomicState,
    remote_send_state: AtomicState,
    remote_read_state: AtomicState,

    /// Next in-order serial expected from the peer. Single writer: run loop.
    incoming_serial: AtomicU32,
    /// Highest serial seen from the peer, gap telemetry only.
    max_incoming_serial: AtomicU32,
    incoming_data_count: AtomicU32,

    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    remote_bytes_read: AtomicU64,
    remote_bytes_sent: AtomicU64,
    /// Peer's reassembly progress from its last INFO, telemetry only.
    remote_incoming_serial: AtomicU32,
    remote_max_incoming_serial: AtomicU32,

    send_queue: flume::Sender<ToSend>,
    info_chan: flume::Sender<ToSend>,
    stop_notify: Option<flume::Sender<Session>>,

    incoming_tx: mpsc::UnboundedSender<Bytes>,
    user_tx: mpsc::UnboundedSender<Bytes>,

    stop_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,

    /// Consumer message channel, handed out once by `messages`.
    messages: Mutex<Option<mpsc::Receiver<Message>>>,
}

/// Point-in-time counters and half-states of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub id: SessionId,
    pub serial: Serial,
    pub incoming_serial: Serial,
    pub max_incoming_serial: Serial,
    pub incoming_data_count: u32,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub remote_bytes_read: u64,
    pub remote_bytes_sent: u64,
    /// Peer's reassembly progress as of its last INFO packet.
    pub remote_incoming_serial: Serial,
    pub remote_max_incoming_serial: Serial,
    pub send_state: StreamState,
    pub read_state: StreamState,
    pub remote_send_state: StreamState,
    pub remote_read_state: StreamState,
}

impl Session {
    /// Create a session and launch its run loop and delivery worker.
    pub fn new(id: SessionId, pool: PoolHandle, config: SessionConfig) -> Session {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (producer_tx, producer_rx) = mpsc::channel(1);
        let (consumer_tx, consumer_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id,
            serial: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            send_state: AtomicState::new(StreamState::Normal),
            read_state: AtomicState::new(StreamState::Normal),
            remote_send_state: AtomicState::new(StreamState::Normal),
            remote_read_state: AtomicState::new(StreamState::Normal),
            incoming_serial: AtomicU32::new(1),
            max_incoming_serial: AtomicU32::new(0),
            incoming_data_count: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            remote_bytes_read: AtomicU64::new(0),
            remote_bytes_sent: AtomicU64::new(0),
            remote_incoming_serial: AtomicU32::new(0),
            remote_max_incoming_serial: AtomicU32::new(0),
            send_queue: pool.send_queue,
            info_chan: pool.info_chan,
            stop_notify: pool.stop_notify,
            incoming_tx,
            user_tx,
            stop_tx,
            stopped_tx,
            messages: Mutex::new(Some(consumer_rx)),
        });
        let session = Session { shared };

        tokio::spawn(delivery::deliver(producer_rx, consumer_tx));

        let run_loop = RunLoop {
            session: session.clone(),
            config,
            producer: producer_tx,
            reorder: ReorderQueue::new(),
            remote_read_finish_at: 0,
            remote_send_finish_at: 0,
            last_remote_heartbeat: 0,
            last_remote_seen: None,
        };
        tokio::spawn(run_loop.run(incoming_rx, user_rx, stop_rx));

        session
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Frame `data` as the next DATA packet and queue it for the pool.
    ///
    /// Rejected once the session is closed, once the peer aborted its read
    /// half, or once the local send half was finished or aborted; nothing is
    /// queued in that case and `BytesSent` is untouched.
    pub fn send(&self, data: Bytes) -> crate::Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        if shared.remote_read_state.load() == StreamState::Abort {
            return Err(SessionError::RemoteAborted);
        }
        let send_state = shared.send_state.load();
        if send_state != StreamState::Normal {
            return Err(SessionError::SendHalfClosed { state: send_state });
        }

        let serial = shared.serial.fetch_add(1, Ordering::AcqRel) + 1;
        let len = data.len() as u64;
        self.enqueue(SendTag::Data, Packet::Data { serial, payload: data }.encode());
        shared.bytes_sent.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    /// Close the send half gracefully; everything already queued still
    /// drains, nothing new is accepted.
    pub fn finish_send(&self) {
        self.shared.send_state.store(StreamState::Finish);
        let at = self.shared.serial.load(Ordering::Acquire);
        self.enqueue(
            SendTag::State,
            Packet::State { code: StateCode::FinishSend, finish_at: Some(at) }.encode(),
        );
    }

    /// Announce that nothing more will be read from the peer.
    pub fn finish_read(&self) {
        self.shared.read_state.store(StreamState::Finish);
        let at = self.shared.serial.load(Ordering::Acquire);
        self.enqueue(
            SendTag::State,
            Packet::State { code: StateCode::FinishRead, finish_at: Some(at) }.encode(),
        );
    }

    /// Graceful close of both halves.
    pub fn finish(&self) {
        self.finish_read();
        self.finish_send();
    }

    /// Drop the send half immediately; in-flight data may be discarded.
    pub fn abort_send(&self) {
        self.shared.send_state.store(StreamState::Abort);
        self.enqueue(
            SendTag::State,
            Packet::State { code: StateCode::AbortSend, finish_at: None }.encode(),
        );
    }

    /// Stop reading immediately; the peer learns its sends are void.
    pub fn abort_read(&self) {
        self.shared.read_state.store(StreamState::Abort);
        self.enqueue(
            SendTag::State,
            Packet::State { code: StateCode::AbortRead, finish_at: None }.encode(),
        );
    }

    /// Immediate close of both halves.
    pub fn abort(&self) {
        self.abort_send();
        self.abort_read();
    }

    /// Ask the run loop to exit and wait for finalization. Idempotent; every
    /// caller returns once the session has fully stopped.
    pub async fn stop(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shared.stop_tx.send(true);
        self.stopped().await;
    }

    /// Wait until the session has finalized.
    pub async fn stopped(&self) {
        let mut rx = self.shared.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped_tx.borrow()
    }

    /// Take the consumer message channel. Yields `None` after the first call.
    pub fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        self.shared.messages.lock().take()
    }

    /// Sender half of the user-inbound byte channel; payloads pushed here
    /// are forwarded to [`Session::send`] by the run loop.
    pub fn input(&self) -> mpsc::UnboundedSender<Bytes> {
        self.shared.user_tx.clone()
    }

    /// Where the pool delivers inbound packet bodies for this session.
    pub fn incoming_sender(&self) -> mpsc::UnboundedSender<Bytes> {
        self.shared.incoming_tx.clone()
    }

    /// Telemetry snapshot.
    pub fn stats(&self) -> SessionStats {
        let s = &self.shared;
        SessionStats {
            id: s.id,
            serial: s.serial.load(Ordering::Acquire),
            incoming_serial: s.incoming_serial.load(Ordering::Acquire),
            max_incoming_serial: s.max_incoming_serial.load(Ordering::Acquire),
            incoming_data_count: s.incoming_data_count.load(Ordering::Acquire),
            bytes_read: s.bytes_read.load(Ordering::Acquire),
            bytes_sent: s.bytes_sent.load(Ordering::Acquire),
            remote_bytes_read: s.remote_bytes_read.load(Ordering::Acquire),
            remote_bytes_sent: s.remote_bytes_sent.load(Ordering::Acquire),
            remote_incoming_serial: s.remote_incoming_serial.load(Ordering::Acquire),
            remote_max_incoming_serial: s.remote_max_incoming_serial.load(Ordering::Acquire),
            send_state: s.send_state.load(),
            read_state: s.read_state.load(),
            remote_send_state: s.remote_send_state.load(),
            remote_read_state: s.remote_read_state.load(),
        }
    }

    fn enqueue(&self, tag: SendTag, payload: Bytes) {
        let queue = match tag {
            SendTag::Info => &self.shared.info_chan,
            _ => &self.shared.send_queue,
        };
        let to_send = ToSend { tag, session: self.clone(), payload };
        if queue.send(to_send).is_err() {
            tracing::debug!("session {} pool queue closed, packet dropped", self.shared.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.shared.id).finish()
    }
}

/// The single task that owns all session state transitions: it dispatches
/// inbound packets, drains the user-inbound channel, and drives the
/// heartbeat. Everything here runs on one task; the atomics in `Shared`
/// exist for the cross-task readers, not for contention.
struct RunLoop {
    session: Session,
    config: SessionConfig,
    producer: mpsc::Sender<Message>,
    reorder: ReorderQueue,
    /// Serial at which the peer's read half-close takes effect.
    remote_read_finish_at: Serial,
    /// Serial at which the peer's send half-close takes effect.
    remote_send_finish_at: Serial,
    /// Timestamp from the peer's last accepted INFO, for staleness filtering.
    last_remote_heartbeat: u32,
    /// Local clock at the peer's last accepted INFO, for the liveness check.
    last_remote_seen: Option<Instant>,
}

impl RunLoop {
    async fn run(
        mut self,
        mut incoming_rx: mpsc::UnboundedReceiver<Bytes>,
        mut user_rx: mpsc::UnboundedReceiver<Bytes>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tracing::debug!("session {} start", self.id());
        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                body = incoming_rx.recv() => match body {
                    Some(body) => self.handle_incoming(body).await,
                    None => break,
                },
                data = user_rx.recv() => match data {
                    Some(data) => {
                        if let Err(err) = self.session.send(data) {
                            tracing::debug!("session {} channel send rejected: {}", self.id(), err);
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    self.log_gap();
                    self.send_info();
                    if self.check_state() || self.check_remote_liveness() {
                        break;
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }

        self.finalize(incoming_rx, user_rx).await;
    }

    fn id(&self) -> SessionId {
        self.session.shared.id
    }

    async fn handle_incoming(&mut self, body: Bytes) {
        match Packet::decode(body) {
            Ok(Packet::Data { serial, payload }) => self.handle_data(serial, payload).await,
            Ok(Packet::State { code, finish_at }) => self.handle_state(code, finish_at).await,
            Ok(Packet::Info(info)) => self.handle_info(info),
            Err(err) => {
                tracing::debug!("session {} dropped malformed packet: {}", self.id(), err);
            }
        }
    }

    /// Reassembly: deliver in-order, buffer ahead-of-order, drop the rest.
    async fn handle_data(&mut self, serial: Serial, payload: Bytes) {
        self.session.shared.incoming_data_count.fetch_add(1, Ordering::AcqRel);

        if self.session.shared.read_state.load() == StreamState::Abort {
            return; // read half aborted, inbound data is discarded
        }

        let expected = self.session.shared.incoming_serial.load(Ordering::Acquire);
        if serial == expected {
            self.push_data(serial, payload).await;
            self.session.shared.incoming_serial.store(expected + 1, Ordering::Release);
        } else if serial > expected {
            self.reorder.push(serial, payload);
        }
        // serials below `expected` are duplicates of delivered data

        if serial > self.session.shared.max_incoming_serial.load(Ordering::Acquire) {
            self.session.shared.max_incoming_serial.store(serial, Ordering::Release);
        }

        loop {
            let expected = self.session.shared.incoming_serial.load(Ordering::Acquire);
            match self.reorder.pop_next(expected) {
                Some(pending) => {
                    self.push_data(pending.serial, pending.payload).await;
                    self.session.shared.incoming_serial.store(expected + 1, Ordering::Release);
                }
                None => break,
            }
        }
    }

    /// Hand one in-order packet to the delivery worker and run the
    /// delivery-driven half-close hooks.
    async fn push_data(&self, serial: Serial, payload: Bytes) {
        let shared = Arc::clone(&self.session.shared);
        let len = payload.len() as u64;
        self.push_message(Message::data(payload)).await;

        if shared.remote_read_state.load() == StreamState::Finish
            && serial >= self.remote_read_finish_at
            && shared.send_state.transition(StreamState::Finish)
        {
            self.push_state(StateCode::FinishRead).await;
        }
        if shared.remote_send_state.load() == StreamState::Finish
            && serial >= self.remote_send_finish_at
            && shared.read_state.transition(StreamState::Finish)
        {
            self.push_state(StateCode::AbortSend).await;
        }
        shared.bytes_read.fetch_add(len, Ordering::AcqRel);
    }

    async fn handle_state(&mut self, code: StateCode, finish_at: Option<Serial>) {
        let shared = Arc::clone(&self.session.shared);
        match code {
            StateCode::FinishSend => {
                shared.remote_send_state.store(StreamState::Finish);
                self.remote_send_finish_at = finish_at.unwrap_or(0);
                let expected = shared.incoming_serial.load(Ordering::Acquire);
                if expected >= self.remote_send_finish_at
                    && shared.read_state.transition(StreamState::Finish)
                {
                    self.push_state(StateCode::FinishSend).await;
                }
            }
            StateCode::FinishRead => {
                shared.remote_read_state.store(StreamState::Finish);
                self.remote_read_finish_at = finish_at.unwrap_or(0);
                let expected = shared.incoming_serial.load(Ordering::Acquire);
                if expected >= self.remote_read_finish_at
                    && shared.send_state.transition(StreamState::Finish)
                {
                    self.push_state(StateCode::FinishRead).await;
                }
            }
            StateCode::AbortSend => {
                // peer dropped its send half: all further inbound data is void
                shared.remote_send_state.store(StreamState::Abort);
                if shared.read_state.transition(StreamState::Abort) {
                    self.push_state(StateCode::AbortSend).await;
                }
            }
            StateCode::AbortRead => {
                // peer dropped its read half: all further outbound data is void
                shared.remote_read_state.store(StreamState::Abort);
                if shared.send_state.transition(StreamState::Abort) {
                    self.push_state(StateCode::AbortRead).await;
                }
            }
            StateCode::Stop => {
                tracing::debug!("session {} dropped STATE packet with local-only code", self.id());
            }
        }
    }

    fn handle_info(&mut self, info: InfoPayload) {
        if info.timestamp < self.last_remote_heartbeat {
            return; // stale
        }
        let shared = &self.session.shared;
        shared.remote_bytes_read.store(info.bytes_read, Ordering::Release);
        shared.remote_bytes_sent.store(info.bytes_sent, Ordering::Release);
        shared.remote_incoming_serial.store(info.incoming_serial, Ordering::Release);
        shared
            .remote_max_incoming_serial
            .store(info.max_incoming_serial, Ordering::Release);
        self.last_remote_heartbeat = info.timestamp;
        self.last_remote_seen = Some(Instant::now());
    }

    async fn push_state(&self, code: StateCode) {
        self.push_message(Message::state(code)).await;
    }

    async fn push_message(&self, message: Message) {
        if self.producer.send(message).await.is_err() {
            tracing::debug!("session {} delivery worker gone, message dropped", self.id());
        }
    }

    fn log_gap(&self) {
        let shared = &self.session.shared;
        let cur = shared.incoming_serial.load(Ordering::Acquire);
        let max = shared.max_incoming_serial.load(Ordering::Acquire);
        if cur < max {
            tracing::debug!(
                "session {} packet gap {} {} {}",
                self.id(),
                cur,
                max,
                shared.incoming_data_count.load(Ordering::Acquire)
            );
        }
    }

    fn send_info(&self) {
        let shared = &self.session.shared;
        let info = InfoPayload {
            timestamp: unix_now(),
            incoming_serial: shared.incoming_serial.load(Ordering::Acquire),
            max_incoming_serial: shared.max_incoming_serial.load(Ordering::Acquire),
            bytes_read: shared.bytes_read.load(Ordering::Acquire),
            bytes_sent: shared.bytes_sent.load(Ordering::Acquire),
        };
        self.session.enqueue(SendTag::Info, Packet::Info(info).encode());
    }

    fn check_state(&self) -> bool {
        let shared = &self.session.shared;
        if shared.send_state.load().is_closed() && shared.read_state.load().is_closed() {
            tracing::debug!("session {} both halves closed, stopping", self.id());
            return true;
        }
        false
    }

    fn check_remote_liveness(&self) -> bool {
        if let Some(last_seen) = self.last_remote_seen {
            if last_seen.elapsed() > self.config.liveness_timeout {
                tracing::warn!("session {} remote lost, stopping", self.id());
                return true;
            }
        }
        false
    }

    /// Teardown, in order: final stop message, close the byte channels, let
    /// the delivery worker drain out, tell the pool, flip the latch.
    async fn finalize(
        self,
        mut incoming_rx: mpsc::UnboundedReceiver<Bytes>,
        mut user_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        tracing::debug!("session {} stop", self.id());
        self.session.shared.closed.store(true, Ordering::Release);
        self.push_state(StateCode::Stop).await;
        incoming_rx.close();
        user_rx.close();
        drop(self.producer);
        if let Some(notify) = &self.session.shared.stop_notify {
            let _ = notify.send(self.session.clone());
        }
        self.session.shared.stopped_tx.send_replace(true);
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
