//! Data-path behavior: reassembly order, duplicate handling, framing of
//! outbound packets, and send admission.

use std::time::Duration;

use bytes::Bytes;
use sesstrans::{
    Message, Packet, PoolHandle, SendTag, Session, SessionConfig, SessionError, StateCode,
    StreamState, ToSend,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_pool() -> (PoolHandle, flume::Receiver<ToSend>, flume::Receiver<ToSend>) {
    let (send_tx, send_rx) = flume::unbounded();
    let (info_tx, info_rx) = flume::unbounded();
    (PoolHandle::new(send_tx, info_tx), send_rx, info_rx)
}

fn data_packet(serial: u32, payload: &str) -> Bytes {
    Packet::Data { serial, payload: Bytes::copy_from_slice(payload.as_bytes()) }.encode()
}

async fn recv(messages: &mut mpsc::Receiver<Message>) -> Message {
    timeout(Duration::from_secs(2), messages.recv())
        .await
        .expect("timed out waiting for message")
        .expect("message channel closed")
}

async fn expect_data(messages: &mut mpsc::Receiver<Message>, payload: &str) {
    match recv(messages).await {
        Message::Data { data, .. } => assert_eq!(&data[..], payload.as_bytes()),
        other => panic!("expected data {payload:?}, got {other:?}"),
    }
}

async fn expect_state(messages: &mut mpsc::Receiver<Message>, code: StateCode) {
    match recv(messages).await {
        Message::State { code: got, .. } => assert_eq!(got, code),
        other => panic!("expected state {code:?}, got {other:?}"),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn delivers_in_order_arrivals() {
    let (pool, _send_rx, _info_rx) = test_pool();
    let session = Session::new(1, pool, SessionConfig::default());
    let mut messages = session.messages().expect("first take");
    let incoming = session.incoming_sender();

    for (serial, payload) in [(1, "a"), (2, "b"), (3, "c")] {
        incoming.send(data_packet(serial, payload)).unwrap();
    }
    for payload in ["a", "b", "c"] {
        expect_data(&mut messages, payload).await;
    }

    session.stop().await;
}

#[tokio::test]
async fn reorders_out_of_order_arrivals() {
    let (pool, _send_rx, _info_rx) = test_pool();
    let session = Session::new(2, pool, SessionConfig::default());
    let mut messages = session.messages().unwrap();
    let incoming = session.incoming_sender();

    for (serial, payload) in [(3, "c"), (1, "a"), (2, "b")] {
        incoming.send(data_packet(serial, payload)).unwrap();
    }
    for payload in ["a", "b", "c"] {
        expect_data(&mut messages, payload).await;
    }

    wait_until(|| session.stats().incoming_serial == 4).await;
    assert_eq!(session.stats().max_incoming_serial, 3);
    session.stop().await;
}

#[tokio::test]
async fn drops_duplicate_and_obsolete_serials() {
    let (pool, _send_rx, _info_rx) = test_pool();
    let session = Session::new(3, pool, SessionConfig::default());
    let mut messages = session.messages().unwrap();
    let incoming = session.incoming_sender();

    for (serial, payload) in [(1, "a"), (1, "a"), (2, "b")] {
        incoming.send(data_packet(serial, payload)).unwrap();
    }
    expect_data(&mut messages, "a").await;
    expect_data(&mut messages, "b").await;

    // the duplicate produced no message and did not count toward BytesRead
    wait_until(|| session.stats().bytes_read == 2).await;
    let stats = session.stats();
    assert_eq!(stats.incoming_serial, 3);
    assert_eq!(stats.incoming_data_count, 3);

    session.stop().await;
    match recv(&mut messages).await {
        Message::State { code, .. } => assert_eq!(code, StateCode::Stop),
        other => panic!("expected stop, got {other:?}"),
    }
}

#[tokio::test]
async fn finish_send_carries_current_serial() {
    let (pool, send_rx, _info_rx) = test_pool();
    let session = Session::new(4, pool, SessionConfig::default());

    for i in 0..5u8 {
        session.send(Bytes::copy_from_slice(&[i])).unwrap();
    }
    session.finish_send();

    let mut sent = Vec::new();
    while let Ok(to_send) = send_rx.try_recv() {
        sent.push(to_send);
    }
    assert_eq!(sent.len(), 6);
    for (i, to_send) in sent[..5].iter().enumerate() {
        assert_eq!(to_send.tag, SendTag::Data);
        match Packet::decode(to_send.payload.clone()).unwrap() {
            Packet::Data { serial, .. } => assert_eq!(serial, i as u32 + 1),
            other => panic!("expected data packet, got {other:?}"),
        }
    }
    assert_eq!(sent[5].tag, SendTag::State);
    match Packet::decode(sent[5].payload.clone()).unwrap() {
        Packet::State { code, finish_at } => {
            assert_eq!(code, StateCode::FinishSend);
            assert_eq!(finish_at, Some(5));
        }
        other => panic!("expected state packet, got {other:?}"),
    }

    let stats = session.stats();
    assert_eq!(stats.send_state, StreamState::Finish);
    assert_eq!(stats.bytes_sent, 5);
    session.stop().await;
}

#[tokio::test]
async fn send_rejected_after_remote_read_abort() {
    let (pool, send_rx, _info_rx) = test_pool();
    let session = Session::new(5, pool, SessionConfig::default());
    let mut messages = session.messages().unwrap();

    session
        .incoming_sender()
        .send(Packet::State { code: StateCode::AbortRead, finish_at: None }.encode())
        .unwrap();
    expect_state(&mut messages, StateCode::AbortRead).await;

    assert_eq!(session.send(Bytes::from("x")), Err(SessionError::RemoteAborted));
    let stats = session.stats();
    assert_eq!(stats.bytes_sent, 0);
    assert_eq!(stats.remote_read_state, StreamState::Abort);
    // a remote read abort also aborts the local send half
    assert_eq!(stats.send_state, StreamState::Abort);
    assert!(send_rx.try_recv().is_err(), "nothing was enqueued");

    session.stop().await;
}

#[tokio::test]
async fn send_rejected_after_local_finish_send() {
    let (pool, send_rx, _info_rx) = test_pool();
    let session = Session::new(6, pool, SessionConfig::default());

    session.send(Bytes::from("x")).unwrap();
    session.finish_send();
    assert_eq!(
        session.send(Bytes::from("y")),
        Err(SessionError::SendHalfClosed { state: StreamState::Finish })
    );

    // one data packet plus the finish; the rejected send left no trace
    assert_eq!(send_rx.len(), 2);
    assert_eq!(session.stats().bytes_sent, 1);
    session.stop().await;
}

#[tokio::test]
async fn input_channel_forwards_to_send() {
    let (pool, send_rx, _info_rx) = test_pool();
    let session = Session::new(7, pool, SessionConfig::default());

    session.input().send(Bytes::from("hello")).unwrap();

    let to_send = timeout(Duration::from_secs(2), send_rx.recv_async())
        .await
        .expect("timed out")
        .expect("queue closed");
    assert_eq!(to_send.tag, SendTag::Data);
    assert_eq!(to_send.session.id(), 7);
    match Packet::decode(to_send.payload).unwrap() {
        Packet::Data { serial, payload } => {
            assert_eq!(serial, 1);
            assert_eq!(&payload[..], b"hello");
        }
        other => panic!("expected data packet, got {other:?}"),
    }
    session.stop().await;
}

#[tokio::test]
async fn serials_unique_across_concurrent_senders() {
    let (pool, send_rx, _info_rx) = test_pool();
    let session = Session::new(8, pool, SessionConfig::default());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                session.send(Bytes::from_static(b"x")).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut serials = Vec::new();
    while let Ok(to_send) = send_rx.try_recv() {
        match Packet::decode(to_send.payload).unwrap() {
            Packet::Data { serial, .. } => serials.push(serial),
            other => panic!("expected data packet, got {other:?}"),
        }
    }
    serials.sort_unstable();
    assert_eq!(serials, (1..=200).collect::<Vec<u32>>());
    assert_eq!(session.stats().bytes_sent, 200);
    session.stop().await;
}

#[tokio::test]
async fn malformed_inbound_packets_are_ignored() {
    let (pool, _send_rx, _info_rx) = test_pool();
    let session = Session::new(9, pool, SessionConfig::default());
    let mut messages = session.messages().unwrap();
    let incoming = session.incoming_sender();

    incoming.send(Bytes::from_static(&[0xFF, 1, 2, 3])).unwrap();
    incoming.send(Bytes::from_static(&[0x01, 0, 0])).unwrap();
    incoming.send(Bytes::new()).unwrap();
    incoming.send(data_packet(1, "still alive")).unwrap();

    expect_data(&mut messages, "still alive").await;
    session.stop().await;
}
