use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::message::Message;

/// Pump between the run loop and the consumer.
///
/// The run loop produces into a single-slot channel; this worker parks
/// messages in a deque so the run loop never waits on a slow consumer. New
/// messages enter at the front and the consumer is offered the back: FIFO.
///
/// When the producer side closes, the remaining buffer is drained so the
/// final stop notification still reaches a consumer that keeps reading. A
/// dropped consumer ends the worker immediately, discarding the buffer.
pub(crate) async fn deliver(mut producer: mpsc::Receiver<Message>, consumer: mpsc::Sender<Message>) {
    let mut buffer: VecDeque<Message> = VecDeque::new();
    let mut open = true;

    loop {
        if buffer.is_empty() {
            if !open {
                return;
            }
            match producer.recv().await {
                Some(message) => buffer.push_front(message),
                None => open = false,
            }
        } else if open {
            tokio::select! {
                permit = consumer.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(message) = buffer.pop_back() {
                            permit.send(message);
                        }
                    }
                    Err(_) => return,
                },
                received = producer.recv() => match received {
                    Some(message) => buffer.push_front(message),
                    None => open = false,
                },
            }
        } else {
            match consumer.reserve().await {
                Ok(permit) => {
                    if let Some(message) = buffer.pop_back() {
                        permit.send(message);
                    }
                }
                Err(_) => return,
            }
        }
    }
}
