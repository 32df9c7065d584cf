use super::ClientState;
use crate::connection::Connection;
use crate::message_center::MessageCenter;
use crate::sender::{handle_serialization_failure, SenderQueue};
use crate::shutdown::ShutdownSignal;
use silo_codec::{frame_encoded, EncodedMessage, FramingMode};
use silo_types::{Direction, GrainId, Message, RejectionType};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Work item of a gateway sender. `msg: None` asks the sender to drain the
/// client's pending queue after a reconnect.
#[derive(Debug)]
pub struct OutgoingClientMessage {
    pub client: GrainId,
    pub msg: Option<Message>,
}

/// Gateway sender loop.
///
/// Messages for a disconnected client are parked on the client's pending
/// queue, unserialized, and sent in order once the client reconnects. A
/// failed write closes the client's connection and parks the messages again;
/// nothing is ever retried through the outbound queue.
///
/// With batching enabled, consecutive messages for one client (and pending
/// messages drained after a reconnect) share one batched frame.
pub async fn run_gateway_sender(
    name: String,
    center: Arc<MessageCenter>,
    mut queue: SenderQueue<OutgoingClientMessage>,
    mut shutdown: ShutdownSignal,
) {
    debug!(agent = %name, "gateway sender started");
    let batch_size = center.messaging_config().batch_size().max(1);
    let mut carried: Option<OutgoingClientMessage> = None;

    loop {
        let first = match carried.take() {
            Some(item) => item,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    next = queue.next() => next,
                };
                let Some(item) = next else { break };
                item
            }
        };

        let client = first.client;
        let mut msgs: Vec<Message> = first.msg.into_iter().collect();
        if !msgs.is_empty() {
            while msgs.len() < batch_size {
                let Some(item) = queue.try_next() else { break };
                match item.msg {
                    Some(msg) if item.client == client => msgs.push(msg),
                    msg => {
                        carried = Some(OutgoingClientMessage {
                            client: item.client,
                            msg,
                        });
                        break;
                    }
                }
            }
        }

        process(&name, &center, client, msgs, batch_size).await;
    }
    debug!(agent = %name, "gateway sender stopped");
}

/// Deliver `msgs` to `client`; an empty batch only drains the pending queue.
async fn process(name: &str, center: &MessageCenter, client_id: GrainId, msgs: Vec<Message>, batch_size: usize) {
    let Some(gateway) = center.gateway() else {
        return;
    };

    let Some(client) = gateway.client(&client_id) else {
        for msg in msgs {
            reject_unknown_client(name, center, client_id, msg);
        }
        return;
    };

    if !client.is_connected() {
        for msg in msgs {
            trace!(client = %client_id, message = %msg, "client disconnected, queued for later");
            client.push_pending(msg);
        }
        return;
    }

    if client.pending_count() > 0 {
        for msg in msgs {
            client.push_pending(msg);
        }
        drain(center, &client, batch_size).await;
        return;
    }

    if msgs.is_empty() {
        return;
    }
    match client.connection() {
        Some(connection) => {
            if let Err(unsent) = send(center, &connection, msgs).await {
                trace!(client = %client_id, messages = unsent.len(), "send failed, queued for later");
                client.requeue_pending(unsent);
            }
        }
        None => {
            for msg in msgs {
                client.push_pending(msg);
            }
        }
    }
}

fn reject_unknown_client(name: &str, center: &MessageCenter, client: GrainId, msg: Message) {
    info!(agent = name, client = %client, message = %msg, "trying to send to an unrecognized client");
    center.stats().on_send_failure();
    if msg.direction == Direction::Request {
        center.stats().on_rejection_sent();
        let rejection = msg.create_rejection(RejectionType::FutureTransient, format!("Unknown client {}", client));
        center.send_message(rejection);
    } else {
        center.stats().on_dropped();
    }
}

async fn drain(center: &MessageCenter, client: &ClientState, batch_size: usize) {
    while let Some(connection) = client.connection() {
        let msgs = client.take_pending(batch_size);
        if msgs.is_empty() {
            return;
        }
        if let Err(unsent) = send(center, &connection, msgs).await {
            client.requeue_pending(unsent);
            return;
        }
    }
}

/// Write `msgs` to the client in one frame. Hands the messages back when the
/// write fails. Messages that cannot be serialized are rejected, converted
/// to error responses or dropped, and never handed back.
async fn send(center: &MessageCenter, connection: &Connection, msgs: Vec<Message>) -> Result<(), Vec<Message>> {
    let stats = center.stats();
    let mut encoded: Vec<EncodedMessage> = Vec::with_capacity(msgs.len());
    let mut ready = Vec::with_capacity(msgs.len());
    for msg in msgs {
        match center.codec().encode(&msg) {
            Ok(bytes) => {
                encoded.push(bytes);
                ready.push(msg);
            }
            Err(e) => handle_serialization_failure(center, msg, &e),
        }
    }
    if ready.is_empty() {
        return Ok(());
    }

    let mode = center.framing_mode();
    let frame = match frame_encoded(&encoded, mode) {
        Ok(frame) => frame,
        Err(e) => {
            for msg in ready {
                handle_serialization_failure(center, msg, &e);
            }
            return Ok(());
        }
    };

    let failure = match connection.write_frame(&frame).await {
        Ok(written) if written == frame.len => None,
        Ok(written) => Some(format!(
            "byte count mismatch on send: sent {}, expected {}",
            written, frame.len
        )),
        Err(e) => Some(e.to_string()),
    };

    match failure {
        None => {
            for (msg, bytes) in ready.iter().zip(&encoded) {
                stats.on_message_sent(msg.category, bytes.total_len());
            }
            if mode == FramingMode::Batched {
                stats.on_batch_sent(ready.len());
            }
            Ok(())
        }
        Some(reason) => {
            warn!(peer = %connection.remote(), error = %reason, "exception sending to client");
            stats.on_send_failure();
            if let Some(gateway) = center.gateway() {
                gateway.record_closed_socket(connection.key());
            }
            connection.close().await;
            Err(ready)
        }
    }
}
