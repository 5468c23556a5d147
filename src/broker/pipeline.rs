//! Per-channel fan-out pipeline
//!
//! One pipeline per channel: accept the single producer connection from the
//! transcoder, read payloads, and push each payload to every attached
//! subscriber. Dispatches to distinct subscribers run concurrently behind a
//! per-payload barrier, so a slow sink defines that tick's latency but the
//! broker never reorders, drops for others, or replays history to late
//! joiners.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use super::channel::{Channel, Subscriber};

/// Why the read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineEnd {
    /// Producer closed the connection (zero-byte read)
    ProducerEof,
    /// Producer socket error
    ProducerError,
    /// Channel cancellation (teardown or shutdown)
    Cancelled,
    /// Listener failed before a producer arrived
    AcceptFailed,
}

/// Run the fan-out pipeline for one channel
///
/// Consumes the channel's listener: exactly one producer connection is ever
/// accepted. Returns once the producer stream ends, the socket errors, or the
/// channel is cancelled; the caller decides what teardown follows.
pub(crate) async fn run(
    channel: Arc<Channel>,
    listener: TcpListener,
    buffer_size: usize,
) -> PipelineEnd {
    let cancel = channel.cancel_token();

    let (mut producer, peer) = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(channel = %channel.key(), "Pipeline cancelled before producer arrived");
            return PipelineEnd::Cancelled;
        }
        accepted = listener.accept() => match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(channel = %channel.key(), error = %e, "Producer accept failed");
                return PipelineEnd::AcceptFailed;
            }
        }
    };

    // Single-use intake: dropping the listener guarantees no second producer.
    drop(listener);
    channel.set_producer_connected();
    tracing::info!(
        channel = %channel.key(),
        peer = %peer,
        "Producer connected, broadcast loop starting"
    );

    let mut buf = vec![0u8; buffer_size];
    let end = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break PipelineEnd::Cancelled,
            read = producer.read(&mut buf) => match read {
                Ok(0) => break PipelineEnd::ProducerEof,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(channel = %channel.key(), error = %e, "Producer read error");
                    break PipelineEnd::ProducerError;
                }
            }
        };

        channel.record_relayed(n);
        channel.touch();

        let payload = Bytes::copy_from_slice(&buf[..n]);
        broadcast(&channel, payload).await;
    };

    tracing::info!(channel = %channel.key(), reason = ?end, "Broadcast loop ended");
    end
}

/// Push one payload to every open subscriber, evicting the dead
///
/// The subscriber lock is held across the whole tick, so membership is stable
/// while the scatter is in flight and late attachers see the next payload
/// onward.
async fn broadcast(channel: &Channel, payload: Bytes) {
    let mut subs = channel.lock_subscribers().await;
    if subs.is_empty() {
        return;
    }

    let sends = subs
        .iter_mut()
        .map(|sub| {
            let payload = payload.clone();
            async move {
                if !sub.sink.is_open() {
                    return false;
                }
                match sub.sink.send_binary(payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(
                            subscriber = %sub.id,
                            error = %e,
                            "Subscriber send failed"
                        );
                        false
                    }
                }
            }
        })
        .collect::<Vec<_>>();

    let delivered = join_all(sends).await;

    let mut dead: Vec<Subscriber> = Vec::new();
    for (idx, ok) in delivered.into_iter().enumerate().rev() {
        if !ok {
            dead.push(subs.remove(idx));
        }
    }
    channel.sync_subscriber_count(subs.len());
    drop(subs);

    for mut sub in dead {
        tracing::info!(
            channel = %channel.key(),
            subscriber = %sub.id,
            "Evicting dead subscriber"
        );
        sub.sink.close().await;
    }
}

/// Build a subscriber record; ids come from the registry
pub(crate) fn subscriber(id: String, sink: Box<dyn super::sink::SubscriberSink>) -> Subscriber {
    Subscriber {
        id,
        sink,
        attached_at: Instant::now(),
    }
}
