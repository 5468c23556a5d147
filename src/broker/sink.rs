//! Subscriber sink seam
//!
//! The broker never owns subscriber transports. The HTTP/WS layer hands it a
//! boxed [`SubscriberSink`] per attach; the broker pushes binary payloads,
//! probes liveness, and closes sinks it evicts during teardown.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Push-only binary consumer attached to a channel
///
/// Implementations wrap whatever transport the subscriber layer speaks
/// (typically a websocket). `send_binary` errors and a `false` liveness probe
/// both mark the subscriber dead; the broker removes it from the channel and
/// then calls `close`.
#[async_trait]
pub trait SubscriberSink: Send {
    /// Deliver one payload as a single binary frame
    async fn send_binary(&mut self, payload: Bytes) -> std::io::Result<()>;

    /// Whether the sink can still accept payloads
    fn is_open(&self) -> bool;

    /// Release the underlying transport; idempotent
    async fn close(&mut self);
}

/// Sink backed by an in-process channel
///
/// Useful in tests and demos: payloads pushed by the broker arrive on the
/// paired receiver. An optional artificial send latency makes slow-subscriber
/// behavior reproducible.
pub struct MpscSink {
    tx: mpsc::UnboundedSender<Bytes>,
    latency: Option<std::time::Duration>,
    closed: bool,
}

impl MpscSink {
    /// Create a sink and the receiver its payloads arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                latency: None,
                closed: false,
            },
            rx,
        )
    }

    /// Create a sink that sleeps before every delivery
    pub fn with_latency(
        latency: std::time::Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (mut sink, rx) = Self::new();
        sink.latency = Some(latency);
        (sink, rx)
    }
}

#[async_trait]
impl SubscriberSink for MpscSink {
    async fn send_binary(&mut self, payload: Bytes) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink closed",
            ));
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.tx.send(payload).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "receiver dropped")
        })
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.tx.is_closed()
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
