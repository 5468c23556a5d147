//! Per-channel state
//!
//! A [`Channel`] is the broker's record of one transcoder pipeline: the
//! leased loopback port, the single-use producer listener, the supervised
//! process, and the subscribers currently attached. Channels are shared as
//! `Arc<Channel>` between the registry, the fan-out pipeline, the exit
//! watcher, and the reaper; interior mutability follows the access pattern
//! (atomics for counters and flags, a sync mutex for scalar state, an async
//! mutex for the subscriber collection held across broadcast barriers).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::source::ChannelKey;
use crate::supervisor::{ExitInfo, TranscoderProcess};

use super::sink::SubscriberSink;

/// Lifecycle state of a channel's transcoder
///
/// Transitions are monotonic: once a terminal state (`ExitedNormally`,
/// `ExitedWithError`, `Killed`) is reached it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Process launched, startup probe not yet passed
    Starting,
    /// Process alive past the startup probe
    Running,
    /// Process exited with code 0
    ExitedNormally,
    /// Process exited with a non-zero code (or was killed externally)
    ExitedWithError,
    /// Broker force-killed the process
    Killed,
}

impl ChannelStatus {
    /// Whether this state ends the channel's life
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChannelStatus::ExitedNormally | ChannelStatus::ExitedWithError | ChannelStatus::Killed
        )
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelStatus::Starting => "starting",
            ChannelStatus::Running => "running",
            ChannelStatus::ExitedNormally => "exited",
            ChannelStatus::ExitedWithError => "exited-with-error",
            ChannelStatus::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// One attached subscriber
pub struct Subscriber {
    /// Locally unique 8-hex-char identifier
    pub id: String,
    /// Transport handed over by the subscriber layer
    pub sink: Box<dyn SubscriberSink>,
    /// When the subscriber attached
    pub attached_at: Instant,
}

/// Broker-side state for one transcoder pipeline
pub struct Channel {
    key: ChannelKey,
    port: u16,
    created_at: Instant,
    cancel: CancellationToken,
    process: std::sync::Arc<dyn TranscoderProcess>,

    listener: Mutex<Option<TcpListener>>,
    status: Mutex<ChannelStatus>,
    exit_info: Mutex<Option<ExitInfo>>,
    last_access: Mutex<Instant>,

    subscribers: tokio::sync::Mutex<Vec<Subscriber>>,
    subscriber_count: AtomicU32,

    producer_connected: AtomicBool,
    broadcast_running: AtomicBool,
    torn_down: AtomicBool,

    bytes_relayed: AtomicU64,
    payloads_relayed: AtomicU64,
}

impl Channel {
    /// Create a channel in `Starting` state
    pub(crate) fn new(
        key: ChannelKey,
        port: u16,
        listener: TcpListener,
        process: std::sync::Arc<dyn TranscoderProcess>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            port,
            created_at: now,
            cancel,
            process,
            listener: Mutex::new(Some(listener)),
            status: Mutex::new(ChannelStatus::Starting),
            exit_info: Mutex::new(None),
            last_access: Mutex::new(now),
            subscribers: tokio::sync::Mutex::new(Vec::new()),
            subscriber_count: AtomicU32::new(0),
            producer_connected: AtomicBool::new(false),
            broadcast_running: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            bytes_relayed: AtomicU64::new(0),
            payloads_relayed: AtomicU64::new(0),
        }
    }

    /// The channel's key
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// The leased loopback port the transcoder writes to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The supervised transcoder process
    pub(crate) fn process(&self) -> std::sync::Arc<dyn TranscoderProcess> {
        std::sync::Arc::clone(&self.process)
    }

    /// Cancellation token shared with the fan-out pipeline
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current status
    pub fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the status; refused once a terminal state was reached
    pub(crate) fn advance_status(&self, next: ChannelStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.is_terminal() {
            return false;
        }
        *status = next;
        true
    }

    /// Record the process exit details
    pub(crate) fn record_exit(&self, info: ExitInfo) {
        let next = if info.success() {
            ChannelStatus::ExitedNormally
        } else {
            ChannelStatus::ExitedWithError
        };
        self.advance_status(next);
        *self.exit_info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    /// Exit details once the process is gone
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take the producer listener; the pipeline consumes it exactly once
    pub(crate) fn take_listener(&self) -> Option<TcpListener> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Drop the listener if the pipeline never consumed it
    pub(crate) fn drop_listener(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Refresh the idle clock; called on attach, detach, and successful reads
    pub(crate) fn touch(&self) {
        *self.last_access.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time since the channel was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last attach, detach, or producer read
    pub fn idle(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> u32 {
        self.subscriber_count.load(Ordering::Relaxed)
    }

    /// Whether the producer has connected
    pub fn producer_connected(&self) -> bool {
        self.producer_connected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_producer_connected(&self) {
        self.producer_connected.store(true, Ordering::Relaxed);
    }

    /// Claim the right to start the fan-out pipeline; first caller wins
    pub(crate) fn claim_broadcast_start(&self) -> bool {
        !self.broadcast_running.swap(true, Ordering::AcqRel)
    }

    /// Whether the fan-out pipeline is currently running
    pub fn broadcast_running(&self) -> bool {
        self.broadcast_running.load(Ordering::Relaxed)
    }

    /// Mark the fan-out pipeline as wound down
    pub(crate) fn set_broadcast_finished(&self) {
        self.broadcast_running.store(false, Ordering::Release);
    }

    /// Claim teardown; only the first caller proceeds
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Whether teardown has been claimed
    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn record_relayed(&self, bytes: usize) {
        self.bytes_relayed
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.payloads_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a subscriber; refused once teardown has started
    pub(crate) async fn add_subscriber(&self, subscriber: Subscriber) -> bool {
        let mut subs = self.subscribers.lock().await;
        if self.is_torn_down() {
            return false;
        }
        subs.push(subscriber);
        self.subscriber_count
            .store(subs.len() as u32, Ordering::Relaxed);
        self.touch();
        true
    }

    /// Remove a subscriber by id, returning it to the caller
    pub(crate) async fn remove_subscriber(&self, id: &str) -> Option<Subscriber> {
        let mut subs = self.subscribers.lock().await;
        let pos = subs.iter().position(|s| s.id == id)?;
        let removed = subs.remove(pos);
        self.subscriber_count
            .store(subs.len() as u32, Ordering::Relaxed);
        self.touch();
        Some(removed)
    }

    /// Whether a subscriber id is already taken
    pub(crate) async fn has_subscriber(&self, id: &str) -> bool {
        self.subscribers.lock().await.iter().any(|s| s.id == id)
    }

    /// Remove every subscriber; used by teardown
    pub(crate) async fn drain_subscribers(&self) -> Vec<Subscriber> {
        let mut subs = self.subscribers.lock().await;
        self.subscriber_count.store(0, Ordering::Relaxed);
        std::mem::take(&mut *subs)
    }

    /// Exclusive access to the subscriber collection for one broadcast tick
    pub(crate) async fn lock_subscribers(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().await
    }

    /// Resync the cached count after in-broadcast eviction
    pub(crate) fn sync_subscriber_count(&self, len: usize) {
        self.subscriber_count.store(len as u32, Ordering::Relaxed);
    }

    /// Point-in-time view of the channel
    pub fn snapshot(&self) -> ChannelSnapshot {
        let exit = self.exit_info();
        ChannelSnapshot {
            key: self.key.clone(),
            status: self.status(),
            local_port: self.port,
            subscriber_count: self.subscriber_count(),
            producer_connected: self.producer_connected(),
            age: self.age(),
            idle: self.idle(),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            payloads_relayed: self.payloads_relayed.load(Ordering::Relaxed),
            exit_code: exit.as_ref().and_then(|e| e.code),
            last_error: exit.and_then(|e| e.last_error),
        }
    }
}

/// Point-in-time view of a channel, as returned by `inspect`
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Channel key
    pub key: ChannelKey,
    /// Lifecycle status
    pub status: ChannelStatus,
    /// Leased loopback port
    pub local_port: u16,
    /// Attached subscriber count
    pub subscriber_count: u32,
    /// Whether the transcoder connected its producer socket
    pub producer_connected: bool,
    /// Time since creation
    pub age: Duration,
    /// Time since last attach/detach/read
    pub idle: Duration,
    /// Total payload bytes relayed
    pub bytes_relayed: u64,
    /// Total payloads relayed
    pub payloads_relayed: u64,
    /// Exit code, when the transcoder is gone
    pub exit_code: Option<i32>,
    /// Last stderr error line, when one was seen
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::supervisor::{SimulatedLauncher, TranscoderJob, TranscoderLauncher};

    async fn test_channel() -> (Channel, SimulatedLauncher) {
        let launcher = SimulatedLauncher::new();
        let job = TranscoderJob {
            source_url: "rtsp://u:p@10.0.0.1:554/Streaming/Channels/101".to_string(),
            width: 640,
            height: 480,
            output_port: 0,
        };
        let process = launcher.launch(&job).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let channel = Channel::new(
            ChannelKey::new("10.0.0.1_554_1_1_640_480"),
            listener.local_addr().unwrap().port(),
            listener,
            Arc::from(process),
            CancellationToken::new(),
        );
        (channel, launcher)
    }

    #[tokio::test]
    async fn test_status_is_monotonic() {
        let (channel, _launcher) = test_channel().await;

        assert_eq!(channel.status(), ChannelStatus::Starting);
        assert!(channel.advance_status(ChannelStatus::Running));
        assert!(channel.advance_status(ChannelStatus::Killed));

        // Terminal states never re-open.
        assert!(!channel.advance_status(ChannelStatus::Running));
        assert_eq!(channel.status(), ChannelStatus::Killed);
    }

    #[tokio::test]
    async fn test_record_exit_maps_code_to_status() {
        let (channel, _launcher) = test_channel().await;
        channel.record_exit(ExitInfo {
            code: Some(0),
            exited_at: Instant::now(),
            last_error: None,
        });
        assert_eq!(channel.status(), ChannelStatus::ExitedNormally);

        let (channel, _launcher) = test_channel().await;
        channel.record_exit(ExitInfo {
            code: Some(1),
            exited_at: Instant::now(),
            last_error: Some("connection refused".to_string()),
        });
        assert_eq!(channel.status(), ChannelStatus::ExitedWithError);
        assert_eq!(
            channel.snapshot().last_error.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn test_listener_is_single_use() {
        let (channel, _launcher) = test_channel().await;

        assert!(channel.take_listener().is_some());
        assert!(channel.take_listener().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_membership() {
        let (channel, _launcher) = test_channel().await;
        let (sink, _rx) = super::super::sink::MpscSink::new();

        let added = channel
            .add_subscriber(Subscriber {
                id: "ab12cd34".to_string(),
                sink: Box::new(sink),
                attached_at: Instant::now(),
            })
            .await;

        assert!(added);
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.has_subscriber("ab12cd34").await);

        assert!(channel.remove_subscriber("ab12cd34").await.is_some());
        assert!(channel.remove_subscriber("ab12cd34").await.is_none());
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_attach_refused_after_teardown_claim() {
        let (channel, _launcher) = test_channel().await;
        let (sink, _rx) = super::super::sink::MpscSink::new();

        assert!(channel.claim_teardown());
        assert!(!channel.claim_teardown());

        let added = channel
            .add_subscriber(Subscriber {
                id: "ab12cd34".to_string(),
                sink: Box::new(sink),
                attached_at: Instant::now(),
            })
            .await;
        assert!(!added);
    }

    #[tokio::test]
    async fn test_touch_resets_idle() {
        let (channel, _launcher) = test_channel().await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(channel.idle() >= Duration::from_millis(20));

        channel.touch();
        assert!(channel.idle() < Duration::from_millis(20));
    }
}
