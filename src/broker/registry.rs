//! Channel registry and broker facade
//!
//! The central registry that deduplicates transcoders by source fingerprint
//! and routes subscribers onto the matching fan-out pipeline.
//!
//! Thread-safe via `RwLock`; the two maps (channels by key, caller source ids
//! by string) and the port lease set mutate together on the paths that must
//! stay atomic, so the leased-port set always equals the ports of live
//! channels.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::ports::PortAllocator;
use crate::source::{build_source_url, ChannelKey, SourceDescriptor};
use crate::supervisor::{
    FfmpegLauncher, TranscoderJob, TranscoderLauncher, TranscoderProcess,
};

use super::channel::{Channel, ChannelSnapshot, ChannelStatus};
use super::pipeline::{self, PipelineEnd};
use super::reaper;
use super::sink::SubscriberSink;

/// Result of a successful `start`
#[derive(Debug, Clone)]
pub struct StartedStream {
    /// Key identifying the (possibly shared) channel
    pub channel_key: ChannelKey,
    /// URL the subscriber layer advertises for this channel
    pub endpoint_hint: String,
    /// Loopback port the transcoder writes to
    pub local_port: u16,
    /// Whether an existing channel was reused
    pub reused: bool,
}

struct Inner {
    channels: HashMap<ChannelKey, Arc<Channel>>,
    sources: HashMap<String, ChannelKey>,
    /// Fingerprints whose miss path is in flight. The receiver's sender is
    /// held by the owning `start` call; it settling (dropping) wakes waiters
    /// so they re-check the registry.
    pending: HashMap<ChannelKey, watch::Receiver<()>>,
}

/// The transcoder broker
///
/// Owns every channel: starts and deduplicates transcoders, attaches and
/// detaches subscribers, reaps idle and dead channels, and tears everything
/// down on shutdown. Construct with [`TranscoderBroker::new`] for the real
/// transcoder binary or [`TranscoderBroker::with_launcher`] to substitute a
/// launcher (the simulated one in tests).
pub struct TranscoderBroker {
    config: BrokerConfig,
    launcher: Arc<dyn TranscoderLauncher>,
    ports: PortAllocator,
    inner: RwLock<Inner>,
    shutdown: CancellationToken,
}

impl TranscoderBroker {
    /// Create a broker that launches the configured transcoder binary
    ///
    /// # Errors
    /// - `BrokerError::InvalidConfiguration` - config rejected by validation
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>> {
        let launcher = Arc::new(FfmpegLauncher::new(config.transcoder_bin.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Create a broker with a custom transcoder launcher
    ///
    /// # Errors
    /// - `BrokerError::InvalidConfiguration` - config rejected by validation
    pub fn with_launcher(
        config: BrokerConfig,
        launcher: Arc<dyn TranscoderLauncher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let broker = Arc::new(Self {
            ports: PortAllocator::new(config.port_range_start, config.port_range_end),
            config,
            launcher,
            inner: RwLock::new(Inner {
                channels: HashMap::new(),
                sources: HashMap::new(),
                pending: HashMap::new(),
            }),
            shutdown: CancellationToken::new(),
        });

        reaper::spawn(Arc::clone(&broker));
        Ok(broker)
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Start (or reuse) a channel for the given source
    ///
    /// Concurrent starts with the same fingerprint are serialized by an
    /// in-flight reservation, so exactly one transcoder exists per
    /// fingerprint; the registry lock itself is only held for the map
    /// lookups and mutations, never across the bind or the process launch,
    /// so starts of unrelated sources and all other broker calls proceed
    /// undisturbed. On the miss path, port lease, listener bind, and process
    /// launch form one transaction: any failure releases prior acquisitions
    /// in reverse order and nothing is left behind.
    ///
    /// # Errors
    /// - `BrokerError::TranscoderBinaryMissing` - configured binary not found
    /// - `BrokerError::NoPortAvailable` - loopback port range exhausted
    /// - `BrokerError::ListenerBindFailed` - leased port could not be bound
    /// - `BrokerError::SpawnFailed` - OS refused to start the transcoder
    pub async fn start(self: &Arc<Self>, desc: &SourceDescriptor) -> Result<StartedStream> {
        let key = desc.fingerprint();

        // Reuse an existing channel, or claim this fingerprint's miss path.
        let _settled = loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Internal {
                    reason: "broker is shut down".to_string(),
                });
            }

            let mut inner = self.inner.write().await;

            if let Some(channel) = inner.channels.get(&key) {
                let channel = Arc::clone(channel);
                inner
                    .sources
                    .insert(desc.caller_source_id.clone(), key.clone());

                tracing::info!(
                    channel = %key,
                    source_id = %desc.caller_source_id,
                    "Reusing existing channel"
                );

                return Ok(StartedStream {
                    endpoint_hint: self.config.endpoint_hint(&key),
                    local_port: channel.port(),
                    channel_key: key,
                    reused: true,
                });
            }

            // A receiver whose sender is gone is left over from an abandoned
            // start; it is replaced rather than waited on.
            let in_flight = inner
                .pending
                .get(&key)
                .filter(|pending| pending.has_changed().is_ok())
                .cloned();

            match in_flight {
                // Another start owns this fingerprint's miss path; wait for
                // it to settle, then re-check.
                Some(mut pending) => {
                    drop(inner);
                    let _ = pending.changed().await;
                }
                None => {
                    let (settled_tx, settled_rx) = watch::channel(());
                    inner.pending.insert(key.clone(), settled_rx);
                    break settled_tx;
                }
            }
        };

        // Miss path, registry lock released. Waiters on this fingerprint
        // wake when `_settled` drops, on success and failure alike.
        let outcome = self.build_channel(desc, &key).await;

        let mut inner = self.inner.write().await;
        inner.pending.remove(&key);

        let channel = match outcome {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Channel start failed");
                return Err(e);
            }
        };

        if self.shutdown.is_cancelled() {
            drop(inner);
            self.teardown_channel(&channel, "broker shut down during start")
                .await;
            return Err(BrokerError::Internal {
                reason: "broker is shut down".to_string(),
            });
        }

        inner.channels.insert(key.clone(), Arc::clone(&channel));
        inner
            .sources
            .insert(desc.caller_source_id.clone(), key.clone());
        drop(inner);

        tracing::info!(
            channel = %key,
            port = channel.port(),
            pid = ?channel.process().pid(),
            source_id = %desc.caller_source_id,
            "Channel created"
        );

        self.spawn_exit_watcher(Arc::clone(&channel));
        self.spawn_startup_probe(Arc::clone(&channel));

        Ok(StartedStream {
            endpoint_hint: self.config.endpoint_hint(&key),
            local_port: channel.port(),
            channel_key: key,
            reused: false,
        })
    }

    /// Acquire everything a new channel needs: port, listener, process
    ///
    /// Runs without the registry lock. Failures release prior acquisitions
    /// in reverse order before surfacing.
    async fn build_channel(
        &self,
        desc: &SourceDescriptor,
        key: &ChannelKey,
    ) -> Result<Arc<Channel>> {
        let port = self.ports.lease()?;

        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.ports.release(port);
                return Err(BrokerError::ListenerBindFailed { port, source: e });
            }
        };

        let job = TranscoderJob {
            source_url: build_source_url(desc),
            width: desc.width,
            height: desc.height,
            output_port: port,
        };

        let process = match self.launcher.launch(&job).await {
            Ok(process) => process,
            Err(e) => {
                drop(listener);
                self.ports.release(port);
                return Err(e);
            }
        };
        let process: Arc<dyn TranscoderProcess> = Arc::from(process);

        Ok(Arc::new(Channel::new(
            key.clone(),
            port,
            listener,
            process,
            self.shutdown.child_token(),
        )))
    }

    /// Release a caller's claim on its stream
    ///
    /// Removes only the `caller_source_id` mapping. The channel itself stays:
    /// other callers or live subscribers may still want it, and the reaper or
    /// exit-driven teardown collects it naturally.
    pub async fn stop(&self, caller_source_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.sources.remove(caller_source_id) {
            tracing::info!(
                channel = %key,
                source_id = %caller_source_id,
                "Caller released stream claim"
            );
        }
    }

    /// Attach a subscriber sink to a channel
    ///
    /// Lazily starts the fan-out pipeline. The returned id is what `detach`
    /// expects.
    ///
    /// # Errors
    /// - `BrokerError::ChannelNotFound` - no live channel under the key
    pub async fn attach(
        self: &Arc<Self>,
        key: &ChannelKey,
        sink: Box<dyn SubscriberSink>,
    ) -> Result<String> {
        let channel = self
            .channel_by_key(key)
            .await
            .ok_or_else(|| BrokerError::ChannelNotFound(key.clone()))?;

        let id = loop {
            let candidate = format!("{:08x}", rand::thread_rng().gen::<u32>());
            if !channel.has_subscriber(&candidate).await {
                break candidate;
            }
        };

        if !channel
            .add_subscriber(pipeline::subscriber(id.clone(), sink))
            .await
        {
            // Teardown won the race; the channel is as good as gone.
            return Err(BrokerError::ChannelNotFound(key.clone()));
        }

        tracing::info!(
            channel = %key,
            subscriber = %id,
            subscribers = channel.subscriber_count(),
            "Subscriber attached"
        );

        self.ensure_pipeline(&channel);
        Ok(id)
    }

    /// Detach a subscriber from a channel
    ///
    /// The sink is returned to the caller's ownership untouched; the broker
    /// only closes sinks it evicts. Unknown keys and ids are no-ops.
    pub async fn detach(&self, key: &ChannelKey, subscriber_id: &str) {
        let Some(channel) = self.channel_by_key(key).await else {
            return;
        };

        if channel.remove_subscriber(subscriber_id).await.is_some() {
            tracing::info!(
                channel = %key,
                subscriber = %subscriber_id,
                subscribers = channel.subscriber_count(),
                "Subscriber detached"
            );
        }
    }

    /// Snapshot one channel, if it exists
    pub async fn inspect(&self, key: &ChannelKey) -> Option<ChannelSnapshot> {
        Some(self.channel_by_key(key).await?.snapshot())
    }

    /// Snapshot every live channel
    pub async fn inspect_all(&self) -> Vec<ChannelSnapshot> {
        self.channels_snapshot()
            .await
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }

    /// Number of live channels
    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.channels.len()
    }

    /// Number of currently leased loopback ports
    pub fn leased_ports(&self) -> usize {
        self.ports.leased_count()
    }

    /// Tear down every channel and stop the reaper
    ///
    /// Cancels every pipeline, waits (bounded per pipeline) for the broadcast
    /// loops to wind down, then runs the teardown routine for each channel.
    /// Afterwards the registry and the leased-port set are empty and no
    /// broker-owned transcoder is running.
    pub async fn shutdown_all(&self) {
        tracing::info!("Broker shutting down");

        // Channel tokens are children of the shutdown token, so this stops
        // the reaper and cancels every pipeline in one step.
        self.shutdown.cancel();

        let channels = self.channels_snapshot().await;
        for channel in &channels {
            let wound_down = tokio::time::timeout(
                self.config.pipeline_shutdown_wait,
                async {
                    while channel.broadcast_running() {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                },
            )
            .await;

            if wound_down.is_err() {
                tracing::warn!(
                    channel = %channel.key(),
                    "Pipeline did not wind down within shutdown wait"
                );
            }
        }

        for channel in channels {
            self.teardown_channel(&channel, "broker shutdown").await;
        }
    }

    pub(crate) async fn channels_snapshot(&self) -> Vec<Arc<Channel>> {
        self.inner.read().await.channels.values().cloned().collect()
    }

    async fn channel_by_key(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.inner.read().await.channels.get(key).cloned()
    }

    /// Start the fan-out pipeline once; later calls are no-ops
    fn ensure_pipeline(self: &Arc<Self>, channel: &Arc<Channel>) {
        if !channel.claim_broadcast_start() {
            return;
        }

        let Some(listener) = channel.take_listener() else {
            // The pipeline already consumed the listener in a prior life of
            // the claim flag; nothing left to start.
            channel.set_broadcast_finished();
            return;
        };

        let broker = Arc::clone(self);
        let channel = Arc::clone(channel);
        let buffer_size = self.config.read_buffer_size;

        tokio::spawn(async move {
            let end = pipeline::run(Arc::clone(&channel), listener, buffer_size).await;
            channel.set_broadcast_finished();

            if end != PipelineEnd::Cancelled {
                broker.handle_pipeline_finished(&channel).await;
            }
        });
    }

    /// The broadcast loop ended on its own (EOF, socket error, accept error)
    async fn handle_pipeline_finished(&self, channel: &Arc<Channel>) {
        if channel.is_torn_down() {
            return;
        }

        let process = channel.process();
        if process.is_running() {
            // Producer side is gone but the transcoder lives; kill it and let
            // the exit watcher run the deferred teardown.
            tracing::info!(
                channel = %channel.key(),
                "Producer stream ended with live transcoder, terminating it"
            );
            channel.advance_status(ChannelStatus::Killed);
            process.terminate().await;
        }
    }

    /// Watch for process exit, then run the deferred teardown timeline
    fn spawn_exit_watcher(self: &Arc<Self>, channel: Arc<Channel>) {
        let broker = Arc::clone(self);

        tokio::spawn(async move {
            let mut rx = channel.process().exited();
            let info = loop {
                if let Some(info) = rx.borrow().clone() {
                    break info;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            };

            if channel.is_torn_down() {
                return;
            }

            channel.record_exit(info.clone());
            tracing::info!(
                channel = %channel.key(),
                code = ?info.code,
                last_error = ?info.last_error,
                status = %channel.status(),
                "Transcoder exit observed"
            );

            // Let the last buffered bytes flush to anyone still attached,
            // then give subscribers a bounded window to drain off.
            tokio::time::sleep(broker.config.exit_flush_wait).await;

            let deadline =
                tokio::time::Instant::now() + broker.config.exit_drain_wait;
            while channel.subscriber_count() > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(broker.config.drain_poll_interval).await;
            }

            broker.teardown_channel(&channel, "transcoder exited").await;
        });
    }

    /// Probe shortly after launch: still alive → Running + pipeline start
    fn spawn_startup_probe(self: &Arc<Self>, channel: Arc<Channel>) {
        let broker = Arc::clone(self);

        tokio::spawn(async move {
            tokio::time::sleep(broker.config.probe_delay).await;

            if channel.is_torn_down() {
                return;
            }

            if channel.process().is_running() {
                if channel.advance_status(ChannelStatus::Running) {
                    tracing::info!(
                        channel = %channel.key(),
                        "Transcoder alive past startup probe"
                    );
                }
                broker.ensure_pipeline(&channel);
            }
            // An already-dead process is the exit watcher's problem; it has
            // recorded the terminal status and queued the teardown.
        });
    }

    /// Idempotent release of everything a channel owns
    ///
    /// Ordering matters and is externally observable: producer socket and
    /// listener close first, then under the registry lock the port returns to
    /// the allocator and the registry entries disappear together, then the
    /// remaining subscriber sinks are closed. Never propagates errors.
    pub(crate) async fn teardown_channel(&self, channel: &Arc<Channel>, reason: &str) {
        if !channel.claim_teardown() {
            return;
        }

        let key = channel.key().clone();
        tracing::info!(channel = %key, reason = reason, "Tearing down channel");

        // Stops the read loop and closes the producer socket.
        channel.cancel_token().cancel();

        let process = channel.process();
        if process.is_running() {
            channel.advance_status(ChannelStatus::Killed);
            process.terminate().await;
            tracing::debug!(channel = %key, "Transcoder terminated");
        }

        // Unconsumed listener (pipeline never started).
        channel.drop_listener();
        tracing::debug!(channel = %key, "Listener closed");

        {
            let mut inner = self.inner.write().await;
            self.ports.release(channel.port());
            inner.channels.remove(&key);
            inner.sources.retain(|_, mapped| mapped != &key);
        }
        tracing::debug!(channel = %key, port = channel.port(), "Port released, registry entry removed");

        let subscribers = channel.drain_subscribers().await;
        for mut subscriber in subscribers {
            subscriber.sink.close().await;
            tracing::debug!(
                channel = %key,
                subscriber = %subscriber.id,
                "Subscriber sink closed"
            );
        }

        tracing::info!(channel = %key, "Channel torn down");
    }
}
