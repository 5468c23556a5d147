//! Idle and zombie channel collection
//!
//! A single periodic task owned by the broker. Each tick snapshots the live
//! channels under the read lock and applies the collection rules in order;
//! teardown runs outside the lock through the shared routine.

use std::sync::Arc;

use super::registry::TranscoderBroker;

/// Spawn the background reaper; stops when the broker's shutdown token fires
pub(crate) fn spawn(broker: Arc<TranscoderBroker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(broker.config().reaper_interval);

        loop {
            tokio::select! {
                _ = broker.shutdown_token().cancelled() => break,
                _ = ticker.tick() => {}
            }
            sweep(&broker).await;
        }

        tracing::debug!("Reaper stopped");
    })
}

/// Run one collection pass
///
/// Rules, applied per channel in order:
/// 1. Channels younger than the creation grace are skipped entirely.
/// 2. Dead producer (process exited or killed): collect.
/// 3. No subscribers and idle past the long threshold: collect.
/// 4. No subscribers watching a live process past the short threshold:
///    collect. The short threshold reclaims the transcoder when nobody is
///    watching while still letting detach/re-attach churn settle.
pub(crate) async fn sweep(broker: &TranscoderBroker) {
    let config = broker.config();
    let channels = broker.channels_snapshot().await;

    for channel in channels {
        if channel.age() < config.creation_grace {
            continue;
        }

        let process_running = channel.process().is_running();
        let subscribers = channel.subscriber_count();
        let idle = channel.idle();

        let reason = if !process_running {
            Some("transcoder process is gone")
        } else if subscribers == 0 && idle > config.long_idle_timeout {
            Some("idle past the long threshold")
        } else if subscribers == 0 && idle > config.short_idle_timeout {
            Some("no subscribers watching a live transcoder")
        } else {
            None
        };

        if let Some(reason) = reason {
            tracing::info!(
                channel = %channel.key(),
                subscribers = subscribers,
                idle_secs = idle.as_secs(),
                reason = reason,
                "Reaping channel"
            );
            broker.teardown_channel(&channel, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::sink::MpscSink;
    use crate::config::BrokerConfig;
    use crate::source::{SourceDescriptor, StreamType};
    use crate::supervisor::{SimulatedLauncher, TranscoderLauncher};

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            caller_source_id: "caller-a".to_string(),
            host: "10.0.0.1".to_string(),
            port: 554,
            channel_no: 1,
            stream_type: StreamType::Main,
            username: "admin".to_string(),
            password: "secret".to_string(),
            width: 640,
            height: 480,
            start_time: None,
            end_time: None,
        }
    }

    fn broker(config: BrokerConfig) -> Arc<TranscoderBroker> {
        let launcher = Arc::new(SimulatedLauncher::new());
        TranscoderBroker::with_launcher(config, launcher as Arc<dyn TranscoderLauncher>)
            .unwrap()
    }

    #[tokio::test]
    async fn test_grace_shields_young_channels() {
        // Short-idle rule would fire instantly, but grace protects the
        // channel; use a long tick so only the manual sweep runs.
        let config = BrokerConfig::default()
            .port_range(24000, 24050)
            .reaper_interval(Duration::from_secs(3600))
            .creation_grace(Duration::from_secs(3600))
            .idle_timeouts(Duration::ZERO, Duration::ZERO);
        let broker = broker(config);

        broker.start(&descriptor()).await.unwrap();
        sweep(&broker).await;

        assert_eq!(broker.channel_count().await, 1);
        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_short_idle_rule_reaps_unwatched_channel() {
        let config = BrokerConfig::default()
            .port_range(24060, 24110)
            .reaper_interval(Duration::from_secs(3600))
            .creation_grace(Duration::ZERO)
            .idle_timeouts(Duration::from_secs(3600), Duration::from_millis(50));
        let broker = broker(config);

        broker.start(&descriptor()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        sweep(&broker).await;

        assert_eq!(broker.channel_count().await, 0);
        assert_eq!(broker.leased_ports(), 0);
        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_subscriber_keeps_channel_alive() {
        let config = BrokerConfig::default()
            .port_range(24120, 24170)
            .reaper_interval(Duration::from_secs(3600))
            .creation_grace(Duration::ZERO)
            .idle_timeouts(Duration::from_secs(3600), Duration::from_millis(20));
        let broker = broker(config);

        let started = broker.start(&descriptor()).await.unwrap();
        let (sink, _rx) = MpscSink::new();
        broker
            .attach(&started.channel_key, Box::new(sink))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        sweep(&broker).await;

        assert_eq!(broker.channel_count().await, 1);
        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_dead_producer_reaped_even_with_subscribers() {
        let config = BrokerConfig::default()
            .port_range(24180, 24230)
            .reaper_interval(Duration::from_secs(3600))
            .creation_grace(Duration::ZERO)
            // Exit-driven teardown is parked far away so the sweep is what
            // collects the channel here.
            .exit_waits(Duration::from_secs(3600), Duration::from_secs(3600));
        let launcher = Arc::new(SimulatedLauncher::new());
        let broker = TranscoderBroker::with_launcher(
            config,
            Arc::clone(&launcher) as Arc<dyn TranscoderLauncher>,
        )
        .unwrap();

        let started = broker.start(&descriptor()).await.unwrap();
        let (sink, _rx) = MpscSink::new();
        broker
            .attach(&started.channel_key, Box::new(sink))
            .await
            .unwrap();

        launcher.launched().pop().unwrap().trigger_exit(Some(1), None);
        sweep(&broker).await;

        assert_eq!(broker.channel_count().await, 0);
        broker.shutdown_all().await;
    }
}
