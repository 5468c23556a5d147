//! tsrelay-rs - live camera stream relay broker
//!
//! Multiplexes live video from external transcoder processes into many
//! concurrent binary stream consumers. A caller starts a stream for a camera
//! source; the broker spawns (or reuses) a transcoder that pulls the camera's
//! RTSP feed and writes an MPEG-TS byte stream to a loopback TCP port, then
//! fans those bytes out in real time to every subscriber attached to the
//! matching channel.
//!
//! Channels are deduplicated by the source's structural fingerprint, so all
//! subscribers of one logical source share one transcoder. Idle and dead
//! channels are garbage-collected by a background reaper; a failed or killed
//! transcoder triggers an exit-driven teardown that first gives attached
//! subscribers a bounded window to drain.
//!
//! ```no_run
//! use tsrelay_rs::{BrokerConfig, SourceDescriptor, StreamType, TranscoderBroker};
//!
//! # async fn run() -> tsrelay_rs::Result<()> {
//! let broker = TranscoderBroker::new(BrokerConfig::with_transcoder("/usr/bin/ffmpeg"))?;
//!
//! let started = broker
//!     .start(&SourceDescriptor {
//!         caller_source_id: "viewer-42".to_string(),
//!         host: "10.0.0.1".to_string(),
//!         port: 554,
//!         channel_no: 1,
//!         stream_type: StreamType::Main,
//!         username: "admin".to_string(),
//!         password: "secret".to_string(),
//!         width: 1280,
//!         height: 720,
//!         start_time: None,
//!         end_time: None,
//!     })
//!     .await?;
//!
//! // Hand the endpoint hint to clients; attach their sinks with
//! // `broker.attach(&started.channel_key, sink)`.
//! println!("stream available at {}", started.endpoint_hint);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod ports;
pub mod source;
pub mod supervisor;

// Re-export main types for convenient access
pub use broker::{
    ChannelSnapshot, ChannelStatus, MpscSink, StartedStream, SubscriberSink, TranscoderBroker,
};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use source::{build_source_url, ChannelKey, SourceDescriptor, StreamType};
pub use supervisor::{
    ExitInfo, FfmpegLauncher, SimulatedLauncher, TranscoderJob, TranscoderLauncher,
    TranscoderProcess,
};
