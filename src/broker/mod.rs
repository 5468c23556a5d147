//! Transcoder broker core
//!
//! One [`TranscoderBroker`] owns every channel. Each channel pairs one
//! supervised transcoder process with one fan-out pipeline that relays the
//! producer's MPEG-TS bytes to every attached subscriber.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<TranscoderBroker>
//!                  ┌────────────────────────────────┐
//!                  │ channels: HashMap<Key,         │
//!                  │   Arc<Channel> {               │
//!                  │     port, process, listener,   │
//!                  │     subscribers,               │
//!                  │   }                            │
//!                  │ >                              │
//!                  │ sources: HashMap<Id, Key>      │
//!                  └───────────────┬────────────────┘
//!                                  │
//!         transcoder ──TCP──► pipeline::run
//!                                  │ per-payload scatter + barrier
//!              ┌───────────────────┼───────────────────┐
//!              ▼                   ▼                   ▼
//!        [Subscriber]        [Subscriber]        [Subscriber]
//!        sink.send_binary()  sink.send_binary()  sink.send_binary()
//! ```
//!
//! Payloads are `bytes::Bytes`, so fanning one read out to N subscribers
//! clones reference counts, never the data.

pub mod channel;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod sink;

pub use channel::{Channel, ChannelSnapshot, ChannelStatus, Subscriber};
pub use registry::{StartedStream, TranscoderBroker};
pub use sink::{MpscSink, SubscriberSink};
