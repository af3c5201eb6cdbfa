//! Segmented pipeline engine.
//!
//! A chain of stages is cut into segments. Each segment runs on its own thread
//! and talks to its neighbours through bounded Sink/Source channels; the root
//! segment is paced by a rate governor that can slow down when downstream
//! channels fill up.
//!
//! # Architecture
//!
//! ```text
//!  root segment (thread)       intermediate (thread)        terminal (caller)
//! [Origin → Stage → Stage] ─► Sink ═╗
//!         ▲                          ║ bounded channel
//!   RateGovernor ◄── occupancy ══════╝
//!                                 Source → [Stage → Stage] ─► Sink ══► Source → [Stage]
//! ```
//!
//! # Design
//!
//! - **Bounded channels**: `Sink::push` blocks (or drops, per `OverflowPolicy`)
//!   when the channel is full; `Source::pop` blocks until an item arrives or the
//!   channel is closed and drained.
//! - **Close propagates**: a segment closes its sinks on every exit path,
//!   including panics, so every downstream segment drains and finishes.
//! - **One builder**: serial and parallel chains differ only in `CutPoints`.
//! - **Observable**: state, rate adjustments and errors flow to an optional
//!   `Monitor`, and every run ends in a serializable `RunReport`.

pub mod assembly;
pub mod channel;
pub mod id;
pub mod invoker;
pub mod monitor;
pub mod rate;
pub mod report;
pub mod segment;
pub mod stage;
pub mod stages;

pub use assembly::{CutPoints, Pipeline, PipelineBuilder};
pub use channel::{
    channel, Channel, ChannelProbe, ChannelStats, OverflowPolicy, Sink, Source,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use id::{ChannelId, SegmentId};
pub use invoker::Invoker;
pub use monitor::{Monitor, MonitorReceiver, PipelineEvent};
pub use rate::{Pacing, RateAdjustment, RateGovernor, RatePolicy, RateStats};
pub use report::{RunReport, SegmentReport};
pub use segment::{Head, Segment, SegmentState, SegmentStatus};
pub use stage::{Emitter, Flow, Origin, Stage};
pub use stages::{CollectStage, Collected, CountStage, FilterStage, IterOrigin, MapStage};
