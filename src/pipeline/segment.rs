//! Segments: thread-sized runs of stages.
//!
//! A segment starts with a head (the true [`Origin`] or a channel
//! [`Source`]), runs its items through an exclusively owned list of stages,
//! and ends either in the chain's terminal stage or in one or more
//! [`Sink`]s feeding the next segments.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──► Running ──► Draining ──► Finished
//! ```
//!
//! `Running → Draining` happens when the head reports end-of-stream (or a
//! stage asks to stop, or a stage fails). `Draining → Finished` happens once
//! every owned sink has been closed.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::channel::{ChannelProbe, Sink, Source};
use crate::pipeline::id::SegmentId;
use crate::pipeline::monitor::{Monitor, PipelineEvent};
use crate::pipeline::rate::{RateGovernor, RatePolicy};
use crate::pipeline::report::SegmentReport;
use crate::pipeline::stage::{Emitter, Flow, Origin, Stage};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Idle,
    Running,
    Draining,
    Finished,
}

impl SegmentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SegmentState::Idle,
            1 => SegmentState::Running,
            2 => SegmentState::Draining,
            _ => SegmentState::Finished,
        }
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentState::Idle => "idle",
            SegmentState::Running => "running",
            SegmentState::Draining => "draining",
            SegmentState::Finished => "finished",
        };
        f.write_str(s)
    }
}

struct StatusInner {
    state: AtomicU8,
    items_in: AtomicU64,
    items_out: AtomicU64,
}

/// Shared, read-mostly view of a segment's progress.
#[derive(Clone)]
pub struct SegmentStatus {
    inner: Arc<StatusInner>,
}

impl SegmentStatus {
    fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                state: AtomicU8::new(SegmentState::Idle as u8),
                items_in: AtomicU64::new(0),
                items_out: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn items_in(&self) -> u64 {
        self.inner.items_in.load(Ordering::Relaxed)
    }

    pub fn items_out(&self) -> u64 {
        self.inner.items_out.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: SegmentState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }
}

impl fmt::Debug for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentStatus")
            .field("state", &self.state())
            .field("items_in", &self.items_in())
            .field("items_out", &self.items_out())
            .finish()
    }
}

/// Failure flag and error list shared by all segments of one run.
#[derive(Default)]
pub(crate) struct FailureLog {
    failed: AtomicBool,
    errors: Mutex<Vec<PipelineError>>,
}

impl FailureLog {
    pub(crate) fn record(&self, error: PipelineError) {
        self.failed.store(true, Ordering::Release);
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn take(&self) -> Vec<PipelineError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// State shared by every segment started by one invoker.
#[derive(Clone, Default)]
pub(crate) struct RunContext {
    pub(crate) monitor: Option<Monitor>,
    pub(crate) failures: Arc<FailureLog>,
}

impl RunContext {
    pub(crate) fn emit(&self, event: PipelineEvent) {
        if let Some(monitor) = &self.monitor {
            monitor.emit(event);
        }
    }
}

/// First element of a segment.
pub enum Head<T: Send + 'static> {
    /// The true root of the chain.
    Origin(Box<dyn Origin<T>>),
    /// Read end of the upstream channel, optionally throttled locally.
    Source {
        source: Source<T>,
        policy: Option<RatePolicy>,
    },
}

impl<T: Send + 'static> Head<T> {
    fn name(&self) -> &str {
        match self {
            Head::Origin(origin) => origin.name(),
            Head::Source { source, .. } => source.name(),
        }
    }
}

/// A thread-sized run of stages.
pub struct Segment<T: Send + 'static> {
    id: SegmentId,
    name: String,
    head: Head<T>,
    stages: Vec<Box<dyn Stage<T>>>,
    sinks: Vec<Sink<T>>,
    /// Set by `fan_out`; duplicates an item for every sink but the first.
    duplicate: Option<fn(&T) -> T>,
    status: SegmentStatus,
}

impl<T: Send + 'static> Segment<T> {
    fn with_head(name: String, head: Head<T>) -> Self {
        Self {
            id: SegmentId::INVALID,
            name,
            head,
            stages: Vec::new(),
            sinks: Vec::new(),
            duplicate: None,
            status: SegmentStatus::new(),
        }
    }

    /// Segment holding the root of the chain.
    pub fn from_origin(origin: impl Origin<T> + 'static) -> Self {
        Self::from_boxed_origin(Box::new(origin))
    }

    pub fn from_boxed_origin(origin: Box<dyn Origin<T>>) -> Self {
        let name = origin.name().to_string();
        Self::with_head(name, Head::Origin(origin))
    }

    /// Segment reading from an upstream channel.
    pub fn from_source(source: Source<T>) -> Self {
        let name = source.name().to_string();
        Self::with_head(name, Head::Source {
            source,
            policy: None,
        })
    }

    /// Throttle pops from the upstream channel with a local rate policy.
    ///
    /// Has no effect on a root segment, whose policy is given to the invoker.
    pub fn with_source_policy(mut self, rate: RatePolicy) -> Self {
        if let Head::Source { policy, .. } = &mut self.head {
            *policy = Some(rate);
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) fn with_id(mut self, id: SegmentId) -> Self {
        self.id = id;
        self
    }

    /// Attach a stage downstream of the current last stage.
    pub fn then(self, stage: impl Stage<T> + 'static) -> Self {
        self.then_boxed(Box::new(stage))
    }

    pub fn then_boxed(mut self, stage: Box<dyn Stage<T>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// End the segment in a sink feeding the next segment.
    pub fn into_sink(mut self, sink: Sink<T>) -> Self {
        self.sinks = vec![sink];
        self.duplicate = None;
        self
    }

    /// End the segment in several sinks; every item is cloned into each.
    pub fn fan_out(mut self, sinks: Vec<Sink<T>>) -> Self
    where
        T: Clone,
    {
        self.sinks = sinks;
        self.duplicate = Some(<T as Clone>::clone);
        self
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the head is the chain's origin.
    pub fn is_root(&self) -> bool {
        matches!(self.head, Head::Origin(_))
    }

    /// True when the segment ends the chain (owns no sinks).
    pub fn is_terminal(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn head_name(&self) -> &str {
        self.head.name()
    }

    pub fn status(&self) -> SegmentStatus {
        self.status.clone()
    }

    /// Occupancy handles for every channel this segment feeds.
    pub fn sink_probes(&self) -> Vec<ChannelProbe> {
        self.sinks.iter().map(Sink::probe).collect()
    }

    pub(crate) fn source_policy(&self) -> Option<&RatePolicy> {
        match &self.head {
            Head::Source { policy, .. } => policy.as_ref(),
            Head::Origin(_) => None,
        }
    }

    fn set_state(&self, state: SegmentState, ctx: &RunContext) {
        self.status.set_state(state);
        ctx.emit(PipelineEvent::SegmentState {
            segment: self.id,
            name: self.name.clone(),
            state,
        });
    }

    /// Run until end-of-stream, then close every owned sink.
    pub(crate) fn run(mut self, mut governor: Option<RateGovernor>, ctx: &RunContext) -> SegmentReport {
        let started = Instant::now();
        self.set_state(SegmentState::Running, ctx);
        tracing::info!(
            "Segment {} '{}' running ({} stages, {} sinks)",
            self.id,
            self.name,
            self.stages.len(),
            self.sinks.len()
        );

        let mut result = self.pump(&mut governor, ctx);

        self.set_state(SegmentState::Draining, ctx);
        if result.is_ok() {
            result = self.flush();
        }

        let error = result.err().map(|e| {
            tracing::error!("Segment {} '{}' failed: {}", self.id, self.name, e);
            let message = e.to_string();
            ctx.emit(PipelineEvent::SegmentError {
                segment: self.id,
                name: self.name.clone(),
                message: message.clone(),
            });
            ctx.failures.record(e);
            message
        });

        let Segment {
            id,
            name,
            head,
            stages,
            sinks,
            status,
            ..
        } = self;

        // Upstream pushes stop blocking once the source is gone.
        drop(head);
        drop(stages);
        for sink in &sinks {
            sink.close();
        }
        let sink_stats = sinks.iter().map(Sink::stats).collect();
        drop(sinks);

        status.set_state(SegmentState::Finished);
        ctx.emit(PipelineEvent::SegmentState {
            segment: id,
            name: name.clone(),
            state: SegmentState::Finished,
        });

        let elapsed = started.elapsed();
        tracing::info!(
            "Segment {} '{}' finished: {} in, {} out in {:.1?}",
            id,
            name,
            status.items_in(),
            status.items_out(),
            elapsed
        );

        SegmentReport {
            id,
            name,
            state: SegmentState::Finished,
            items_in: status.items_in(),
            items_out: status.items_out(),
            elapsed,
            error,
            rate: governor.map(|g| g.stats()),
            sinks: sink_stats,
        }
    }

    fn pump(&mut self, governor: &mut Option<RateGovernor>, ctx: &RunContext) -> PipelineResult<()> {
        loop {
            if !self.sinks.is_empty() && self.sinks.iter().all(Sink::is_disconnected) {
                tracing::debug!(
                    "Segment {} '{}': every downstream reader is gone, stopping",
                    self.id,
                    self.name
                );
                return Ok(());
            }

            let item = match &mut self.head {
                Head::Origin(origin) => {
                    if let Some(governor) = governor.as_mut() {
                        if let Some(adjustment) = governor.pace() {
                            ctx.emit(PipelineEvent::RateAdjusted {
                                segment: self.id,
                                adjustment,
                            });
                        }
                    }
                    origin.produce()?
                }
                Head::Source { source, .. } => {
                    let item = source.pop();
                    if item.is_some() {
                        if let Some(governor) = governor.as_mut() {
                            if let Some(adjustment) = governor.pace() {
                                ctx.emit(PipelineEvent::RateAdjusted {
                                    segment: self.id,
                                    adjustment,
                                });
                            }
                        }
                    }
                    item
                }
            };

            let Some(item) = item else {
                return Ok(());
            };
            self.status.inner.items_in.fetch_add(1, Ordering::Relaxed);

            if self.feed(0, vec![item])? == Flow::Stop {
                tracing::debug!("Segment {} '{}': stage requested stop", self.id, self.name);
                return Ok(());
            }
        }
    }

    /// Run a batch through `stages[start..]` and deliver the result.
    fn feed(&mut self, start: usize, mut batch: Vec<T>) -> PipelineResult<Flow> {
        let mut flow = Flow::Continue;
        for stage in self.stages.iter_mut().skip(start) {
            let mut out = Emitter::new();
            for item in batch.drain(..) {
                if stage.process(item, &mut out)? == Flow::Stop {
                    flow = Flow::Stop;
                    break;
                }
            }
            batch = out.into_items();
            if batch.is_empty() {
                break;
            }
        }
        self.deliver(batch);
        Ok(flow)
    }

    /// Give every stage, in order, a chance to flush at end-of-stream.
    fn flush(&mut self) -> PipelineResult<()> {
        for index in 0..self.stages.len() {
            let mut out = Emitter::new();
            self.stages[index].finish(&mut out)?;
            let items = out.into_items();
            if !items.is_empty() {
                self.feed(index + 1, items)?;
            }
        }
        Ok(())
    }

    /// Hand a batch to the sinks. `items_out` counts items accepted by at
    /// least one sink, or every item when the segment is terminal.
    fn deliver(&mut self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }

        let accepted = match (self.sinks.as_slice(), self.duplicate) {
            ([], _) => batch.len(),
            ([sink], _) | ([sink, ..], None) => {
                batch.into_iter().map(|item| sink.push(item)).filter(|&ok| ok).count()
            }
            ([first, rest @ ..], Some(duplicate)) => batch
                .into_iter()
                .map(|item| {
                    let mut any = false;
                    for sink in rest {
                        any |= sink.push(duplicate(&item));
                    }
                    first.push(item) | any
                })
                .filter(|&ok| ok)
                .count(),
        };

        self.status
            .inner
            .items_out
            .fetch_add(accepted as u64, Ordering::Relaxed);
    }
}

impl<T: Send + 'static> fmt::Debug for Segment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("head", &self.head.name())
            .field("stages", &self.stage_names())
            .field("sinks", &self.sinks)
            .finish()
    }
}
