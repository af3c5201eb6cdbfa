//! Invoker: schedules segments onto threads and waits for them.
//!
//! - The root segment runs on its own thread under a [`RatePolicy`].
//! - Every intermediate segment runs on its own thread.
//! - The terminal segment runs inline on the caller's thread, so the caller
//!   becomes the consumer-side worker instead of blocking idle.
//!
//! ```rust,ignore
//! let mut invoker = Invoker::new();
//! invoker.run_root_rate_limited(policy, root)?;
//! invoker.run_segment(middle)?;
//! invoker.run_terminal(last);
//! let report = invoker.wait_until_finished();
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::id::SegmentId;
use crate::pipeline::monitor::{Monitor, PipelineEvent};
use crate::pipeline::rate::{RateGovernor, RatePolicy};
use crate::pipeline::report::{RunReport, SegmentReport};
use crate::pipeline::segment::{RunContext, Segment, SegmentState, SegmentStatus};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A segment started on its own thread.
struct Running {
    id: SegmentId,
    name: String,
    status: SegmentStatus,
    handle: JoinHandle<SegmentReport>,
}

/// Starts segments and joins them.
pub struct Invoker {
    running: Vec<Running>,
    /// Reports of segments that ran inline.
    inline_reports: Vec<SegmentReport>,
    ctx: RunContext,
    next_id: u32,
    started: Option<(DateTime<Utc>, Instant)>,
    /// Cached result of the first `wait_until_finished`.
    finished: Option<RunReport>,
}

impl Invoker {
    pub fn new() -> Self {
        Self {
            running: Vec::new(),
            inline_reports: Vec::new(),
            ctx: RunContext::default(),
            next_id: 0,
            started: None,
            finished: None,
        }
    }

    /// Publish lifecycle and rate events to `monitor`.
    pub fn with_monitor(monitor: Monitor) -> Self {
        let mut invoker = Self::new();
        invoker.ctx.monitor = Some(monitor);
        invoker
    }

    /// Start the segment holding the true root on a dedicated thread.
    ///
    /// Every item the origin delivers is paced by `policy`. Returns as soon
    /// as the thread is running.
    pub fn run_root_rate_limited<T: Send + 'static>(
        &mut self,
        policy: RatePolicy,
        segment: Segment<T>,
    ) -> PipelineResult<SegmentId> {
        if !segment.is_root() {
            return Err(PipelineError::Topology(format!(
                "segment '{}' does not hold the pipeline origin",
                segment.name()
            )));
        }
        policy.validate()?;
        let governor = RateGovernor::new(policy, segment.sink_probes());
        self.spawn(segment, Some(governor))
    }

    /// Start an intermediate segment (one headed by a channel source).
    pub fn run_segment<T: Send + 'static>(
        &mut self,
        segment: Segment<T>,
    ) -> PipelineResult<SegmentId> {
        if segment.is_root() {
            return Err(PipelineError::Topology(format!(
                "segment '{}' holds the origin; use run_root_rate_limited",
                segment.name()
            )));
        }
        let governor = Self::source_governor(&segment)?;
        self.spawn(segment, governor)
    }

    /// Run the terminal segment on the calling thread until it drains.
    pub fn run_terminal<T: Send + 'static>(&mut self, segment: Segment<T>) -> PipelineResult<()> {
        if segment.is_root() {
            return Err(PipelineError::Topology(format!(
                "segment '{}' holds the origin; use run_root_inline",
                segment.name()
            )));
        }
        let governor = Self::source_governor(&segment)?;
        self.run_inline(segment, governor);
        Ok(())
    }

    /// Run a whole single-segment chain (origin to terminal) on the caller.
    ///
    /// This is the serial reference mode: no thread is spawned.
    pub fn run_root_inline<T: Send + 'static>(
        &mut self,
        policy: RatePolicy,
        segment: Segment<T>,
    ) -> PipelineResult<()> {
        if !segment.is_root() {
            return Err(PipelineError::Topology(format!(
                "segment '{}' does not hold the pipeline origin",
                segment.name()
            )));
        }
        policy.validate()?;
        let governor = RateGovernor::new(policy, segment.sink_probes());
        self.run_inline(segment, Some(governor));
        Ok(())
    }

    /// Block until every started segment has finished.
    ///
    /// Returns immediately if nothing was started. Calling it again without
    /// starting anything new returns the previous report.
    pub fn wait_until_finished(&mut self) -> RunReport {
        if self.running.is_empty() && self.inline_reports.is_empty() {
            if let Some(report) = &self.finished {
                return report.clone();
            }
        }

        let mut segments = std::mem::take(&mut self.inline_reports);
        for running in self.running.drain(..) {
            segments.push(Self::join(running, &self.ctx));
        }
        segments.sort_by_key(|s| s.id);

        let (started_at, wall_time) = match self.started {
            Some((at, instant)) => (at, instant.elapsed()),
            None => (Utc::now(), Duration::ZERO),
        };
        let failed = self.ctx.failures.failed();
        self.ctx.emit(PipelineEvent::Finished { failed });

        if !segments.is_empty() {
            tracing::info!(
                "Pipeline finished: {} segments in {:.1?}{}",
                segments.len(),
                wall_time,
                if failed { " (with errors)" } else { "" }
            );
        }

        let report = RunReport {
            started_at,
            wall_time,
            segments,
            failed,
        };
        self.finished = Some(report.clone());
        report
    }

    /// True once any segment has recorded a failure.
    pub fn has_failed(&self) -> bool {
        self.ctx.failures.failed()
    }

    /// Take every error recorded so far.
    pub fn take_errors(&self) -> Vec<PipelineError> {
        self.ctx.failures.take()
    }

    /// Status handles of the segments currently on worker threads.
    pub fn statuses(&self) -> Vec<(SegmentId, SegmentStatus)> {
        self.running
            .iter()
            .map(|r| (r.id, r.status.clone()))
            .collect()
    }

    fn source_governor<T: Send + 'static>(
        segment: &Segment<T>,
    ) -> PipelineResult<Option<RateGovernor>> {
        match segment.source_policy() {
            Some(policy) => {
                policy.validate()?;
                Ok(Some(RateGovernor::new(policy.clone(), segment.sink_probes())))
            }
            None => Ok(None),
        }
    }

    fn assign_id<T: Send + 'static>(&mut self, segment: Segment<T>) -> Segment<T> {
        self.started
            .get_or_insert_with(|| (Utc::now(), Instant::now()));
        // Hand out IDs past anything assembly already assigned.
        let segment = if segment.id().is_valid() {
            segment
        } else {
            let id = SegmentId(self.next_id);
            segment.with_id(id)
        };
        self.next_id = self.next_id.max(segment.id().0.saturating_add(1));
        segment
    }

    fn spawn<T: Send + 'static>(
        &mut self,
        segment: Segment<T>,
        governor: Option<RateGovernor>,
    ) -> PipelineResult<SegmentId> {
        let segment = self.assign_id(segment);
        let id = segment.id();
        let name = segment.name().to_string();
        let status = segment.status();
        let ctx = self.ctx.clone();

        let handle = std::thread::Builder::new()
            .name(format!("segment-{}", name))
            .spawn(move || segment.run(governor, &ctx))
            .map_err(|source| {
                tracing::error!("Failed to spawn segment '{}': {}", name, source);
                PipelineError::Spawn {
                    name: name.clone(),
                    source,
                }
            })?;

        tracing::debug!("Spawned segment {} '{}'", id, name);
        self.running.push(Running {
            id,
            name,
            status,
            handle,
        });
        Ok(id)
    }

    fn run_inline<T: Send + 'static>(&mut self, segment: Segment<T>, governor: Option<RateGovernor>) {
        let segment = self.assign_id(segment);
        let id = segment.id();
        let name = segment.name().to_string();
        let status = segment.status();
        let ctx = self.ctx.clone();

        let report = panic::catch_unwind(AssertUnwindSafe(|| segment.run(governor, &ctx)))
            .unwrap_or_else(|payload| Self::panicked(id, name, &status, payload, &self.ctx));
        self.inline_reports.push(report);
    }

    fn join(running: Running, ctx: &RunContext) -> SegmentReport {
        let Running {
            id,
            name,
            status,
            handle,
        } = running;
        match handle.join() {
            Ok(report) => report,
            Err(payload) => Self::panicked(id, name, &status, payload, ctx),
        }
    }

    fn panicked(
        id: SegmentId,
        name: String,
        status: &SegmentStatus,
        payload: Box<dyn Any + Send>,
        ctx: &RunContext,
    ) -> SegmentReport {
        let message = panic_message(payload.as_ref());
        tracing::error!("Segment {} '{}' panicked: {}", id, name, message);

        let error = PipelineError::SegmentPanicked {
            segment: id,
            name: name.clone(),
            message,
        };
        let text = error.to_string();
        ctx.emit(PipelineEvent::SegmentError {
            segment: id,
            name: name.clone(),
            message: text.clone(),
        });
        ctx.failures.record(error);
        status.set_state(SegmentState::Finished);

        SegmentReport {
            id,
            name,
            state: SegmentState::Finished,
            items_in: status.items_in(),
            items_out: status.items_out(),
            elapsed: Duration::ZERO,
            error: Some(text),
            rate: None,
            sinks: Vec::new(),
        }
    }
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Invoker {
    fn drop(&mut self) {
        // Never leave detached segment threads behind.
        if !self.running.is_empty() {
            self.wait_until_finished();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
