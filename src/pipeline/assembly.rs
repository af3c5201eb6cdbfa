//! Pipeline assembly: turning one stage chain into segments.
//!
//! Client code attaches an origin and an ordered list of stages to a
//! [`PipelineBuilder`], then picks where the chain is cut with
//! [`CutPoints`]. Every cut inserts exactly one Sink/Source pair. The serial
//! reference chain and the fully parallel chain are the same builder
//! assembled with different cut points.
//!
//! ```text
//! CutPoints::Serial      [reader → annotate → render → encode]
//! CutPoints::EveryStage  [reader] ⇒ [annotate] ⇒ [render] ⇒ [encode]
//! CutPoints::Before([1]) [reader → annotate] ⇒ [render → encode]
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::channel::{Channel, OverflowPolicy, DEFAULT_CHANNEL_CAPACITY};
use crate::pipeline::id::{ChannelId, SegmentId};
use crate::pipeline::invoker::Invoker;
use crate::pipeline::rate::RatePolicy;
use crate::pipeline::report::RunReport;
use crate::pipeline::segment::Segment;
use crate::pipeline::stage::{Origin, Stage};
use std::collections::BTreeMap;

/// Where to cut a chain into segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CutPoints {
    /// No cuts: one segment on the caller's thread.
    Serial,
    /// Use the cuts marked with [`PipelineBuilder::cut`] while attaching.
    #[default]
    Marked,
    /// Cut before every stage: the origin and each stage get a thread.
    EveryStage,
    /// Cut immediately before each listed stage index.
    Before(Vec<usize>),
}

/// Builds a [`Pipeline`] from an origin and a chain of stages.
pub struct PipelineBuilder<T: Send + 'static> {
    origin: Box<dyn Origin<T>>,
    stages: Vec<Box<dyn Stage<T>>>,
    /// Cuts marked while attaching: stage index → optional local policy.
    marked: BTreeMap<usize, Option<RatePolicy>>,
    channel_capacity: usize,
    overflow: OverflowPolicy,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn new(origin: impl Origin<T> + 'static) -> Self {
        Self::from_boxed(Box::new(origin))
    }

    pub fn from_boxed(origin: Box<dyn Origin<T>>) -> Self {
        Self {
            origin,
            stages: Vec::new(),
            marked: BTreeMap::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }

    /// Attach a stage to the end of the chain.
    pub fn stage(self, stage: impl Stage<T> + 'static) -> Self {
        self.boxed_stage(Box::new(stage))
    }

    pub fn boxed_stage(mut self, stage: Box<dyn Stage<T>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Mark a concurrency boundary after the last attached stage.
    pub fn cut(mut self) -> Self {
        self.marked.entry(self.stages.len()).or_insert(None);
        self
    }

    /// Mark a boundary whose downstream segment throttles its own input.
    pub fn cut_with_policy(mut self, policy: RatePolicy) -> Self {
        self.marked.insert(self.stages.len(), Some(policy));
        self
    }

    /// Capacity of every channel the builder inserts.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn overflow_policy(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Prepare every stage and split the chain at `cuts`.
    ///
    /// Preparation runs origin-first in chain order. The first failure aborts
    /// assembly; nothing has been started at that point.
    pub fn assemble(mut self, cuts: CutPoints) -> PipelineResult<Pipeline<T>> {
        let cut_map = self.resolve_cuts(cuts)?;
        for (&index, policy) in &cut_map {
            if let Some(policy) = policy {
                policy.validate().map_err(|e| {
                    let stage = self.stages[index].name().to_string();
                    tracing::error!("Rate policy on the cut before '{}' is invalid: {}", stage, e);
                    PipelineError::setup(stage, e.to_string())
                })?;
            }
        }

        prepare(self.origin.name().to_string(), self.origin.prepare())?;
        for stage in &mut self.stages {
            prepare(stage.name().to_string(), stage.prepare())?;
        }

        let PipelineBuilder {
            origin,
            stages,
            channel_capacity,
            overflow,
            ..
        } = self;

        let mut segments = Vec::with_capacity(cut_map.len() + 1);
        let mut current = Segment::from_boxed_origin(origin).with_id(SegmentId(0));
        let mut previous_name = current.name().to_string();
        let mut channel_index = 0u32;

        for (index, stage) in stages.into_iter().enumerate() {
            if let Some(policy) = cut_map.get(&index) {
                let channel_name = format!("{}->{}", previous_name, stage.name());
                let (sink, source) = Channel::new(channel_capacity)
                    .with_id(ChannelId(channel_index))
                    .with_name(channel_name)
                    .with_policy(overflow)
                    .split();
                channel_index += 1;

                segments.push(current.into_sink(sink));

                let mut next = Segment::from_source(source)
                    .with_name(stage.name().to_string())
                    .with_id(SegmentId(segments.len() as u32));
                if let Some(policy) = policy {
                    next = next.with_source_policy(policy.clone());
                }
                current = next;
            }
            previous_name = stage.name().to_string();
            current = current.then_boxed(stage);
        }
        segments.push(current);

        let pipeline = Pipeline { segments };
        tracing::info!(
            "Assembled pipeline with {} segments: {}",
            pipeline.segment_count(),
            pipeline.describe()
        );
        Ok(pipeline)
    }

    fn resolve_cuts(&self, cuts: CutPoints) -> PipelineResult<BTreeMap<usize, Option<RatePolicy>>> {
        let n = self.stages.len();
        let mut map = BTreeMap::new();
        match cuts {
            CutPoints::Serial => {}
            CutPoints::Marked => {
                for (&index, policy) in &self.marked {
                    if index < n {
                        map.insert(index, policy.clone());
                    } else {
                        tracing::warn!("Ignoring cut after the last stage (index {})", index);
                    }
                }
            }
            CutPoints::EveryStage => {
                for index in 0..n {
                    map.insert(index, self.marked.get(&index).cloned().flatten());
                }
            }
            CutPoints::Before(indices) => {
                for index in indices {
                    if index >= n {
                        return Err(PipelineError::Topology(format!(
                            "cut before stage {} but the chain has {} stages",
                            index, n
                        )));
                    }
                    map.insert(index, self.marked.get(&index).cloned().flatten());
                }
            }
        }
        Ok(map)
    }
}

fn prepare(name: String, result: PipelineResult<()>) -> PipelineResult<()> {
    result.map_err(|e| {
        tracing::error!("Preparing '{}' failed: {}", name, e);
        match e {
            e @ PipelineError::Setup { .. } => e,
            other => PipelineError::Setup {
                stage: name,
                message: other.to_string(),
            },
        }
    })
}

/// An assembled chain of segments, ready to run once.
pub struct Pipeline<T: Send + 'static> {
    segments: Vec<Segment<T>>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Segment<T>] {
        &self.segments
    }

    /// One-line topology summary, e.g. `[reader] => [annotate -> render]`.
    pub fn describe(&self) -> String {
        self.segments
            .iter()
            .map(|segment| {
                let mut names = Vec::new();
                if segment.is_root() {
                    names.push(segment.head_name());
                }
                names.extend(segment.stage_names());
                format!("[{}]", names.join(" -> "))
            })
            .collect::<Vec<_>>()
            .join(" => ")
    }

    /// Run with a fresh invoker; see [`Pipeline::run_with`].
    pub fn run(self, policy: RatePolicy) -> PipelineResult<RunReport> {
        let mut invoker = Invoker::new();
        self.run_with(&mut invoker, policy)
    }

    /// Start the root under `policy`, one thread per intermediate segment,
    /// the terminal segment on this thread, then wait for all of them.
    ///
    /// Errors are returned only when the pipeline could not be started;
    /// failures inside running segments are flagged in the report.
    pub fn run_with(self, invoker: &mut Invoker, policy: RatePolicy) -> PipelineResult<RunReport> {
        policy.validate()?;
        for segment in &self.segments {
            if let Some(local) = segment.source_policy() {
                local.validate()?;
            }
        }

        let mut segments = self.segments.into_iter();
        let Some(root) = segments.next() else {
            return Ok(invoker.wait_until_finished());
        };

        let Some(terminal) = segments.next_back() else {
            invoker.run_root_inline(policy, root)?;
            return Ok(invoker.wait_until_finished());
        };

        // Dropping unstarted segments closes their channels, so whatever did
        // start still drains before we return the error.
        if let Err(e) = invoker.run_root_rate_limited(policy, root) {
            drop(segments);
            drop(terminal);
            invoker.wait_until_finished();
            return Err(e);
        }
        while let Some(segment) = segments.next() {
            if let Err(e) = invoker.run_segment(segment) {
                drop(segments);
                drop(terminal);
                invoker.wait_until_finished();
                return Err(e);
            }
        }
        if let Err(e) = invoker.run_terminal(terminal) {
            invoker.wait_until_finished();
            return Err(e);
        }
        Ok(invoker.wait_until_finished())
    }
}
