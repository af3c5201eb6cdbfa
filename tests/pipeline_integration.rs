//! Integration tests for pipeline assembly and execution
//!
//! These tests validate the complete run workflow:
//! - Segment counts seen end to end
//! - Setup failures before any thread exists
//! - Serial and parallel chains agreeing on output
//! - Runtime errors and panics shutting the chain down

mod common;

use common::builders::{NumberOrigin, StepBuilder};
use mockall::mock;
use mockall::predicate::always;
use serial_test::serial;
use stagepipe::pipeline::stages::{CollectStage, FilterStage, IterOrigin};
use stagepipe::pipeline::{
    channel, Channel, CutPoints, Emitter, Flow, Invoker, Monitor, PipelineBuilder, PipelineEvent,
    RatePolicy, Segment, SegmentId, SegmentState, Stage,
};
use stagepipe::{PipelineError, PipelineResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mock! {
    pub Consumer {}

    impl Stage<u64> for Consumer {
        fn name(&self) -> &str;
        fn prepare(&mut self) -> PipelineResult<()>;
        fn process(&mut self, item: u64, out: &mut Emitter<u64>) -> PipelineResult<Flow>;
        fn finish(&mut self, out: &mut Emitter<u64>) -> PipelineResult<()>;
    }
}

#[test]
fn test_two_segments_deliver_every_item() {
    let (collect, collected) = CollectStage::new("collect");
    let pipeline = PipelineBuilder::new(NumberOrigin::new(500))
        .channel_capacity(4)
        .stage(collect)
        .assemble(CutPoints::EveryStage)
        .unwrap();
    assert_eq!(pipeline.segment_count(), 2);

    let report = pipeline.run(RatePolicy::unthrottled()).unwrap();

    assert!(!report.failed);
    assert_eq!(collected.snapshot(), (1..=500).collect::<Vec<u64>>());
    assert_eq!(report.terminal().unwrap().items_in, 500);

    let root = report.segment(SegmentId(0)).unwrap();
    assert_eq!(root.items_out, 500);
    assert!(root.sinks[0].high_water <= 4);
    assert!(root.sinks[0].closed);
}

#[test]
fn test_setup_failure_starts_nothing() {
    let counter = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let result = PipelineBuilder::new(NumberOrigin::new(10))
        .stage(StepBuilder::new("detect").count_into(counter.clone()).build())
        .stage(StepBuilder::new("landmarks").fail_prepare().build())
        .stage(StepBuilder::new("render").build())
        .assemble(CutPoints::EveryStage);

    let err = result.err().expect("assembly should fail");
    assert!(err.is_setup());
    assert!(err.to_string().contains("landmarks"));
    assert_eq!(counter.load(Ordering::Relaxed), 0);
    assert!(started.elapsed() < common::test_timeout());
}

#[test]
fn test_origin_setup_failure() {
    let err = PipelineBuilder::new(NumberOrigin::new(10).failing_prepare())
        .stage(StepBuilder::new("render").build())
        .assemble(CutPoints::Serial)
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::Setup { ref stage, .. } if stage == "numbers"));
}

#[test]
fn test_serial_and_parallel_produce_identical_output() {
    let run = |cuts: CutPoints| {
        let (collect, collected) = CollectStage::new("collect");
        let pipeline = PipelineBuilder::new(IterOrigin::new("words", (0..200u64).map(|i| i * 3)))
            .channel_capacity(3)
            .stage(FilterStage::new("drop-odd", |x: &u64| x % 2 == 0))
            .stage(StepBuilder::new("identity").build())
            .stage(collect)
            .assemble(cuts)
            .unwrap();
        let report = pipeline.run(RatePolicy::unthrottled()).unwrap();
        assert!(!report.failed);
        collected.take()
    };

    let serial = run(CutPoints::Serial);
    assert_eq!(serial.len(), 100);
    assert_eq!(run(CutPoints::EveryStage), serial);
    assert_eq!(run(CutPoints::Before(vec![2])), serial);
}

#[test]
fn test_runtime_error_fails_run_and_drains() {
    let (collect, collected) = CollectStage::new("collect");
    let started = Instant::now();
    let pipeline = PipelineBuilder::new(NumberOrigin::new(100_000))
        .channel_capacity(1)
        .stage(StepBuilder::new("decode").fail_on(50).build())
        .stage(collect)
        .assemble(CutPoints::EveryStage)
        .unwrap();

    let mut invoker = Invoker::new();
    let report = pipeline
        .run_with(&mut invoker, RatePolicy::unthrottled())
        .unwrap();

    assert!(report.failed);
    assert!(invoker.has_failed());
    assert!(report.first_error().unwrap().contains("cannot process item 50"));
    assert_eq!(collected.len(), 49);
    assert!(started.elapsed() < common::test_timeout());

    let errors = invoker.take_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], PipelineError::Stage { .. }));
}

#[test]
fn test_panicking_stage_is_reported() {
    let (collect, collected) = CollectStage::new("collect");
    let pipeline = PipelineBuilder::new(NumberOrigin::new(20))
        .stage(StepBuilder::new("explode").panic_on(5).build())
        .stage(collect)
        .assemble(CutPoints::EveryStage)
        .unwrap();

    let mut invoker = Invoker::new();
    let report = pipeline
        .run_with(&mut invoker, RatePolicy::unthrottled())
        .unwrap();

    assert!(report.failed);
    assert_eq!(collected.len(), 4);
    let errors = invoker.take_errors();
    assert!(errors
        .iter()
        .any(|e| matches!(e, PipelineError::SegmentPanicked { name, .. } if name == "explode")));
}

#[test]
fn test_stop_flow_shuts_down_unbounded_origin() {
    let (collect, collected) = CollectStage::new("collect");
    let pipeline = PipelineBuilder::new(IterOrigin::new("forever", 0u64..))
        .channel_capacity(2)
        .stage(StepBuilder::new("pass").build())
        .stage(FilterStage::new("first-10", |_: &u64| true).with_limit(10))
        .stage(collect)
        .assemble(CutPoints::EveryStage)
        .unwrap();

    let started = Instant::now();
    let report = pipeline.run(RatePolicy::unthrottled()).unwrap();

    assert!(!report.failed);
    assert_eq!(collected.snapshot(), (0..10).collect::<Vec<u64>>());
    assert!(started.elapsed() < common::test_timeout());
}

#[test]
fn test_mocked_terminal_stage() {
    let mut consumer = MockConsumer::new();
    consumer.expect_name().return_const("consumer".to_string());
    consumer.expect_prepare().times(1).returning(|| Ok(()));
    consumer
        .expect_process()
        .with(always(), always())
        .times(25)
        .returning(|_, _| Ok(Flow::Continue));
    consumer.expect_finish().times(1).returning(|_| Ok(()));

    let pipeline = PipelineBuilder::new(NumberOrigin::new(25))
        .stage(StepBuilder::new("pass").build())
        .stage(consumer)
        .assemble(CutPoints::EveryStage)
        .unwrap();

    // Unmet expectations panic on drop inside the segment and fail the run.
    let report = pipeline.run(RatePolicy::unthrottled()).unwrap();
    assert!(!report.failed, "{:?}", report.first_error());
}

#[test]
fn test_hand_built_fan_out() {
    let (left_sink, left_source) = Channel::new(4).with_name("left").split();
    let (right_sink, right_source) = channel(4);

    let root = Segment::from_origin(NumberOrigin::new(50)).fan_out(vec![left_sink, right_sink]);
    let (left_collect, left) = CollectStage::new("left-collect");
    let (right_collect, right) = CollectStage::new("right-collect");
    let left_branch = Segment::from_source(left_source).then(left_collect);
    let right_branch = Segment::from_source(right_source).then(right_collect);

    let mut invoker = Invoker::new();
    invoker
        .run_root_rate_limited(RatePolicy::unthrottled(), root)
        .unwrap();
    invoker.run_segment(left_branch).unwrap();
    invoker.run_terminal(right_branch).unwrap();
    let report = invoker.wait_until_finished();

    assert!(!report.failed);
    assert_eq!(report.segments.len(), 3);
    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(left.snapshot(), expected);
    assert_eq!(right.snapshot(), expected);
}

#[test]
fn test_invoker_rejects_misplaced_segments() {
    let (sink, source) = channel::<u64>(1);
    let mut invoker = Invoker::new();

    let err = invoker
        .run_segment(Segment::from_origin(NumberOrigin::new(1)))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Topology(_)));

    let err = invoker
        .run_root_rate_limited(RatePolicy::unthrottled(), Segment::from_source(source))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Topology(_)));

    drop(sink);
    assert!(invoker.wait_until_finished().segments.is_empty());
}

#[test]
fn test_wait_without_segments_returns_immediately() {
    let mut invoker = Invoker::new();
    let started = Instant::now();
    let first = invoker.wait_until_finished();
    let second = invoker.wait_until_finished();
    assert!(first.segments.is_empty() && second.segments.is_empty());
    assert!(!first.failed);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_monitor_sees_every_segment_finish() {
    let (monitor, events) = Monitor::new();
    let mut invoker = Invoker::with_monitor(monitor);
    let pipeline = PipelineBuilder::new(NumberOrigin::new(10))
        .stage(StepBuilder::new("a").build())
        .stage(StepBuilder::new("b").build())
        .assemble(CutPoints::EveryStage)
        .unwrap();

    pipeline
        .run_with(&mut invoker, RatePolicy::unthrottled())
        .unwrap();

    let events = events.drain();
    let finished: Vec<SegmentId> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::SegmentState {
                segment,
                state: SegmentState::Finished,
                ..
            } => Some(*segment),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 3);
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::Finished { failed: false })
    );
}

#[test]
#[serial]
fn test_source_policy_throttles_downstream_segment() {
    let (collect, collected) = CollectStage::new("collect");
    let pipeline = PipelineBuilder::new(NumberOrigin::new(21))
        .cut_with_policy(RatePolicy::fixed(200.0))
        .stage(collect)
        .assemble(CutPoints::Marked)
        .unwrap();
    assert_eq!(pipeline.segment_count(), 2);

    let started = Instant::now();
    let report = pipeline.run(RatePolicy::unthrottled()).unwrap();

    assert!(!report.failed);
    assert_eq!(collected.len(), 21);
    // 20 gaps of 5ms each
    assert!(started.elapsed() >= Duration::from_millis(95));
    assert!(report.terminal().unwrap().rate.is_some());
}

#[test]
fn test_segment_status_is_finished_after_run() {
    let root = Segment::from_origin(NumberOrigin::new(3));
    let status = root.status();
    assert_eq!(status.state(), SegmentState::Idle);

    let mut invoker = Invoker::new();
    invoker
        .run_root_inline(RatePolicy::unthrottled(), root)
        .unwrap();
    let report = invoker.wait_until_finished();

    assert_eq!(status.state(), SegmentState::Finished);
    assert_eq!(status.items_in(), 3);
    assert_eq!(report.segments[0].state, SegmentState::Finished);
}
