//! Test origins and stages

use stagepipe::pipeline::{Emitter, Flow, Origin, Stage};
use stagepipe::{PipelineError, PipelineResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Origin counting `1..=count`
pub struct NumberOrigin {
    name: String,
    next: u64,
    count: u64,
    fail_prepare: bool,
    delay: Duration,
}

impl NumberOrigin {
    pub fn new(count: u64) -> Self {
        Self {
            name: "numbers".to_string(),
            next: 0,
            count,
            fail_prepare: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Sleep before producing each item
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Origin<u64> for NumberOrigin {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        if self.fail_prepare {
            return Err(PipelineError::setup(&self.name, "device not found"));
        }
        Ok(())
    }

    fn produce(&mut self) -> PipelineResult<Option<u64>> {
        if self.next >= self.count {
            return Ok(None);
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.next += 1;
        Ok(Some(self.next))
    }
}

/// Configurable pass-through stage
pub struct StepBuilder {
    name: String,
    cost: Duration,
    fail_prepare: bool,
    fail_on: Option<u64>,
    panic_on: Option<u64>,
    seen: Option<Arc<AtomicU64>>,
}

impl StepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cost: Duration::ZERO,
            fail_prepare: false,
            fail_on: None,
            panic_on: None,
            seen: None,
        }
    }

    /// Sleep this long per item
    pub fn cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    pub fn fail_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Return a stage error when this item arrives
    pub fn fail_on(mut self, item: u64) -> Self {
        self.fail_on = Some(item);
        self
    }

    pub fn panic_on(mut self, item: u64) -> Self {
        self.panic_on = Some(item);
        self
    }

    /// Count processed items into `counter`
    pub fn count_into(mut self, counter: Arc<AtomicU64>) -> Self {
        self.seen = Some(counter);
        self
    }

    pub fn build(self) -> Step {
        Step { config: self }
    }
}

pub struct Step {
    config: StepBuilder,
}

impl Stage<u64> for Step {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        if self.config.fail_prepare {
            return Err(PipelineError::setup(&self.config.name, "model file missing"));
        }
        Ok(())
    }

    fn process(&mut self, item: u64, out: &mut Emitter<u64>) -> PipelineResult<Flow> {
        if !self.config.cost.is_zero() {
            std::thread::sleep(self.config.cost);
        }
        if self.config.fail_on == Some(item) {
            return Err(PipelineError::stage(
                &self.config.name,
                format!("cannot process item {}", item),
            ));
        }
        if self.config.panic_on == Some(item) {
            panic!("{} exploded on item {}", self.config.name, item);
        }
        if let Some(seen) = &self.config.seen {
            seen.fetch_add(1, Ordering::Relaxed);
        }
        out.emit(item);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let mut step = StepBuilder::new("step").fail_on(2).build();
        let mut out = Emitter::new();
        assert_eq!(step.process(1, &mut out).unwrap(), Flow::Continue);
        assert!(step.process(2, &mut out).is_err());
        assert_eq!(out.len(), 1);
    }
}
