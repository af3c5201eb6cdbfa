//! Terminal stages that consume items.

use crate::error::PipelineResult;
use crate::pipeline::stage::{Emitter, Flow, Stage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared handle to the items a [`CollectStage`] has seen.
#[derive(Debug)]
pub struct Collected<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Collected<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Collected<T> {
    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every collected item, leaving the buffer empty.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T: Clone> Collected<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Appends every item to a shared buffer.
pub struct CollectStage<T> {
    name: String,
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectStage<T> {
    /// Create the stage and the handle used to read what it collected.
    pub fn new(name: impl Into<String>) -> (Self, Collected<T>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let handle = Collected {
            items: Arc::clone(&items),
        };
        (
            Self {
                name: name.into(),
                items,
            },
            handle,
        )
    }
}

impl<T: Send> Stage<T> for CollectStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, _out: &mut Emitter<T>) -> PipelineResult<Flow> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
        Ok(Flow::Continue)
    }
}

/// Counts items and discards them.
pub struct CountStage {
    name: String,
    count: Arc<AtomicU64>,
}

impl CountStage {
    pub fn new(name: impl Into<String>) -> (Self, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        (
            Self {
                name: name.into(),
                count: Arc::clone(&count),
            },
            count,
        )
    }
}

impl<T> Stage<T> for CountStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, _item: T, _out: &mut Emitter<T>) -> PipelineResult<Flow> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_and_take() {
        let (mut stage, collected) = CollectStage::new("out");
        let mut out = Emitter::new();
        stage.process("a", &mut out).unwrap();
        stage.process("b", &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(collected.snapshot(), vec!["a", "b"]);
        assert_eq!(collected.take(), vec!["a", "b"]);
        assert!(collected.is_empty());
    }

    #[test]
    fn test_count() {
        let (mut stage, count) = CountStage::new("count");
        let mut out = Emitter::new();
        for i in 0..5u8 {
            stage.process(i, &mut out).unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
