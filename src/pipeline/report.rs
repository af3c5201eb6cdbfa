//! Run reports returned once a pipeline has drained.

use crate::pipeline::channel::ChannelStats;
use crate::pipeline::id::SegmentId;
use crate::pipeline::rate::RateStats;
use crate::pipeline::segment::SegmentState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Outcome of a single segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub id: SegmentId,
    pub name: String,
    pub state: SegmentState,
    /// Items pulled from the origin or the upstream channel.
    pub items_in: u64,
    /// Items accepted by the segment's sinks, or emitted by its last stage
    /// when the segment is terminal. Items a sink rejected are not counted.
    pub items_out: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub error: Option<String>,
    /// Governor counters, for rate-limited segments.
    pub rate: Option<RateStats>,
    /// Counters of every channel this segment fed.
    pub sinks: Vec<ChannelStats>,
}

impl SegmentReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    #[serde(rename = "wall_time_ms", serialize_with = "serialize_millis")]
    pub wall_time: Duration,
    pub segments: Vec<SegmentReport>,
    /// True if any segment failed or panicked.
    pub failed: bool,
}

impl RunReport {
    pub(crate) fn empty() -> Self {
        Self {
            started_at: Utc::now(),
            wall_time: Duration::ZERO,
            segments: Vec::new(),
            failed: false,
        }
    }

    /// Report of the segment with the given ID.
    pub fn segment(&self, id: SegmentId) -> Option<&SegmentReport> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Report of the last segment in the chain.
    pub fn terminal(&self) -> Option<&SegmentReport> {
        self.segments.iter().max_by_key(|s| s.id)
    }

    /// First recorded error message, in segment order.
    pub fn first_error(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| s.error.as_deref())
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> crate::error::PipelineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::PipelineError::Serialization(format!(
                "Failed to serialize run report: {}",
                e
            ))
        })
    }

    /// Write the report as JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> crate::error::PipelineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(value.as_secs_f64() * 1000.0)
}
