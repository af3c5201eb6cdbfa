//! Synthetic frame workload.
//!
//! A five-stage video-like chain used by the binary and the benches:
//!
//! ```text
//! read → annotate → transform → render → encode
//! ```
//!
//! Every stage does a little real work on the frame buffer and then sleeps
//! for its configured cost, so the chain behaves like a camera feed whose
//! stages have uneven latencies.

use crate::config::{PipelineConfig, StageCosts, WorkloadConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{Emitter, Flow, Origin, Pipeline, PipelineBuilder, Stage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of stages after the reader.
pub const STAGE_COUNT: usize = 4;

/// A synthetic grayscale frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Bounding boxes found by the annotate stage: (x, y, w, h).
    pub regions: Vec<(u32, u32, u32, u32)>,
    /// Filled in by the encode stage.
    pub encoded: Option<Vec<u8>>,
}

impl Frame {
    fn synthetic(index: u64, width: u32, height: u32) -> Self {
        let len = (width as usize) * (height as usize);
        let pixels = (0..len)
            .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(index * 7) % 251) as u8)
            .collect();
        Self {
            index,
            width,
            height,
            pixels,
            regions: Vec::new(),
            encoded: None,
        }
    }
}

fn spend(cost: Duration) {
    if !cost.is_zero() {
        std::thread::sleep(cost);
    }
}

/// Origin producing `frames` synthetic frames.
pub struct FrameReader {
    config: WorkloadConfig,
    next: u64,
}

impl FrameReader {
    pub fn new(config: WorkloadConfig) -> Self {
        Self { config, next: 0 }
    }
}

impl Origin<Frame> for FrameReader {
    fn name(&self) -> &str {
        "read"
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(PipelineError::setup(
                "read",
                format!(
                    "frame size must be non-zero, got {}x{}",
                    self.config.width, self.config.height
                ),
            ));
        }
        Ok(())
    }

    fn produce(&mut self) -> PipelineResult<Option<Frame>> {
        if self.next >= self.config.frames {
            return Ok(None);
        }
        spend(self.config.costs.read);
        let frame = Frame::synthetic(self.next, self.config.width, self.config.height);
        self.next += 1;
        Ok(Some(frame))
    }
}

/// Marks the brightest tile of every frame.
pub struct Annotate {
    cost: Duration,
    tile: u32,
}

impl Stage<Frame> for Annotate {
    fn name(&self) -> &str {
        "annotate"
    }

    fn process(&mut self, mut frame: Frame, out: &mut Emitter<Frame>) -> PipelineResult<Flow> {
        spend(self.cost);
        let tile = self.tile.min(frame.width).min(frame.height).max(1);
        let mut best = (0u64, 0u32, 0u32);
        for ty in (0..frame.height).step_by(tile as usize) {
            for tx in (0..frame.width).step_by(tile as usize) {
                let mut sum = 0u64;
                for y in ty..(ty + tile).min(frame.height) {
                    let row = (y * frame.width) as usize;
                    for x in tx..(tx + tile).min(frame.width) {
                        sum += u64::from(frame.pixels[row + x as usize]);
                    }
                }
                if sum > best.0 {
                    best = (sum, tx, ty);
                }
            }
        }
        frame.regions.push((best.1, best.2, tile, tile));
        out.emit(frame);
        Ok(Flow::Continue)
    }
}

/// Mirrors the frame horizontally.
pub struct Transform {
    cost: Duration,
}

impl Stage<Frame> for Transform {
    fn name(&self) -> &str {
        "transform"
    }

    fn process(&mut self, mut frame: Frame, out: &mut Emitter<Frame>) -> PipelineResult<Flow> {
        spend(self.cost);
        let width = frame.width as usize;
        for row in frame.pixels.chunks_mut(width) {
            row.reverse();
        }
        for region in &mut frame.regions {
            region.0 = frame.width - region.0 - region.2.min(frame.width - region.0);
        }
        out.emit(frame);
        Ok(Flow::Continue)
    }
}

/// Draws region outlines into the pixel buffer.
pub struct Render {
    cost: Duration,
}

impl Stage<Frame> for Render {
    fn name(&self) -> &str {
        "render"
    }

    fn process(&mut self, mut frame: Frame, out: &mut Emitter<Frame>) -> PipelineResult<Flow> {
        spend(self.cost);
        let width = frame.width;
        for &(x, y, w, h) in &frame.regions {
            let x1 = (x + w).min(width) - 1;
            let y1 = (y + h).min(frame.height) - 1;
            for px in x..=x1 {
                frame.pixels[(y * width + px) as usize] = u8::MAX;
                frame.pixels[(y1 * width + px) as usize] = u8::MAX;
            }
            for py in y..=y1 {
                frame.pixels[(py * width + x) as usize] = u8::MAX;
                frame.pixels[(py * width + x1) as usize] = u8::MAX;
            }
        }
        out.emit(frame);
        Ok(Flow::Continue)
    }
}

/// Shared counters of the encode stage.
#[derive(Debug, Default)]
pub struct EncodeStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    /// Index of the last frame encoded, plus one (0 = none yet).
    pub last_index: AtomicU64,
}

impl EncodeStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Run-length encodes each frame and records the output size.
pub struct Encode {
    cost: Duration,
    stats: Arc<EncodeStats>,
}

impl Encode {
    fn rle(pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut iter = pixels.iter().copied().peekable();
        while let Some(value) = iter.next() {
            let mut run = 1u8;
            while run < u8::MAX && iter.peek() == Some(&value) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(value);
        }
        out
    }
}

impl Stage<Frame> for Encode {
    fn name(&self) -> &str {
        "encode"
    }

    fn process(&mut self, mut frame: Frame, out: &mut Emitter<Frame>) -> PipelineResult<Flow> {
        spend(self.cost);
        let encoded = Self::rle(&frame.pixels);
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        self.stats
            .last_index
            .store(frame.index + 1, Ordering::Relaxed);
        frame.encoded = Some(encoded);
        out.emit(frame);
        Ok(Flow::Continue)
    }
}

/// Builder for the synthetic chain, before cut points are chosen.
pub fn frame_chain(workload: &WorkloadConfig) -> (PipelineBuilder<Frame>, Arc<EncodeStats>) {
    let stats = Arc::new(EncodeStats::default());
    let StageCosts {
        annotate,
        transform,
        render,
        encode,
        ..
    } = workload.costs.clone();
    let builder = PipelineBuilder::new(FrameReader::new(workload.clone()))
        .stage(Annotate {
            cost: annotate,
            tile: 16,
        })
        .stage(Transform { cost: transform })
        .stage(Render { cost: render })
        .stage(Encode {
            cost: encode,
            stats: Arc::clone(&stats),
        });
    (builder, stats)
}

/// Assemble the synthetic chain as `config` describes.
pub fn build_pipeline(config: &PipelineConfig) -> PipelineResult<(Pipeline<Frame>, Arc<EncodeStats>)> {
    let (builder, stats) = frame_chain(&config.workload);
    let pipeline = builder
        .channel_capacity(config.channel_capacity)
        .overflow_policy(config.overflow)
        .assemble(config.cut_points())?;
    Ok((pipeline, stats))
}
