//! Rate policy and the governor that enforces it.
//!
//! The root of a pipeline usually stands for a real-time or finite resource
//! (a camera, a file being replayed), so the segment holding it is driven at
//! a governed rate instead of as fast as possible.
//!
//! # Modes
//!
//! - **Static** (`dynamic_rate == false`): a fixed delay of `1 / max_rate`
//!   between deliveries. `max_rate == 0` means unthrottled.
//! - **Dynamic**: every `update_interval` the governor samples the fullest
//!   channel fed by the root segment. Below the low-water mark the rate grows
//!   by `dynamic_rate_scale`; at or above the high-water mark it shrinks by the
//!   same factor, starting from the measured delivery rate if that is lower.
//!   The rate never exceeds `max_rate` (when non-zero).
//!
//! The first `startup_frames` deliveries are never delayed, which lets
//! downstream queues fill before the governor engages.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::channel::ChannelProbe;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lowest rate the dynamic law will shrink to, in items per second.
pub const MIN_DYNAMIC_RATE: f64 = 0.1;

/// Longest gap the governor enforces between two deliveries. Ceilings below
/// one item per day are paced at one item per day.
pub const MAX_DELIVERY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default multiplicative step for dynamic adjustment.
pub const DEFAULT_DYNAMIC_RATE_SCALE: f64 = 1.1;

/// Default period between dynamic recomputations.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// How fast a segment's origin is driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatePolicy {
    /// Ceiling in items per second; 0 means unthrottled.
    pub max_rate: f64,

    /// Adapt the rate to downstream queue pressure.
    pub dynamic_rate: bool,

    /// Multiplicative factor applied on each adjustment (must be > 1).
    pub dynamic_rate_scale: f64,

    /// Period between rate recomputations.
    #[serde(with = "duration_ms", rename = "update_interval_ms")]
    pub update_interval: Duration,

    /// Deliveries exempt from throttling at the start of a run.
    pub startup_frames: u64,

    /// Occupancy at which the dynamic law slows down. 0 derives it from the
    /// smallest fed channel (half its capacity).
    pub queue_throttle_threshold: usize,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            max_rate: 0.0,
            dynamic_rate: false,
            dynamic_rate_scale: DEFAULT_DYNAMIC_RATE_SCALE,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            startup_frames: 0,
            queue_throttle_threshold: 0,
        }
    }
}

impl RatePolicy {
    /// Drive the origin as fast as it can produce.
    pub fn unthrottled() -> Self {
        Self::default()
    }

    /// Fixed ceiling of `max_rate` items per second.
    pub fn fixed(max_rate: f64) -> Self {
        Self {
            max_rate,
            ..Self::default()
        }
    }

    /// Adaptive rate capped at `max_rate` (0 = no cap).
    pub fn dynamic(max_rate: f64) -> Self {
        Self {
            max_rate,
            dynamic_rate: true,
            ..Self::default()
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.dynamic_rate_scale = scale;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_startup_frames(mut self, frames: u64) -> Self {
        self.startup_frames = frames;
        self
    }

    pub fn with_throttle_threshold(mut self, threshold: usize) -> Self {
        self.queue_throttle_threshold = threshold;
        self
    }

    /// True when neither a ceiling nor adaptation is configured.
    pub fn is_unthrottled(&self) -> bool {
        self.max_rate <= 0.0 && !self.dynamic_rate
    }

    /// Reject policies the governor cannot enforce.
    pub fn validate(&self) -> PipelineResult<()> {
        if !self.max_rate.is_finite() || self.max_rate < 0.0 {
            return Err(PipelineError::Config(format!(
                "max_rate must be a finite number >= 0, got {}",
                self.max_rate
            )));
        }
        if self.dynamic_rate {
            if !(self.dynamic_rate_scale.is_finite() && self.dynamic_rate_scale > 1.0) {
                return Err(PipelineError::Config(format!(
                    "dynamic_rate_scale must be > 1, got {}",
                    self.dynamic_rate_scale
                )));
            }
            if self.update_interval.is_zero() {
                return Err(PipelineError::Config(
                    "update_interval must be non-zero for dynamic rate".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// One change made by the dynamic law.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateAdjustment {
    /// Previous rate; `None` was unthrottled.
    pub from: Option<f64>,
    pub to: Option<f64>,
    /// Occupancy that triggered the change.
    pub occupancy: usize,
    /// Deliveries per second over the last interval.
    pub measured_rate: f64,
}

/// Result of planning the next delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// How long to wait before delivering.
    pub delay: Duration,
    pub adjustment: Option<RateAdjustment>,
}

/// Counters reported after a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RateStats {
    pub delivered: u64,
    #[serde(serialize_with = "duration_ms::serialize")]
    pub total_delay: Duration,
    pub current_rate: Option<f64>,
    pub adjustments: u64,
}

/// Enforces a [`RatePolicy`] on a stream of deliveries.
///
/// Planning is separated from sleeping so the law can be driven with
/// synthetic timestamps: call [`RateGovernor::plan`] before a delivery, wait
/// for the returned delay, then call [`RateGovernor::record_delivery`].
/// [`RateGovernor::pace`] does all three against the wall clock.
pub struct RateGovernor {
    policy: RatePolicy,
    probes: Vec<ChannelProbe>,
    high_water: usize,
    low_water: usize,
    current_rate: Option<f64>,
    delivered: u64,
    last_delivery: Option<Instant>,
    window_start: Option<Instant>,
    window_deliveries: u64,
    total_delay: Duration,
    adjustments: u64,
}

impl RateGovernor {
    /// Create a governor watching the given downstream channels.
    pub fn new(policy: RatePolicy, probes: Vec<ChannelProbe>) -> Self {
        let high_water = if policy.queue_throttle_threshold > 0 {
            policy.queue_throttle_threshold
        } else {
            probes
                .iter()
                .map(|p| p.capacity() / 2)
                .min()
                .unwrap_or(0)
                .max(1)
        };
        let low_water = (high_water / 2).max(1);
        let current_rate = (policy.max_rate > 0.0).then_some(policy.max_rate);

        Self {
            policy,
            probes,
            high_water,
            low_water,
            current_rate,
            delivered: 0,
            last_delivery: None,
            window_start: None,
            window_deliveries: 0,
            total_delay: Duration::ZERO,
            adjustments: 0,
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Current target rate; `None` is unthrottled.
    pub fn current_rate(&self) -> Option<f64> {
        self.current_rate
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }

    pub fn stats(&self) -> RateStats {
        RateStats {
            delivered: self.delivered,
            total_delay: self.total_delay,
            current_rate: self.current_rate,
            adjustments: self.adjustments,
        }
    }

    /// Fullest watched channel right now.
    pub fn sample_occupancy(&self) -> usize {
        self.probes.iter().map(ChannelProbe::len).max().unwrap_or(0)
    }

    fn in_startup(&self) -> bool {
        self.delivered < self.policy.startup_frames
    }

    /// Decide how long to wait before the next delivery.
    pub fn plan(&mut self, now: Instant, occupancy: usize) -> Pacing {
        if self.in_startup() {
            return Pacing {
                delay: Duration::ZERO,
                adjustment: None,
            };
        }

        let adjustment = if self.policy.dynamic_rate {
            self.adapt(now, occupancy)
        } else {
            None
        };

        let delay = match (self.current_rate, self.last_delivery) {
            (Some(rate), Some(last)) => {
                let interval = delivery_interval(rate);
                (last + interval).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        };

        Pacing { delay, adjustment }
    }

    /// Note that a delivery happened at `at`.
    pub fn record_delivery(&mut self, at: Instant) {
        let startup = self.in_startup();
        self.delivered += 1;
        self.last_delivery = Some(at);
        // Startup deliveries do not count toward the measured rate.
        if !startup {
            self.window_start.get_or_insert(at);
            self.window_deliveries += 1;
        }
    }

    /// Plan, wait, and record one delivery against the wall clock.
    pub fn pace(&mut self) -> Option<RateAdjustment> {
        let occupancy = self.sample_occupancy();
        let pacing = self.plan(Instant::now(), occupancy);
        if !pacing.delay.is_zero() {
            wait_precise(pacing.delay);
            self.total_delay += pacing.delay;
        }
        self.record_delivery(Instant::now());

        if let Some(adj) = pacing.adjustment {
            tracing::debug!(
                "Rate adjusted {:?} -> {:?} (occupancy {}, measured {:.2}/s)",
                adj.from,
                adj.to,
                adj.occupancy,
                adj.measured_rate
            );
        }
        pacing.adjustment
    }

    fn adapt(&mut self, now: Instant, occupancy: usize) -> Option<RateAdjustment> {
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.policy.update_interval {
            return None;
        }

        let measured = self.window_deliveries as f64 / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.window_deliveries = 0;

        let scale = self.policy.dynamic_rate_scale;
        let from = self.current_rate;
        let to = if occupancy >= self.high_water {
            let base = match from {
                Some(rate) => rate.min(measured),
                None => measured,
            };
            Some((base / scale).max(MIN_DYNAMIC_RATE))
        } else if occupancy < self.low_water {
            from.map(|rate| {
                let grown = rate * scale;
                if self.policy.max_rate > 0.0 {
                    grown.min(self.policy.max_rate)
                } else {
                    grown
                }
            })
        } else {
            from
        };

        if to == from {
            return None;
        }
        self.current_rate = to;
        self.adjustments += 1;
        Some(RateAdjustment {
            from,
            to,
            occupancy,
            measured_rate: measured,
        })
    }
}

/// Gap between deliveries at `rate` items per second, clamped to
/// [`MAX_DELIVERY_INTERVAL`].
fn delivery_interval(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate)
        .map_or(MAX_DELIVERY_INTERVAL, |interval| interval.min(MAX_DELIVERY_INTERVAL))
}

/// Sleep for most of `duration`, then spin for sub-millisecond accuracy.
fn wait_precise(duration: Duration) {
    let deadline = Instant::now() + duration;
    if duration > Duration::from_millis(2) {
        std::thread::sleep(duration - Duration::from_millis(1));
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::channel::Channel;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_unthrottled_never_delays() {
        let mut gov = RateGovernor::new(RatePolicy::unthrottled(), Vec::new());
        let t0 = Instant::now();
        for i in 0..10 {
            let now = t0 + ms(i);
            assert_eq!(gov.plan(now, 0).delay, Duration::ZERO);
            gov.record_delivery(now);
        }
        assert_eq!(gov.current_rate(), None);
    }

    #[test]
    fn test_tiny_rate_is_clamped_not_panicking() {
        RatePolicy::fixed(1e-21).validate().unwrap();
        let mut gov = RateGovernor::new(RatePolicy::fixed(1e-21), Vec::new());
        let t0 = Instant::now();
        assert_eq!(gov.plan(t0, 0).delay, Duration::ZERO);
        gov.record_delivery(t0);
        assert_eq!(gov.plan(t0 + ms(1), 0).delay, MAX_DELIVERY_INTERVAL - ms(1));

        assert_eq!(delivery_interval(f64::MIN_POSITIVE), MAX_DELIVERY_INTERVAL);
        assert_eq!(delivery_interval(4.0), ms(250));
    }

    #[test]
    fn test_fixed_rate_spacing() {
        let mut gov = RateGovernor::new(RatePolicy::fixed(100.0), Vec::new());
        let t0 = Instant::now();
        assert_eq!(gov.plan(t0, 0).delay, Duration::ZERO);
        gov.record_delivery(t0);

        // 10ms interval, 3ms elapsed
        let delay = gov.plan(t0 + ms(3), 0).delay;
        assert!(delay > ms(6) && delay <= ms(7), "delay was {:?}", delay);

        // Already late: no delay
        assert_eq!(gov.plan(t0 + ms(25), 0).delay, Duration::ZERO);
    }

    #[test]
    fn test_startup_frames_are_exempt() {
        let policy = RatePolicy::fixed(1.0).with_startup_frames(3);
        let mut gov = RateGovernor::new(policy, Vec::new());
        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(gov.plan(t0, 0).delay, Duration::ZERO);
            gov.record_delivery(t0);
        }
        assert!(gov.plan(t0, 0).delay > ms(900));
    }

    #[test]
    fn test_dynamic_slows_under_pressure() {
        let policy = RatePolicy::dynamic(100.0)
            .with_scale(2.0)
            .with_update_interval(ms(100))
            .with_throttle_threshold(4);
        let mut gov = RateGovernor::new(policy, Vec::new());
        let t0 = Instant::now();

        let mut adjustment = None;
        for i in 0..=10 {
            let now = t0 + ms(i * 10);
            let pacing = gov.plan(now, 4);
            adjustment = adjustment.or(pacing.adjustment);
            gov.record_delivery(now);
        }

        let adj = adjustment.expect("rate should have been adjusted");
        assert_eq!(adj.from, Some(100.0));
        let to = adj.to.unwrap();
        assert!(to < 100.0, "rate did not decrease: {}", to);
        assert!(gov.current_rate().unwrap() < 100.0);
    }

    #[test]
    fn test_dynamic_recovers_but_respects_cap() {
        let policy = RatePolicy::dynamic(50.0)
            .with_scale(2.0)
            .with_update_interval(ms(10))
            .with_throttle_threshold(4);
        let mut gov = RateGovernor::new(policy, Vec::new());
        let t0 = Instant::now();
        gov.record_delivery(t0);

        // Pressure, then drained queues.
        gov.plan(t0 + ms(20), 8);
        let slowed = gov.current_rate().unwrap();
        assert!(slowed < 50.0);

        let mut now = t0 + ms(20);
        for _ in 0..20 {
            now += ms(20);
            gov.plan(now, 0);
            gov.record_delivery(now);
        }
        assert_eq!(gov.current_rate(), Some(50.0));
    }

    #[test]
    fn test_dynamic_without_cap_throttles_from_measured_rate() {
        let policy = RatePolicy::dynamic(0.0)
            .with_scale(2.0)
            .with_update_interval(ms(100))
            .with_throttle_threshold(2);
        let mut gov = RateGovernor::new(policy, Vec::new());
        assert_eq!(gov.current_rate(), None);

        let t0 = Instant::now();
        for i in 0..=20 {
            let now = t0 + ms(i * 5);
            gov.plan(now, 2);
            gov.record_delivery(now);
        }
        // ~200/s measured, halved
        let rate = gov.current_rate().expect("governor should have engaged");
        assert!(rate > 50.0 && rate < 150.0, "rate was {}", rate);
    }

    #[test]
    fn test_mid_band_holds_rate() {
        let policy = RatePolicy::dynamic(40.0)
            .with_update_interval(ms(10))
            .with_throttle_threshold(8);
        let mut gov = RateGovernor::new(policy, Vec::new());
        assert_eq!(gov.low_water(), 4);
        let t0 = Instant::now();
        gov.record_delivery(t0);
        assert!(gov.plan(t0 + ms(50), 5).adjustment.is_none());
        assert_eq!(gov.current_rate(), Some(40.0));
    }

    #[test]
    fn test_threshold_derived_from_channel_capacity() {
        let (sink, _source) = Channel::<u8>::new(10).split();
        let gov = RateGovernor::new(RatePolicy::dynamic(10.0), vec![sink.probe()]);
        assert_eq!(gov.high_water(), 5);
        assert_eq!(gov.low_water(), 2);
    }

    #[test]
    fn test_validate() {
        assert!(RatePolicy::fixed(30.0).validate().is_ok());
        assert!(RatePolicy::fixed(-1.0).validate().is_err());
        assert!(RatePolicy::fixed(f64::NAN).validate().is_err());
        assert!(RatePolicy::dynamic(10.0).with_scale(1.0).validate().is_err());
        assert!(RatePolicy::dynamic(10.0)
            .with_update_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_policy_toml_round_trip() {
        let policy = RatePolicy::dynamic(20.0)
            .with_update_interval(ms(250))
            .with_startup_frames(10);
        let text = toml::to_string(&policy).unwrap();
        assert!(text.contains("update_interval_ms = 250"));
        let back: RatePolicy = toml::from_str(&text).unwrap();
        assert_eq!(back, policy);
    }
}
