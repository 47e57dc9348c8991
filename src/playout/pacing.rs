//! Latency pacing

use super::sink::BufferWindow;
use crate::config::PlayoutConfig;

/// Normal playback rate
pub const NORMAL_RATE: f64 = 1.0;

/// Adjustment to apply to the sink on a tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pacing {
    /// Jump to this position
    pub seek_to: Option<f64>,
    /// Switch to this playback rate
    pub rate: Option<f64>,
}

/// Decide how to hold latency down given the buffered window
///
/// More than `hard_ceiling` ahead jumps to just behind the live edge at
/// normal speed; more than `soft_threshold` ahead plays slightly fast;
/// anything else plays at normal speed. A rate is only returned when it
/// differs from `current_rate`.
pub fn pace(
    window: BufferWindow,
    position: f64,
    current_rate: f64,
    config: &PlayoutConfig,
) -> Pacing {
    let ahead = window.ahead_of(position);

    let (seek_to, target_rate) = if ahead > config.hard_ceiling {
        let target = (window.end - config.live_edge_offset).max(window.start);
        (Some(target), NORMAL_RATE)
    } else if ahead > config.soft_threshold {
        (None, config.catchup_rate)
    } else {
        (None, NORMAL_RATE)
    };

    let rate = ((target_rate - current_rate).abs() > f64::EPSILON).then_some(target_rate);
    Pacing { seek_to, rate }
}
