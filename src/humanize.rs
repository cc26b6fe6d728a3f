//! Input timing for browser interaction.
//!
//! Every click and keystroke the keeper sends goes through these plans, so
//! no two attempts produce an identical input timing trace. The exact
//! ranges are not load-bearing; the variability is.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

/// Pause before pressing the mouse button.
pub fn pre_click_pause() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(100..=300))
}

/// Pause after a click that drives a page transition.
pub fn post_click_pause() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(300..=2000))
}

/// Delay between two keystrokes. Occasionally a longer "thinking" pause.
pub fn key_delay() -> Duration {
    let mut rng = rand::thread_rng();
    if rng.gen_ratio(1, 12) {
        Duration::from_millis(rng.gen_range(300..=700))
    } else {
        Duration::from_millis(rng.gen_range(40..=160))
    }
}

/// Randomize a click target within a small radius so repeated clicks on
/// the same element never land on the same pixel.
pub fn jitter_target(target: Vec2, radius: f64) -> Vec2 {
    let mut rng = rand::thread_rng();
    Vec2 {
        x: target.x + rng.gen_range(-radius..=radius),
        y: target.y + rng.gen_range(-radius..=radius),
    }
}

/// A short multi-step cursor path from `from` to `to`: way-points along
/// the segment, each displaced off the straight line.
pub fn cursor_path(from: Vec2, to: Vec2, steps: usize) -> Vec<Vec2> {
    let mut rng = rand::thread_rng();
    let steps = steps.max(2);
    let mut path = Vec::with_capacity(steps);
    for i in 1..=steps {
        let t = i as f64 / steps as f64;
        let drift = if i == steps {
            0.0
        } else {
            rng.gen_range(-8.0..=8.0)
        };
        path.push(Vec2 {
            x: from.x + (to.x - from.x) * t + drift,
            y: from.y + (to.y - from.y) * t + drift * 0.6,
        });
    }
    path
}
