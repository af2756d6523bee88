//! Which extractions get judged each iteration.
//!
//! The sampling rate decays with iteration count. Failed and low-confidence
//! extractions are always judged; the rest of the budget is filled uniformly
//! at random.

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::info;

use crate::extraction::Extraction;

/// Confidence below which an extraction is always sampled.
pub const DEFAULT_PRIORITY_CONFIDENCE: f64 = 0.6;

/// Fraction of extractions to judge at `iteration`.
pub fn sampling_rate(iteration: i64) -> f64 {
    match iteration {
        i if i <= 0 => 1.0,
        1..=3 => 0.5,
        4..=9 => 0.2,
        _ => 0.05,
    }
}

/// Anything the controller can sample from.
pub trait Sampleable {
    fn is_failed(&self) -> bool;
    fn confidence(&self) -> f64;
}

impl Sampleable for Extraction {
    fn is_failed(&self) -> bool {
        Extraction::is_failed(self)
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }
}

#[derive(Debug)]
pub struct Selection<'a, T> {
    pub items: Vec<&'a T>,
    /// Tag recorded on every judgment made from this selection.
    pub method: String,
}

#[derive(Debug, Clone)]
pub struct SamplingController {
    priority_confidence: f64,
}

impl Default for SamplingController {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY_CONFIDENCE)
    }
}

impl SamplingController {
    pub fn new(priority_confidence: f64) -> Self {
        Self {
            priority_confidence,
        }
    }

    pub fn select<'a, T, R>(
        &self,
        items: &'a [T],
        iteration: i64,
        force_full: bool,
        rng: &mut R,
    ) -> Selection<'a, T>
    where
        T: Sampleable,
        R: Rng + ?Sized,
    {
        if force_full || iteration <= 0 {
            return Selection {
                items: items.iter().collect(),
                method: "full".to_string(),
            };
        }

        let rate = sampling_rate(iteration);
        let target = ((items.len() as f64 * rate).floor() as usize).max(1);

        let (priority, normal): (Vec<&T>, Vec<&T>) = items
            .iter()
            .partition(|item| item.is_failed() || item.confidence() < self.priority_confidence);

        let budget = target.saturating_sub(priority.len()).min(normal.len());
        let random: Vec<&T> = normal.choose_multiple(rng, budget).copied().collect();

        let method = format!(
            "priority+random(rate={:.0}%, priority={}, random={}, n={}/{})",
            rate * 100.0,
            priority.len(),
            random.len(),
            priority.len() + random.len(),
            items.len()
        );
        info!(iteration, selected = priority.len() + random.len(), total = items.len(), %method, "sampled extractions");

        let mut selected = priority;
        selected.extend(random);
        Selection {
            items: selected,
            method,
        }
    }
}
