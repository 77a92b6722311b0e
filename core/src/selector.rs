//! Weighted-random avatar selection with soft anti-repetition.
//!
//! Every connected avatar starts at [`BASE_WEIGHT`]. Each appearance in the
//! recency window (index 0 = most recent) subtracts
//! `RECENCY_PENALTY * (window_len - index)`, never going below
//! [`MIN_WEIGHT`], so a recently used avatar stays possible but less likely.

use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

pub const BASE_WEIGHT: u32 = 100;
pub const RECENCY_PENALTY: u32 = 30;
pub const MIN_WEIGHT: u32 = 10;
pub const DEFAULT_RECENCY_WINDOW: usize = 3;

/// Most recently chosen avatars, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecencyWindow {
    entries: VecDeque<String>,
    #[serde(skip)]
    capacity: usize,
}

impl RecencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a choice, evicting the oldest entry once over capacity
    pub fn push(&mut self, avatar_id: &str) {
        self.entries.push_front(avatar_id.to_string());
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn most_recent(&self) -> Option<&str> {
        self.entries.front().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RecencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_WINDOW)
    }
}

#[derive(Debug, Clone)]
pub struct AvatarSelector {
    window_size: usize,
}

impl AvatarSelector {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }

    /// Empty recency window sized for this selector
    pub fn new_window(&self) -> RecencyWindow {
        RecencyWindow::new(self.window_size)
    }

    /// Current draw weight of every pool member
    pub fn weights(pool: &BTreeSet<String>, recency: &RecencyWindow) -> BTreeMap<String, u32> {
        let mut weights: BTreeMap<String, u32> =
            pool.iter().map(|id| (id.clone(), BASE_WEIGHT)).collect();
        let len = recency.len() as u32;
        for (index, avatar_id) in recency.entries().enumerate() {
            if let Some(weight) = weights.get_mut(avatar_id) {
                let reduction = RECENCY_PENALTY * (len - index as u32);
                *weight = weight.saturating_sub(reduction).max(MIN_WEIGHT);
            }
        }
        weights
    }

    /// Pick an avatar from `pool` and record it in `recency`.
    /// Returns `None` only when the pool is empty.
    pub fn choose<R: Rng + ?Sized>(
        &self,
        pool: &BTreeSet<String>,
        recency: &mut RecencyWindow,
        rng: &mut R,
    ) -> Option<String> {
        let chosen = match pool.len() {
            0 => return None,
            1 => pool.iter().next().cloned(),
            _ => {
                let weights = Self::weights(pool, recency);
                let total: u32 = weights.values().sum();
                let roll = rng.gen_range(0..total);
                let mut cumulative = 0;
                weights
                    .iter()
                    .find(|(_, weight)| {
                        cumulative += **weight;
                        roll < cumulative
                    })
                    .map(|(id, _)| id.clone())
            }
        }?;

        recency.push(&chosen);
        debug!(
            target: "selector",
            avatar_id = %chosen,
            pool = pool.len(),
            recent = ?recency.to_vec(),
            "Selected avatar"
        );
        Some(chosen)
    }
}

impl Default for AvatarSelector {
    fn default() -> Self {
        Self::new(DEFAULT_RECENCY_WINDOW)
    }
}
