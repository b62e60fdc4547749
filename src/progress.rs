//! Cumulative, server-reconciled learning progress.
//!
//! The [`ProgressSnapshot`] exists once per user and is mutated only by the
//! reconciliation engine. UI actions never advance it directly - they append
//! mutations, and the snapshot catches up when those acknowledge.

use serde::{Deserialize, Serialize};

/// Server-reconciled view of XP, level and badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub xp: u64,
    pub level: u32,
    pub badges: Vec<String>,
    /// Last successful reconciliation (epoch millis, 0 = never)
    pub last_reconciled_at: i64,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            xp: 0,
            level: 1,
            badges: Vec::new(),
            last_reconciled_at: 0,
        }
    }
}

impl ProgressSnapshot {
    /// Overlay additional XP on this snapshot, recomputing the level.
    /// Badges are unchanged - they are server-granted only.
    #[must_use]
    pub fn with_xp_added(&self, delta: u64) -> Self {
        let xp = self.xp + delta;
        Self {
            xp,
            level: level_for_xp(xp),
            badges: self.badges.clone(),
            last_reconciled_at: self.last_reconciled_at,
        }
    }
}

/// Level thresholds: hand-tuned curve up to level 10, then a flat
/// 1000 XP per level beyond.
#[must_use]
pub fn level_for_xp(xp: u64) -> u32 {
    const THRESHOLDS: [u64; 10] = [100, 300, 600, 1_000, 1_500, 2_100, 2_800, 3_600, 4_500, 5_500];
    for (i, threshold) in THRESHOLDS.iter().enumerate() {
        if xp < *threshold {
            return (i + 1) as u32;
        }
    }
    10 + ((xp - 5_500) / 1_000) as u32 + 1
}
