/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Per-mechanism, per-score atomic counters, updated at EOM only. One slot
//! per `(mechanism, score)` pair; `SHOW-COUNTER`/`RESET-COUNTER` read and
//! optionally zero the whole table atomically.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dkim::adsp::AdspScore;
use crate::dkim::atps::AtpsScore;
use crate::error::Score;

/// One score axis's fixed-size counter row. `N` is the number of distinct
/// score values the mechanism can produce (mirrors the source's
/// `*_SCORE_MAX`-sized arrays).
pub struct ScoreRow<const N: usize> {
    counts: [AtomicU64; N],
}

impl<const N: usize> ScoreRow<N> {
    fn new() -> Self {
        Self { counts: std::array::from_fn(|_| AtomicU64::new(0)) }
    }

    pub fn incr(&self, idx: usize) {
        if let Some(c) = self.counts.get(idx) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> [u64; N] {
        std::array::from_fn(|i| self.counts[i].load(Ordering::Relaxed))
    }

    /// Read-then-zero, used by `RESET-COUNTER`.
    pub fn take(&self) -> [u64; N] {
        std::array::from_fn(|i| self.counts[i].swap(0, Ordering::Relaxed))
    }
}

/// Seven generic result slots (pass/fail/none/neutral/policy/temperror/
/// permerror) shared by SPF, Sender-ID and DMARC, whose [`Score`] enum
/// covers that full set.
pub type GenericScoreRow = ScoreRow<7>;

fn score_index(score: Score) -> usize {
    match score {
        Score::Pass => 0,
        Score::Fail => 1,
        Score::None => 2,
        Score::Neutral => 3,
        Score::Policy => 4,
        Score::TempError => 5,
        Score::PermError => 6,
    }
}

pub fn score_name(idx: usize) -> &'static str {
    match idx {
        0 => "pass",
        1 => "fail",
        2 => "none",
        3 => "neutral",
        4 => "policy",
        5 => "temperror",
        6 => "permerror",
        _ => "unknown",
    }
}

fn adsp_index(score: AdspScore) -> usize {
    match score {
        AdspScore::Pass => 0,
        AdspScore::Unknown => 1,
        AdspScore::Fail => 2,
        AdspScore::Discard => 3,
        AdspScore::NxDomain => 4,
        AdspScore::TempError => 5,
        AdspScore::PermError => 6,
    }
}

pub fn adsp_score_name(idx: usize) -> &'static str {
    match idx {
        0 => "pass",
        1 => "unknown",
        2 => "fail",
        3 => "discard",
        4 => "nxdomain",
        5 => "temperror",
        6 => "permerror",
        _ => "unknown",
    }
}

fn atps_index(score: AtpsScore) -> usize {
    match score {
        AtpsScore::Pass => 0,
        AtpsScore::Fail => 1,
        AtpsScore::TempError => 2,
    }
}

pub fn atps_score_name(idx: usize) -> &'static str {
    match idx {
        0 => "pass",
        1 => "fail",
        2 => "temperror",
        _ => "unknown",
    }
}

/// The full statistics table backing the `SHOW-COUNTER`/`RESET-COUNTER`
/// control-channel commands.
pub struct Statistics {
    pub spf: GenericScoreRow,
    pub sender_id: GenericScoreRow,
    pub dkim: GenericScoreRow,
    pub dkim_adsp: ScoreRow<7>,
    pub dkim_atps: ScoreRow<3>,
    pub dmarc: GenericScoreRow,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            spf: GenericScoreRow::new(),
            sender_id: GenericScoreRow::new(),
            dkim: GenericScoreRow::new(),
            dkim_adsp: ScoreRow::new(),
            dkim_atps: ScoreRow::new(),
            dmarc: GenericScoreRow::new(),
        }
    }

    pub fn record_spf(&self, s: Score) {
        self.spf.incr(score_index(s));
    }

    pub fn record_sender_id(&self, s: Score) {
        self.sender_id.incr(score_index(s));
    }

    pub fn record_dkim(&self, s: Score) {
        self.dkim.incr(score_index(s));
    }

    pub fn record_dkim_adsp(&self, s: AdspScore) {
        self.dkim_adsp.incr(adsp_index(s));
    }

    pub fn record_dkim_atps(&self, s: AtpsScore) {
        self.dkim_atps.incr(atps_index(s));
    }

    pub fn record_dmarc(&self, s: Score) {
        self.dmarc.incr(score_index(s));
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = Statistics::new();
        assert_eq!(stats.spf.snapshot(), [0u64; 7]);
    }

    #[test]
    fn record_increments_the_right_slot_only() {
        let stats = Statistics::new();
        stats.record_spf(Score::Pass);
        stats.record_spf(Score::Pass);
        stats.record_spf(Score::Fail);
        let snap = stats.spf.snapshot();
        assert_eq!(snap[score_index(Score::Pass)], 2);
        assert_eq!(snap[score_index(Score::Fail)], 1);
        assert_eq!(snap.iter().sum::<u64>(), 3);
    }

    #[test]
    fn take_reads_and_zeroes_atomically() {
        let stats = Statistics::new();
        stats.record_dmarc(Score::Pass);
        let pre = stats.dmarc.take();
        assert_eq!(pre[score_index(Score::Pass)], 1);
        assert_eq!(stats.dmarc.snapshot(), [0u64; 7]);
    }
}
