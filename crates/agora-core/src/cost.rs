// Cost tracker
// Serialized ledger of per-call deltas with one-shot threshold events.
// Totals are monotone; readers always see a consistent snapshot.

use serde::{Deserialize, Serialize};

use agora_types::{
    AgoraError, Budget, BudgetEventKind, CostLedgerEntry, CostTotals, Result, UsdMicros,
};

const WARN_FRACTION: f64 = 0.70;
const SOFT_FRACTION: f64 = 0.90;

/// Tracks spend for one run against its plan budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTracker {
    budget: Budget,
    ledger: Vec<CostLedgerEntry>,
    totals: CostTotals,
    warn_emitted: bool,
    soft_emitted: bool,
    hard_emitted: bool,
}

impl CostTracker {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            ledger: Vec::new(),
            totals: CostTotals::default(),
            warn_emitted: false,
            soft_emitted: false,
            hard_emitted: false,
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn totals(&self) -> CostTotals {
        self.totals
    }

    pub fn ledger(&self) -> &[CostLedgerEntry] {
        &self.ledger
    }

    /// Record one delta and return any thresholds newly crossed, in order.
    /// Each threshold fires exactly once per run.
    pub fn record(&mut self, entry: CostLedgerEntry) -> Vec<BudgetEventKind> {
        self.totals.tokens_in += entry.tokens_in;
        self.totals.tokens_out += entry.tokens_out;
        self.totals.usd = self.totals.usd.saturating_add(entry.usd);
        self.ledger.push(entry);

        let fraction = self.fraction_used();
        let mut crossed = Vec::new();
        if !self.warn_emitted && fraction >= WARN_FRACTION {
            self.warn_emitted = true;
            crossed.push(BudgetEventKind::Warn);
        }
        if !self.soft_emitted && fraction >= SOFT_FRACTION {
            self.soft_emitted = true;
            crossed.push(BudgetEventKind::HitSoft);
        }
        if !self.hard_emitted && fraction >= 1.0 {
            self.hard_emitted = true;
            crossed.push(BudgetEventKind::HitHard);
        }
        crossed
    }

    /// Largest used fraction across the USD and token dimensions.
    pub fn fraction_used(&self) -> f64 {
        let usd_fraction = if self.budget.max_usd.0 == 0 {
            1.0
        } else {
            self.totals.usd.0 as f64 / self.budget.max_usd.0 as f64
        };
        let token_fraction = if self.budget.max_tokens == 0 {
            1.0
        } else {
            self.totals.total_tokens() as f64 / self.budget.max_tokens as f64
        };
        usd_fraction.max(token_fraction)
    }

    pub fn hard_hit(&self) -> bool {
        self.hard_emitted || self.fraction_used() >= 1.0
    }

    pub fn soft_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.warn_emitted {
            warnings.push(format!(
                "budget warning: {:.0}% of {} consumed",
                self.fraction_used() * 100.0,
                self.budget.max_usd
            ));
        }
        warnings
    }

    pub fn remaining_usd(&self) -> UsdMicros {
        self.budget.max_usd.saturating_sub(self.totals.usd)
    }

    pub fn remaining_fraction(&self) -> f64 {
        (1.0 - self.fraction_used()).max(0.0)
    }

    /// Preflight check: would adding this estimate exceed the hard budget?
    pub fn check_preflight(&self, tokens: u64, usd: UsdMicros) -> Result<()> {
        if self.hard_hit() {
            return Err(AgoraError::BudgetExceeded(
                "hard budget threshold already reached".into(),
            ));
        }
        let projected_usd = self.totals.usd.saturating_add(usd);
        let projected_tokens = self.totals.total_tokens() + tokens;
        if projected_usd > self.budget.max_usd {
            return Err(AgoraError::BudgetExceeded(format!(
                "projected spend {projected_usd} exceeds {}",
                self.budget.max_usd
            )));
        }
        if projected_tokens > self.budget.max_tokens {
            return Err(AgoraError::BudgetExceeded(format!(
                "projected {projected_tokens} tokens exceed {}",
                self.budget.max_tokens
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(turn: u32, tokens: u64, usd: u64) -> CostLedgerEntry {
        CostLedgerEntry {
            turn,
            agent: "finance".into(),
            tokens_in: tokens / 2,
            tokens_out: tokens - tokens / 2,
            usd: UsdMicros(usd),
            model: "std-small".into(),
        }
    }

    fn tracker() -> CostTracker {
        CostTracker::new(Budget::new(UsdMicros(100_000), 10_000, 1_000))
    }

    #[test]
    fn thresholds_fire_once_in_order() {
        let mut tracker = tracker();
        assert!(tracker.record(entry(0, 1_000, 10_000)).is_empty());
        assert_eq!(
            tracker.record(entry(1, 1_000, 65_000)),
            vec![BudgetEventKind::Warn]
        );
        assert_eq!(
            tracker.record(entry(2, 1_000, 20_000)),
            vec![BudgetEventKind::HitSoft]
        );
        assert_eq!(
            tracker.record(entry(3, 1_000, 10_000)),
            vec![BudgetEventKind::HitHard]
        );
        // Further spend crosses nothing new.
        assert!(tracker.record(entry(4, 100, 1_000)).is_empty());
        assert!(tracker.hard_hit());
    }

    #[test]
    fn one_delta_can_cross_several_thresholds() {
        let mut tracker = tracker();
        let crossed = tracker.record(entry(0, 500, 100_000));
        assert_eq!(
            crossed,
            vec![
                BudgetEventKind::Warn,
                BudgetEventKind::HitSoft,
                BudgetEventKind::HitHard
            ]
        );
    }

    #[test]
    fn totals_are_monotone() {
        let mut tracker = tracker();
        let mut last = 0u64;
        for turn in 0..10 {
            tracker.record(entry(turn, 100, 1_000));
            let total = tracker.totals().usd.0;
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn preflight_rejects_over_budget_estimates() {
        let mut tracker = tracker();
        tracker.record(entry(0, 9_000, 10_000));
        assert!(tracker.check_preflight(500, UsdMicros(1_000)).is_ok());
        let err = tracker.check_preflight(2_000, UsdMicros(0)).unwrap_err();
        assert!(matches!(err, AgoraError::BudgetExceeded(_)));
    }

    #[test]
    fn token_dimension_also_counts() {
        let mut tracker = CostTracker::new(Budget::new(UsdMicros(u64::MAX), 1_000, 500));
        let crossed = tracker.record(entry(0, 1_000, 1));
        assert!(crossed.contains(&BudgetEventKind::HitHard));
    }
}
