//! Rising-close streaks over 4-hour bars.

use crate::domain::Candle4h;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Streak {
    /// Consecutive bars, counted back from the newest, each closing
    /// strictly above the one before it.
    pub count: usize,
    /// Percent change from the close before the streak to the newest close.
    pub change_pct: Decimal,
}

/// Streak ending at the newest of `bars` (ascending by period).
pub fn rising_streak(bars: &[Candle4h]) -> Streak {
    let count = bars
        .windows(2)
        .rev()
        .take_while(|pair| pair[1].close > pair[0].close)
        .count();

    if count == 0 {
        return Streak::default();
    }

    let newest = bars[bars.len() - 1].close;
    let base = bars[bars.len() - 1 - count].close;
    let change_pct = if base.is_zero() {
        Decimal::ZERO
    } else {
        (newest - base) / base * Decimal::ONE_HUNDRED
    };

    Streak { count, change_pct }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedStreak {
    pub symbol: String,
    #[serde(flatten)]
    pub streak: Streak,
}

/// Longest streak first; ties by larger change, then symbol.
pub fn rank_streaks(mut streaks: Vec<RankedStreak>) -> Vec<RankedStreak> {
    streaks.sort_by(|a, b| {
        b.streak
            .count
            .cmp(&a.streak.count)
            .then_with(|| b.streak.change_pct.cmp(&a.streak.change_pct))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    streaks
}
