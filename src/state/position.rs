//! The paired position and its derived quantities.

use crate::exchange::Outcome;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Shares and cost held on each side of the market.
///
/// `version` is assigned by the store on every accepted write and is the only
/// thing used for conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub yes_cost: Decimal,
    pub no_cost: Decimal,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            yes_qty: Decimal::ZERO,
            no_qty: Decimal::ZERO,
            yes_cost: Decimal::ZERO,
            no_cost: Decimal::ZERO,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

impl Position {
    pub fn qty(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_qty,
            Outcome::No => self.no_qty,
        }
    }

    pub fn cost(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_cost,
            Outcome::No => self.no_cost,
        }
    }

    /// Average entry price, undefined while the side is empty.
    pub fn avg(&self, outcome: Outcome) -> Option<Decimal> {
        let qty = self.qty(outcome);
        if qty > Decimal::ZERO {
            Some(self.cost(outcome) / qty)
        } else {
            None
        }
    }

    pub fn avg_yes(&self) -> Option<Decimal> {
        self.avg(Outcome::Yes)
    }

    pub fn avg_no(&self) -> Option<Decimal> {
        self.avg(Outcome::No)
    }

    /// `yes_qty - no_qty`; positive means YES-heavy.
    pub fn delta(&self) -> Decimal {
        self.yes_qty - self.no_qty
    }

    /// Sum of both average prices, once both sides are held.
    pub fn pair_cost(&self) -> Option<Decimal> {
        Some(self.avg_yes()? + self.avg_no()?)
    }

    pub fn locked_pairs(&self) -> Decimal {
        self.yes_qty.min(self.no_qty)
    }

    /// Guaranteed payout margin on matched pairs.
    pub fn locked_profit(&self) -> Decimal {
        match self.pair_cost() {
            Some(pair_cost) => self.locked_pairs() * (Decimal::ONE - pair_cost).max(Decimal::ZERO),
            None => Decimal::ZERO,
        }
    }

    pub fn cost_basis(&self) -> Decimal {
        self.yes_cost + self.no_cost
    }

    pub fn is_flat(&self) -> bool {
        self.yes_qty.is_zero() && self.no_qty.is_zero()
    }

    /// Side holding more shares, if unbalanced.
    pub fn leading_side(&self) -> Option<Outcome> {
        let delta = self.delta();
        if delta > Decimal::ZERO {
            Some(Outcome::Yes)
        } else if delta < Decimal::ZERO {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Value of the holdings at the given bids.
    pub fn mark_to_market(&self, yes_bid: Decimal, no_bid: Decimal) -> Decimal {
        self.yes_qty * yes_bid + self.no_qty * no_bid
    }

    /// Copy with a confirmed purchase applied.
    pub fn with_buy(&self, outcome: Outcome, qty: Decimal, price: Decimal) -> Position {
        let mut next = self.clone();
        match outcome {
            Outcome::Yes => {
                next.yes_qty += qty;
                next.yes_cost += qty * price;
            }
            Outcome::No => {
                next.no_qty += qty;
                next.no_cost += qty * price;
            }
        }
        next
    }

    /// Copy with a confirmed sale applied, plus the realized P&L.
    ///
    /// Cost is released at the side's average price, so the remaining average
    /// is unchanged. Sales beyond the held quantity are clamped.
    pub fn with_sale(&self, outcome: Outcome, qty: Decimal, price: Decimal) -> (Position, Decimal) {
        let held = self.qty(outcome);
        let sold = qty.min(held);
        if sold <= Decimal::ZERO {
            return (self.clone(), Decimal::ZERO);
        }

        let avg = self.avg(outcome).unwrap_or(Decimal::ZERO);
        let released = if sold == held {
            self.cost(outcome)
        } else {
            avg * sold
        };
        let realized = sold * price - released;

        let mut next = self.clone();
        match outcome {
            Outcome::Yes => {
                next.yes_qty -= sold;
                next.yes_cost -= released;
            }
            Outcome::No => {
                next.no_qty -= sold;
                next.no_cost -= released;
            }
        }
        (next, realized)
    }

    /// Structural invariants every stored position must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("yes_qty", self.yes_qty),
            ("no_qty", self.no_qty),
            ("yes_cost", self.yes_cost),
            ("no_cost", self.no_cost),
        ] {
            if value < Decimal::ZERO {
                return Err(format!("{} is negative ({})", name, value));
            }
        }
        Ok(())
    }
}
