use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BPS_DENOMINATOR: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeeError {
    #[error("Fee rate {0} bps exceeds {BPS_DENOMINATOR}")]
    RateTooHigh(u64),

    #[error("Combined fees exceed the withdrawn amount")]
    FeesExceedAmount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Route {
    SameChain,
    CrossChain { destination_chain_id: u64 },
}

impl Route {
    /// A cross-chain route back to the pool's own chain is a same-chain
    /// withdrawal: no solver, no bridge leg, no refund secrets.
    pub fn resolve(self, native_chain_id: u64) -> Self {
        match self {
            Route::CrossChain {
                destination_chain_id,
            } if destination_chain_id == native_chain_id => Route::SameChain,
            other => other,
        }
    }

    pub fn is_cross_chain(&self) -> bool {
        matches!(self, Route::CrossChain { .. })
    }
}

/// Protocol-wide fee rates in basis points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub relay_fee_bps: u64,
    pub solver_fee_bps: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub route: Route,
    pub withdraw_amount: U256,
    pub execution_fee: U256,
    pub solver_fee: U256,
    pub you_receive: U256,
}

impl FeeSchedule {
    pub fn quote(
        &self,
        amount: U256,
        route: Route,
        native_chain_id: u64,
    ) -> Result<FeeQuote, FeeError> {
        for bps in [self.relay_fee_bps, self.solver_fee_bps] {
            if bps > BPS_DENOMINATOR {
                return Err(FeeError::RateTooHigh(bps));
            }
        }

        let route = route.resolve(native_chain_id);
        let execution_fee = apply_bps(amount, self.relay_fee_bps);
        let solver_fee = if route.is_cross_chain() {
            apply_bps(amount, self.solver_fee_bps)
        } else {
            U256::ZERO
        };

        let you_receive = amount
            .checked_sub(execution_fee)
            .and_then(|rest| rest.checked_sub(solver_fee))
            .ok_or(FeeError::FeesExceedAmount)?;

        Ok(FeeQuote {
            route,
            withdraw_amount: amount,
            execution_fee,
            solver_fee,
            you_receive,
        })
    }
}

fn apply_bps(amount: U256, bps: u64) -> U256 {
    amount * U256::from(bps) / U256::from(BPS_DENOMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::parse_amount;

    const SCHEDULE: FeeSchedule = FeeSchedule {
        relay_fee_bps: 500,
        solver_fee_bps: 500,
    };

    #[test]
    fn test_same_chain_quote() {
        let quote = SCHEDULE
            .quote(parse_amount("0.5").unwrap(), Route::SameChain, 1)
            .unwrap();

        assert_eq!(quote.execution_fee, parse_amount("0.025").unwrap());
        assert_eq!(quote.solver_fee, U256::ZERO);
        assert_eq!(quote.you_receive, parse_amount("0.475").unwrap());
    }

    #[test]
    fn test_cross_chain_quote() {
        let route = Route::CrossChain {
            destination_chain_id: 10,
        };
        let quote = SCHEDULE
            .quote(parse_amount("0.5").unwrap(), route, 1)
            .unwrap();

        assert_eq!(quote.execution_fee, parse_amount("0.025").unwrap());
        assert_eq!(quote.solver_fee, parse_amount("0.025").unwrap());
        assert_eq!(quote.you_receive, parse_amount("0.45").unwrap());
    }

    #[test]
    fn test_cross_chain_to_native_chain_has_no_solver_fee() {
        let route = Route::CrossChain {
            destination_chain_id: 1,
        };
        let quote = SCHEDULE.quote(U256::from(10_000u64), route, 1).unwrap();

        assert_eq!(quote.route, Route::SameChain);
        assert_eq!(quote.solver_fee, U256::ZERO);
    }

    #[test]
    fn test_fee_identity_holds_for_odd_amounts() {
        let route = Route::CrossChain {
            destination_chain_id: 8453,
        };
        for raw in [1u64, 7, 19_999, 1_000_000_007] {
            let amount = U256::from(raw);
            let q = SCHEDULE.quote(amount, route, 1).unwrap();
            assert_eq!(q.you_receive + q.execution_fee + q.solver_fee, amount);
        }
    }

    #[test]
    fn test_rejects_rate_above_denominator() {
        let schedule = FeeSchedule {
            relay_fee_bps: 10_001,
            solver_fee_bps: 0,
        };
        assert_eq!(
            schedule.quote(U256::from(1u64), Route::SameChain, 1),
            Err(FeeError::RateTooHigh(10_001))
        );
    }

    #[test]
    fn test_fees_cannot_exceed_amount() {
        let schedule = FeeSchedule {
            relay_fee_bps: 6_000,
            solver_fee_bps: 6_000,
        };
        let route = Route::CrossChain {
            destination_chain_id: 10,
        };
        assert_eq!(
            schedule.quote(U256::from(100u64), route, 1),
            Err(FeeError::FeesExceedAmount)
        );
    }
}
