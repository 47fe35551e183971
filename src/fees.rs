use crate::error::{Error, Result};
use crate::types::FeeQuote;
use ethers::types::U256;

/// Upper bound for any configured percentage (10x the base fee).
pub const MAX_PERCENTAGE: u32 = 1_000;

/// How the fee caps of a UserOperation are derived from the network base fee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeePolicy {
    /// Floor for `maxPriorityFeePerGas`, in wei.
    pub min_priority_fee: U256,
    /// `maxPriorityFeePerGas` as a percentage of the base fee.
    pub priority_fee_percentage: u32,
    /// `maxFeePerGas` as a percentage of the base fee.
    pub max_fee_percentage: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_priority_fee: U256::from(10_000_000u64),
            priority_fee_percentage: 20,
            max_fee_percentage: 100,
        }
    }
}

impl FeePolicy {
    pub fn new(
        min_priority_fee: U256,
        priority_fee_percentage: u32,
        max_fee_percentage: u32,
    ) -> Result<Self> {
        let policy = Self {
            min_priority_fee,
            priority_fee_percentage,
            max_fee_percentage,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority_fee_percentage > MAX_PERCENTAGE {
            return Err(Error::Config(format!(
                "priority fee percentage {} exceeds {MAX_PERCENTAGE}",
                self.priority_fee_percentage
            )));
        }
        if self.max_fee_percentage > MAX_PERCENTAGE {
            return Err(Error::Config(format!(
                "max fee percentage {} exceeds {MAX_PERCENTAGE}",
                self.max_fee_percentage
            )));
        }
        Ok(())
    }

    /// Fee caps for the given base fee. The priority fee never exceeds the max fee.
    pub fn quote(&self, base_fee: U256) -> FeeQuote {
        let priority = percent_of(base_fee, self.priority_fee_percentage).max(self.min_priority_fee);
        let max_fee = percent_of(base_fee, self.max_fee_percentage).max(priority);
        FeeQuote {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
        }
    }
}

/// Raises `quote` so each cap is at least `previous` bumped by `bump_percentage`.
///
/// Bundlers only accept a same-nonce replacement when both caps increase.
pub fn apply_floor(quote: FeeQuote, previous: FeeQuote, bump_percentage: u32) -> FeeQuote {
    let bump = |v: U256| v.saturating_add(percent_of(v, bump_percentage));
    let priority = quote
        .max_priority_fee_per_gas
        .max(bump(previous.max_priority_fee_per_gas));
    let max_fee = quote
        .max_fee_per_gas
        .max(bump(previous.max_fee_per_gas))
        .max(priority);
    FeeQuote {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority,
    }
}

fn percent_of(v: U256, percentage: u32) -> U256 {
    v.saturating_mul(U256::from(percentage)) / U256::from(100u64)
}
