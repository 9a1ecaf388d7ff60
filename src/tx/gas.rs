//! Gas price escalation and resolution

use crate::chain::ChainConnection;
use crate::config::TxServiceConfig;
use crate::error::{TxServiceError, TxServiceResult};

use ethers::types::U256;
use tracing::{debug, error};

/// Price for a replacement transaction: `price + price * percent / 100 + 1`.
///
/// The trailing `+ 1` keeps the result strictly above `price` even when the
/// percentage truncates to zero.
pub fn bumped_gas_price(price: U256, bump_percent: u64) -> U256 {
    price
        .saturating_add(price.saturating_mul(U256::from(bump_percent)) / 100)
        .saturating_add(U256::one())
}

/// Fail with `MaxGasPriceReached` when `price` is above the ceiling
pub fn ensure_below_ceiling(chain_id: u64, price: U256, ceiling: U256) -> TxServiceResult<()> {
    if price > ceiling {
        return Err(TxServiceError::MaxGasPriceReached {
            chain_id,
            attempted: price,
            max: ceiling,
        });
    }
    Ok(())
}

/// Query the live gas price, falling back to the configured initial price
pub async fn resolve_gas_price(
    connection: &dyn ChainConnection,
    config: &TxServiceConfig,
) -> TxServiceResult<U256> {
    let chain_id = connection.chain_id();
    match connection.gas_price().await {
        Ok(price) => {
            debug!("Live gas price for chain {}: {}", chain_id, price);
            Ok(price)
        }
        Err(e) => {
            error!(
                chain_id,
                error = %e,
                "Gas price quote failed, attempting to default to initial gas price"
            );
            config
                .chain_initial_gas_price
                .get(&chain_id)
                .copied()
                .ok_or(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_adds_one_when_percentage_truncates() {
        assert_eq!(bumped_gas_price(U256::from(1), 50), U256::from(2));
        assert_eq!(bumped_gas_price(U256::from(2), 50), U256::from(4));
    }

    #[test]
    fn test_bump_applies_percentage() {
        let gwei = U256::from(1_000_000_000u64);
        assert_eq!(
            bumped_gas_price(gwei * 10, 20),
            gwei * 12 + U256::one()
        );
        assert_eq!(bumped_gas_price(U256::zero(), 20), U256::one());
    }

    #[test]
    fn test_ceiling() {
        assert!(ensure_below_ceiling(1, U256::from(3), U256::from(3)).is_ok());
        let err = ensure_below_ceiling(1, U256::from(5), U256::from(3)).unwrap_err();
        assert!(matches!(
            err,
            TxServiceError::MaxGasPriceReached { attempted, max, .. }
                if attempted == U256::from(5) && max == U256::from(3)
        ));
    }
}
