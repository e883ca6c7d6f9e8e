//!
//! Staking reward calculator.
//!
//! The consumption rate grows linearly from `min_consumption_rate` for a
//! zero-length stake to `max_consumption_rate` for a full minting period,
//! and the reward is the stake's share of the remaining supply at that rate.
//!

use {
    crate::data_model::{Amount, Timestamp},
    config::staking::{RewardConfig, PERCENT_DENOMINATOR},
    num_bigint::BigUint,
    std::convert::TryFrom,
};

/// Reward for staking `stake` for `duration` seconds while `current_supply`
/// is in circulation. Never exceeds the remaining supply.
pub fn calculate(
    cfg: &RewardConfig,
    duration: Timestamp,
    stake: Amount,
    current_supply: Amount,
) -> Amount {
    if current_supply == 0 || cfg.minting_period == 0 {
        return 0;
    }
    let remaining = cfg.supply_cap.saturating_sub(current_supply);
    if remaining == 0 {
        return 0;
    }
    let duration = duration.min(cfg.minting_period);

    let bonus = cfg
        .max_consumption_rate
        .saturating_sub(cfg.min_consumption_rate);
    let rate_num = BigUint::from(bonus) * duration
        + BigUint::from(cfg.min_consumption_rate) * cfg.minting_period;
    let rate_den = BigUint::from(PERCENT_DENOMINATOR) * cfg.minting_period;

    let reward = BigUint::from(remaining) * rate_num * stake * duration
        / rate_den
        / current_supply
        / cfg.minting_period;

    u64::try_from(reward).map_or(remaining, |r| r.min(remaining))
}
