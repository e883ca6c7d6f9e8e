//!
//! # Staking configuration
//!
//! All times are unix seconds, all amounts are nano-units.
//!

use {
    crate::{ConfigError, Result},
    serde::{Deserialize, Serialize},
    std::{
        fs::{self, File},
        io::{ErrorKind, Write},
    },
    tracing::info,
};


/// Nano-units per whole token.
pub const UNITS: u64 = 1_000_000_000;

/// Seconds in a day.
pub const DAY: u64 = 24 * 3600;

/// Parts-per-million denominator used by fee and rate fractions.
pub const PERCENT_DENOMINATOR: u64 = 1_000_000;

/// Network-wide reward schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RewardConfig {
    // rate paid for a full minting period, parts per million
    pub max_consumption_rate: u64,
    // rate paid for a zero-length stake, parts per million
    pub min_consumption_rate: u64,
    pub minting_period: u64,
    pub supply_cap: u64,
    // stakers whose window starts before this time earn nothing
    pub rewards_enabled_from: u64,
}

/// Bounds and fees enforced by the staking ledger and the block executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StakingConfig {
    pub min_validator_stake: u64,
    pub max_validator_stake: u64,
    pub min_delegator_stake: u64,
    pub min_delegation_fee: u32,
    pub min_stake_duration: u64,
    pub max_stake_duration: u64,
    pub max_validator_weight_factor: u64,
    pub max_future_start_time: u64,
    // how far a block timestamp may run ahead of the local clock
    pub sync_bound: u64,

    pub tx_fee: u64,
    pub add_primary_network_validator_fee: u64,
    pub add_subnet_validator_fee: u64,
    pub add_delegator_fee: u64,
    pub create_subnet_fee: u64,

    pub validator_set_cache_size: usize,
    pub max_block_txs: usize,
    pub mempool_size: usize,

    pub reward: RewardConfig,
}

impl Default for RewardConfig {
    fn default() -> Self {
        RewardConfig {
            max_consumption_rate: 120_000,
            min_consumption_rate: 100_000,
            minting_period: 365 * DAY,
            supply_cap: 720_000_000 * UNITS,
            rewards_enabled_from: 0,
        }
    }
}

impl Default for StakingConfig {
    #[cfg(not(feature = "debug_env"))]
    fn default() -> Self {
        StakingConfig {
            min_validator_stake: 2_000 * UNITS,
            max_validator_stake: 3_000_000 * UNITS,
            min_delegator_stake: 25 * UNITS,
            min_delegation_fee: 20_000,
            min_stake_duration: 14 * DAY,
            max_stake_duration: 365 * DAY,
            max_validator_weight_factor: 5,
            max_future_start_time: 14 * DAY,
            sync_bound: 10,
            tx_fee: UNITS / 1_000,
            add_primary_network_validator_fee: 0,
            add_subnet_validator_fee: UNITS / 1_000,
            add_delegator_fee: 0,
            create_subnet_fee: UNITS,
            validator_set_cache_size: 64,
            max_block_txs: 256,
            mempool_size: 4096,
            reward: RewardConfig::default(),
        }
    }

    #[cfg(feature = "debug_env")]
    fn default() -> Self {
        StakingConfig {
            min_validator_stake: UNITS,
            max_validator_stake: 3_000_000 * UNITS,
            min_delegator_stake: UNITS,
            min_delegation_fee: 0,
            min_stake_duration: 1,
            max_stake_duration: 365 * DAY,
            max_validator_weight_factor: 5,
            max_future_start_time: 365 * DAY,
            sync_bound: 10,
            tx_fee: 0,
            add_primary_network_validator_fee: 0,
            add_subnet_validator_fee: 0,
            add_delegator_fee: 0,
            create_subnet_fee: 0,
            validator_set_cache_size: 64,
            max_block_txs: 256,
            mempool_size: 4096,
            reward: RewardConfig {
                minting_period: DAY,
                ..RewardConfig::default()
            },
        }
    }
}

impl StakingConfig {
    /// Load the configuration from `file_path`, writing the defaults there
    /// first when the file does not exist yet.
    pub fn from_file(file_path: &str) -> Result<StakingConfig> {
        let io_err = |source| ConfigError::Io {
            path: file_path.to_owned(),
            source,
        };

        let content = match fs::read_to_string(file_path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                let config = StakingConfig::default();
                let content = toml::to_string(&config).map_err(|e| {
                    ConfigError::Parse {
                        path: file_path.to_owned(),
                        msg: e.to_string(),
                    }
                })?;
                File::create(file_path)
                    .and_then(|mut f| f.write_all(content.as_bytes()))
                    .map_err(io_err)?;
                info!("wrote default staking config to {}", file_path);
                return Ok(config);
            }
            Err(error) => return Err(io_err(error)),
        };

        let config: StakingConfig = toml::from_str(content.as_str())
            .map_err(|e| e.to_string())
            .or_else(|toml_err| {
                serde_json::from_str(content.as_str())
                    .map_err(|json_err| format!("{toml_err}; {json_err}"))
            })
            .map_err(|msg| ConfigError::Parse {
                path: file_path.to_owned(),
                msg,
            })?;
        config.check()?;
        Ok(config)
    }

    /// Reject self-contradicting bounds.
    pub fn check(&self) -> Result<()> {
        if self.min_validator_stake > self.max_validator_stake {
            return Err(ConfigError::Invalid(
                "min_validator_stake exceeds max_validator_stake".to_owned(),
            ));
        }
        if self.min_stake_duration == 0
            || self.min_stake_duration > self.max_stake_duration
        {
            return Err(ConfigError::Invalid(
                "stake duration bounds are empty".to_owned(),
            ));
        }
        if self.max_validator_weight_factor == 0 {
            return Err(ConfigError::Invalid(
                "max_validator_weight_factor must be positive".to_owned(),
            ));
        }
        if self.min_delegation_fee as u64 > PERCENT_DENOMINATOR {
            return Err(ConfigError::Invalid(
                "min_delegation_fee above 100%".to_owned(),
            ));
        }
        let r = &self.reward;
        if r.min_consumption_rate > r.max_consumption_rate
            || r.max_consumption_rate > PERCENT_DENOMINATOR
            || r.minting_period == 0
        {
            return Err(ConfigError::Invalid("bad reward schedule".to_owned()));
        }
        Ok(())
    }
}

/// Process-wide configuration.
pub mod global_cfg {
    use {super::StakingConfig, lazy_static::lazy_static, std::env};

    lazy_static! {
        /// Global staking config, read from `PCHAIN_CONFIG_PATH` when set.
        pub static ref CFG: StakingConfig = get_config();
    }

    fn get_config() -> StakingConfig {
        match env::var("PCHAIN_CONFIG_PATH") {
            Ok(path) => match StakingConfig::from_file(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::error!("{}, falling back to defaults", e);
                    StakingConfig::default()
                }
            },
            Err(_) => StakingConfig::default(),
        }
    }
}
