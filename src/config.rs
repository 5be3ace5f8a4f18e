use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accrual::{AccrualRate, IncomeProgram, DEFAULT_SECONDS_PER_TOKEN};
use crate::amount::TokenAmount;
use crate::gateway::{Address, RetryPolicy, DEFAULT_RETRY_COUNT};
use crate::sync::SessionSettings;

const DEFAULT_ENDPOINTS: [&str; 3] = [
    "https://worldchain-mainnet.g.alchemy.com/public",
    "https://worldchain-mainnet.gateway.tenderly.co",
    "https://480.rpc.thirdweb.com",
];
const DEFAULT_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
const DEFAULT_LOG_POLL_INTERVAL_MS: u64 = 4_000;
const MIN_LOG_POLL_INTERVAL_MS: u64 = 500;

const DEFAULT_BASIC_INCOME: Address = Address::new([
    0x02, 0xc3, 0xb9, 0x9d, 0x98, 0x6e, 0xf1, 0x61, 0x2b, 0xac, 0x63, 0xd4, 0x00, 0x4f, 0xa7, 0x97,
    0x14, 0xd0, 0x00, 0x12,
]);
const DEFAULT_BASIC_INCOME_PLUS: Address = Address::new([
    0x52, 0xdf, 0xee, 0x61, 0x18, 0x0a, 0x0b, 0xce, 0xbe, 0x00, 0x7e, 0x5a, 0x9c, 0xfd, 0x46, 0x69,
    0x48, 0xac, 0xca, 0x46,
]);
const DEFAULT_TOKEN: Address = Address::new([
    0xed, 0xe5, 0x4d, 0x9c, 0x02, 0x4e, 0xe8, 0x0c, 0x85, 0xec, 0x0a, 0x75, 0xed, 0x2d, 0x87, 0x74,
    0xc7, 0xfb, 0xac, 0x9b,
]);
const DEFAULT_REFERRAL: Address = Address::new([
    0x37, 0x2d, 0xca, 0x05, 0x76, 0x82, 0x99, 0x45, 0x68, 0xbe, 0x07, 0x4e, 0x75, 0xa0, 0x3c, 0xed,
    0x3d, 0xd9, 0xe6, 0x0d,
]);

const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const MIN_TICK_INTERVAL_MS: u64 = 50;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 60_000;
const MIN_RECONCILE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_READ_RETRY_DELAY_MS: u64 = 1_000;
const MIN_READ_RETRY_DELAY_MS: u64 = 10;

const DEFAULT_MIRROR_PATH: &str = "./data/income-wallet/mirror.json";

const DEFAULT_CONFIRMATION_POLL_INTERVAL_MS: u64 = 2_000;
const MIN_CONFIRMATION_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("unable to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unable to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Top-level configuration for an income wallet process.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalletConfig {
    pub gateway: GatewayConfig,
    pub contracts: ContractsConfig,
    pub accrual: AccrualConfig,
    pub storage: StorageConfig,
    pub host: HostConfig,
}

impl WalletConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: WalletConfig = toml::from_str(&content)?;
        Ok(config.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn sanitized(self) -> Self {
        Self {
            gateway: self.gateway.sanitized(),
            contracts: self.contracts,
            accrual: self.accrual.sanitized(),
            storage: self.storage,
            host: self.host.sanitized(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            contracts: self.contracts,
            rate: AccrualRate::new(self.accrual.seconds_per_token),
            tolerance: TokenAmount::from_wei(u128::from(self.accrual.tolerance_wei)),
            tick_interval: Duration::from_millis(self.accrual.tick_interval_ms),
            reconcile_interval: Duration::from_millis(self.accrual.reconcile_interval_ms),
            read_retry_delay: Duration::from_millis(self.accrual.read_retry_delay_ms),
            namespace_by_address: self.storage.namespace_by_address,
            confirmation_poll_interval: Duration::from_millis(
                self.host.confirmation_poll_interval_ms,
            ),
            confirmation_timeout: Duration::from_millis(self.host.confirmation_timeout_ms),
        }
    }
}

/// Chain endpoints and the fallback policy applied across them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// JSON-RPC endpoints in preference order.
    pub endpoints: Vec<String>,
    /// Retries per endpoint before falling back to the next one.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// How often log watchers poll for new blocks.
    pub log_poll_interval_ms: u64,
}

impl GatewayConfig {
    pub fn sanitized(mut self) -> Self {
        self.endpoints.retain(|endpoint| !endpoint.trim().is_empty());
        if self.endpoints.is_empty() {
            self.endpoints = default_endpoints();
        }
        if self.request_timeout_ms < MIN_REQUEST_TIMEOUT_MS {
            self.request_timeout_ms = MIN_REQUEST_TIMEOUT_MS;
        }
        if self.log_poll_interval_ms < MIN_LOG_POLL_INTERVAL_MS {
            self.log_poll_interval_ms = MIN_LOG_POLL_INTERVAL_MS;
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }
}

fn default_endpoints() -> Vec<String> {
    DEFAULT_ENDPOINTS.iter().map(|url| url.to_string()).collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            log_poll_interval_ms: DEFAULT_LOG_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContractsConfig {
    pub basic_income: Address,
    pub basic_income_plus: Address,
    /// Governance token whose balance is mirrored.
    pub token: Address,
    pub referral: Address,
}

impl ContractsConfig {
    pub fn income_program(&self, program: IncomeProgram) -> Address {
        match program {
            IncomeProgram::Basic => self.basic_income,
            IncomeProgram::Plus => self.basic_income_plus,
        }
    }
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            basic_income: DEFAULT_BASIC_INCOME,
            basic_income_plus: DEFAULT_BASIC_INCOME_PLUS,
            token: DEFAULT_TOKEN,
            referral: DEFAULT_REFERRAL,
        }
    }
}

/// Local projection timing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccrualConfig {
    /// Seconds needed to accrue one whole token.
    pub seconds_per_token: u64,
    /// Display refresh period.
    pub tick_interval_ms: u64,
    /// Period of the background authoritative read.
    pub reconcile_interval_ms: u64,
    /// Fixed delay between attempts of a failed read.
    pub read_retry_delay_ms: u64,
    /// Largest divergence, in wei, treated as agreement.
    pub tolerance_wei: u64,
}

impl AccrualConfig {
    pub fn sanitized(mut self) -> Self {
        if self.seconds_per_token == 0 {
            self.seconds_per_token = DEFAULT_SECONDS_PER_TOKEN;
        }
        if self.tick_interval_ms < MIN_TICK_INTERVAL_MS {
            self.tick_interval_ms = MIN_TICK_INTERVAL_MS;
        }
        if self.reconcile_interval_ms < MIN_RECONCILE_INTERVAL_MS {
            self.reconcile_interval_ms = MIN_RECONCILE_INTERVAL_MS;
        }
        if self.read_retry_delay_ms < MIN_READ_RETRY_DELAY_MS {
            self.read_retry_delay_ms = MIN_READ_RETRY_DELAY_MS;
        }
        self
    }
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            seconds_per_token: DEFAULT_SECONDS_PER_TOKEN,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            read_retry_delay_ms: DEFAULT_READ_RETRY_DELAY_MS,
            tolerance_wei: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub mirror_path: PathBuf,
    /// Prefix mirror keys with the bound address. Off by default so existing
    /// installations keep reading their feature-level keys.
    pub namespace_by_address: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mirror_path: PathBuf::from(DEFAULT_MIRROR_PATH),
            namespace_by_address: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub confirmation_poll_interval_ms: u64,
    pub confirmation_timeout_ms: u64,
}

impl HostConfig {
    pub fn sanitized(mut self) -> Self {
        if self.confirmation_poll_interval_ms < MIN_CONFIRMATION_POLL_INTERVAL_MS {
            self.confirmation_poll_interval_ms = MIN_CONFIRMATION_POLL_INTERVAL_MS;
        }
        if self.confirmation_timeout_ms < self.confirmation_poll_interval_ms {
            self.confirmation_timeout_ms = self.confirmation_poll_interval_ms;
        }
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            confirmation_poll_interval_ms: DEFAULT_CONFIRMATION_POLL_INTERVAL_MS,
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_point_at_production_contracts() {
        let config = WalletConfig::default();
        assert_eq!(config.gateway.endpoints.len(), 3);
        assert_eq!(config.gateway.retry_count, 10);
        assert_eq!(config.gateway.retry_delay_ms, 100);
        assert_eq!(
            config.contracts.basic_income,
            "0x02c3B99D986ef1612bAC63d4004fa79714D00012"
                .parse()
                .expect("address")
        );
        assert_eq!(
            config.contracts.basic_income_plus,
            "0x52dfee61180a0bcebe007e5a9cfd466948acca46"
                .parse()
                .expect("address")
        );
        assert_eq!(
            config.contracts.token,
            "0xEdE54d9c024ee80C85ec0a75eD2d8774c7Fbac9B"
                .parse()
                .expect("address")
        );
        assert_eq!(
            config.contracts.referral,
            "0x372dCA057682994568be074E75a03Ced3dD9E60d"
                .parse()
                .expect("address")
        );
        assert_eq!(config.accrual.seconds_per_token, 8_640);
        assert_eq!(config.accrual.tick_interval_ms, 1_000);
        assert_eq!(config.accrual.read_retry_delay_ms, 1_000);
        assert_eq!(config.accrual.tolerance_wei, 0);
        assert!(!config.storage.namespace_by_address);
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/wallet.toml");
        let mut config = WalletConfig::default();
        config.gateway.endpoints = vec!["http://127.0.0.1:8545".into()];
        config.storage.namespace_by_address = true;
        config.accrual.tolerance_wei = 1_000;
        config.save(&path).expect("save");

        let loaded = WalletConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: WalletConfig = toml::from_str(
            r#"
            [accrual]
            seconds_per_token = 100

            [contracts]
            token = "0x00000000000000000000000000000000000000aa"
            "#,
        )
        .expect("parse");
        assert_eq!(config.accrual.seconds_per_token, 100);
        assert_eq!(config.accrual.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.contracts.basic_income, DEFAULT_BASIC_INCOME);
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn sanitization_clamps_out_of_range_values() {
        let config = WalletConfig {
            gateway: GatewayConfig {
                endpoints: vec![" ".into()],
                request_timeout_ms: 1,
                log_poll_interval_ms: 0,
                ..GatewayConfig::default()
            },
            accrual: AccrualConfig {
                seconds_per_token: 0,
                tick_interval_ms: 1,
                reconcile_interval_ms: 1,
                read_retry_delay_ms: 0,
                tolerance_wei: 5,
            },
            host: HostConfig {
                confirmation_poll_interval_ms: 0,
                confirmation_timeout_ms: 0,
            },
            ..WalletConfig::default()
        }
        .sanitized();

        assert_eq!(config.gateway.endpoints, default_endpoints());
        assert_eq!(config.gateway.request_timeout_ms, MIN_REQUEST_TIMEOUT_MS);
        assert_eq!(config.gateway.log_poll_interval_ms, MIN_LOG_POLL_INTERVAL_MS);
        assert_eq!(config.accrual.seconds_per_token, DEFAULT_SECONDS_PER_TOKEN);
        assert_eq!(config.accrual.tick_interval_ms, MIN_TICK_INTERVAL_MS);
        assert_eq!(config.accrual.reconcile_interval_ms, MIN_RECONCILE_INTERVAL_MS);
        assert_eq!(config.accrual.read_retry_delay_ms, MIN_READ_RETRY_DELAY_MS);
        assert_eq!(config.accrual.tolerance_wei, 5);
        assert_eq!(
            config.host.confirmation_poll_interval_ms,
            MIN_CONFIRMATION_POLL_INTERVAL_MS
        );
        assert_eq!(
            config.host.confirmation_timeout_ms,
            MIN_CONFIRMATION_POLL_INTERVAL_MS
        );
    }

    #[test]
    fn session_settings_follow_config() {
        let mut config = WalletConfig::default();
        config.accrual.seconds_per_token = 10;
        config.storage.namespace_by_address = true;
        let settings = config.session_settings();
        assert_eq!(settings.rate.seconds_per_token(), 10);
        assert!(settings.namespace_by_address);
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
        assert_eq!(settings.contracts, config.contracts);
    }
}
