use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::mempool::filters::{parse_selector, selector_from_signature};
use crate::types::{BundleMode, RacerError, TriggerRule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub ws_url: String,
    /// 필터링된 펜딩 트랜잭션 구독 이름 (노드 제공자별로 다름)
    #[serde(default = "default_subscription_method")]
    pub subscription_method: String,
    /// 노드가 `eth_getRawTransactionByHash` 를 지원하는지
    #[serde(default)]
    pub fetch_raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashbotsConfig {
    pub relay_url: String,
    /// 릴레이 인증 키 (비어 있으면 실행마다 임시 키 생성)
    #[serde(default)]
    pub auth_private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_ms: u64,
    #[serde(default = "default_stats_timeout_ms")]
    pub stats_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 없으면 무기한 재연결
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_lookup_retries")]
    pub lookup_retries: u32,
}

/// 팔로워 트랜잭션 - 사전 서명된 raw 또는 서명에 필요한 필드
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FollowerConfig {
    #[serde(default)]
    pub raw_transaction: Option<String>,
    /// 보통 `FOLLOWER_PRIVATE_KEY` 환경 변수로 주입
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub value_wei: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_max_fee_gwei")]
    pub max_fee_per_gas_gwei: u64,
    #[serde(default = "default_priority_fee_gwei")]
    pub max_priority_fee_per_gas_gwei: u64,
}

impl FollowerConfig {
    pub fn is_presigned(&self) -> bool {
        self.raw_transaction.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceConfig {
    pub name: String,
    pub trigger_from: Address,
    pub trigger_to: Address,
    #[serde(default)]
    pub function_selector: Option<String>,
    /// 예: `enablePresale()`
    #[serde(default)]
    pub function_signature: Option<String>,
    #[serde(default = "default_lookahead_blocks")]
    pub lookahead_blocks: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_window_blocks")]
    pub grace_window_blocks: u64,
    #[serde(default)]
    pub bundle_mode: BundleMode,
    #[serde(default)]
    pub follower: FollowerConfig,
}

impl RaceConfig {
    /// 셀렉터 또는 시그니처로부터 트리거 규칙 생성
    pub fn trigger_rule(&self) -> std::result::Result<TriggerRule, RacerError> {
        let selector = match (&self.function_selector, &self.function_signature) {
            (Some(_), Some(_)) => {
                return Err(RacerError::Config(format!(
                    "race {}: set either function_selector or function_signature, not both",
                    self.name
                )))
            }
            (Some(selector), None) => parse_selector(selector)?,
            (None, Some(signature)) => selector_from_signature(signature),
            (None, None) => {
                return Err(RacerError::Config(format!(
                    "race {}: function_selector or function_signature is required",
                    self.name
                )))
            }
        };

        Ok(TriggerRule::new(self.trigger_from, self.trigger_to, selector))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl MonitoringConfig {
    /// CLI 로 지정한 레벨이 우선, 없으면 설정 파일 값
    pub fn effective_log_level<'a>(&'a self, cli_level: Option<&'a str>) -> &'a str {
        let level = cli_level.unwrap_or(&self.log_level);
        match level {
            "trace" | "debug" | "info" | "warn" | "error" => level,
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub flashbots: FlashbotsConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub races: Vec<RaceConfig>,
}

fn default_subscription_method() -> String {
    DEFAULT_PENDING_SUBSCRIPTION.to_string()
}

fn default_subscribe_timeout_ms() -> u64 {
    DEFAULT_SUBSCRIBE_TIMEOUT_MS
}

fn default_lookup_timeout_ms() -> u64 {
    DEFAULT_LOOKUP_TIMEOUT_MS
}

fn default_submit_timeout_ms() -> u64 {
    DEFAULT_SUBMIT_TIMEOUT_MS
}

fn default_stats_timeout_ms() -> u64 {
    DEFAULT_STATS_TIMEOUT_MS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_lookup_retries() -> u32 {
    2
}

fn default_gas_limit() -> u64 {
    250_000
}

fn default_max_fee_gwei() -> u64 {
    100
}

fn default_priority_fee_gwei() -> u64 {
    3
}

fn default_lookahead_blocks() -> u64 {
    DEFAULT_LOOKAHEAD_BLOCKS
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_grace_window_blocks() -> u64 {
    DEFAULT_GRACE_WINDOW_BLOCKS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            subscribe_ms: DEFAULT_SUBSCRIBE_TIMEOUT_MS,
            lookup_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            submit_ms: DEFAULT_SUBMIT_TIMEOUT_MS,
            stats_ms: DEFAULT_STATS_TIMEOUT_MS,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_reconnect_attempts: None,
            lookup_retries: default_lookup_retries(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                name: "sepolia".to_string(),
                chain_id: 11_155_111,
                rpc_url: "https://eth-sepolia.g.alchemy.com/v2/YOUR_API_KEY".to_string(),
                ws_url: "wss://eth-sepolia.g.alchemy.com/v2/YOUR_API_KEY".to_string(),
                subscription_method: default_subscription_method(),
                fetch_raw: false,
            },
            flashbots: FlashbotsConfig {
                relay_url: FLASHBOTS_SEPOLIA_RELAY.to_string(),
                auth_private_key: String::new(),
            },
            timeouts: TimeoutConfig::default(),
            watcher: WatcherConfig::default(),
            monitoring: MonitoringConfig::default(),
            races: vec![RaceConfig {
                name: "presale".to_string(),
                trigger_from: Address::zero(),
                trigger_to: Address::zero(),
                function_selector: None,
                function_signature: Some("enablePresale()".to_string()),
                lookahead_blocks: DEFAULT_LOOKAHEAD_BLOCKS,
                retry_count: DEFAULT_RETRY_COUNT,
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
                grace_window_blocks: DEFAULT_GRACE_WINDOW_BLOCKS,
                bundle_mode: BundleMode::Paired,
                follower: FollowerConfig {
                    to: Some(Address::zero()),
                    data: Some("0x".to_string()),
                    value_wei: Some("0".to_string()),
                    gas_limit: default_gas_limit(),
                    max_fee_per_gas_gwei: default_max_fee_gwei(),
                    max_priority_fee_per_gas_gwei: default_priority_fee_gwei(),
                    ..FollowerConfig::default()
                },
            }],
        }
    }
}

impl Config {
    /// 설정 파일 + `RACER__` 접두사 환경 변수
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("RACER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read config {}", path))?;

        settings
            .try_deserialize()
            .with_context(|| format!("invalid config {}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn race(&self, name: &str) -> Option<&RaceConfig> {
        self.races.iter().find(|race| race.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            return Err(anyhow!("Network RPC URL cannot be empty"));
        }
        if self.network.ws_url.is_empty() {
            return Err(anyhow!("Network WebSocket URL cannot be empty"));
        }
        if self.flashbots.relay_url.is_empty() {
            return Err(anyhow!("Flashbots relay URL cannot be empty"));
        }
        if self.races.is_empty() {
            return Err(anyhow!("At least one race must be configured"));
        }
        if self.watcher.initial_backoff_ms == 0 || self.watcher.max_backoff_ms < self.watcher.initial_backoff_ms {
            return Err(anyhow!("Watcher backoff must be positive and max >= initial"));
        }

        let mut names = HashSet::new();
        for race in &self.races {
            if !names.insert(race.name.as_str()) {
                return Err(anyhow!("Duplicate race name: {}", race.name));
            }

            race.trigger_rule()?;

            if race.retry_count == 0 {
                return Err(anyhow!("Race {}: retry_count must be greater than 0", race.name));
            }
            if race.poll_interval_ms == 0 {
                return Err(anyhow!("Race {}: poll_interval_ms must be greater than 0", race.name));
            }
            if race.lookahead_blocks == 0 {
                return Err(anyhow!("Race {}: lookahead_blocks must be at least 1", race.name));
            }

            let follower = &race.follower;
            if !follower.is_presigned() && follower.to.is_none() {
                return Err(anyhow!(
                    "Race {}: follower needs either raw_transaction or a target address",
                    race.name
                ));
            }
            if follower.max_priority_fee_per_gas_gwei > follower.max_fee_per_gas_gwei {
                return Err(anyhow!("Race {}: priority fee cannot exceed max fee", race.name));
            }
        }

        Ok(())
    }
}
