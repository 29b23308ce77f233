// JSON-RPC methods
pub const ETH_SUBSCRIBE: &str = "eth_subscribe";
pub const ETH_GET_TRANSACTION_BY_HASH: &str = "eth_getTransactionByHash";
pub const ETH_GET_RAW_TRANSACTION_BY_HASH: &str = "eth_getRawTransactionByHash";
pub const ETH_SEND_BUNDLE: &str = "eth_sendBundle";
pub const FLASHBOTS_GET_BUNDLE_STATS: &str = "flashbots_getBundleStatsV2";

/// Alchemy 의 필터링된 펜딩 트랜잭션 구독 이름
pub const DEFAULT_PENDING_SUBSCRIPTION: &str = "alchemy_pendingTransactions";

pub const FLASHBOTS_SIGNATURE_HEADER: &str = "X-Flashbots-Signature";

// Relay endpoints
pub const FLASHBOTS_MAINNET_RELAY: &str = "https://relay.flashbots.net";
pub const FLASHBOTS_SEPOLIA_RELAY: &str = "https://relay-sepolia.flashbots.net";

// Race defaults
pub const DEFAULT_LOOKAHEAD_BLOCKS: u64 = 1;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_GRACE_WINDOW_BLOCKS: u64 = 2;

/// 연속 폴링 실패 허용 횟수 (초과 시 Failed)
pub const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 5;

// Network timeouts (milliseconds)
pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STATS_TIMEOUT_MS: u64 = 3_000;

// Reconnect backoff (milliseconds)
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
/// 중복 제거용으로 기억하는 해시 수
pub const DEFAULT_SEEN_CAPACITY: usize = 4_096;

/// 함수 셀렉터 길이 (calldata 앞 4바이트)
pub const SELECTOR_LEN: usize = 4;

// Transaction envelope types
pub const LEGACY_TX_TYPE: u64 = 0;
pub const ACCESS_LIST_TX_TYPE: u64 = 1;
pub const DYNAMIC_FEE_TX_TYPE: u64 = 2;

pub const GWEI: u64 = 1_000_000_000;
