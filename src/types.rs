use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::{transaction::eip2930::AccessList, Address, Bytes, H256, U256, U64};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::constants::SELECTOR_LEN;

/// 노드가 돌려준 펜딩 트랜잭션 스냅샷
///
/// `eth_getTransactionByHash` 응답을 그대로 역직렬화한다. 노드마다 빠지는 필드가
/// 있으므로 서명/가스/논스 필드는 모두 `Option` 이고, 누락 여부는
/// 재구성 단계에서 판단한다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTxRecord {
    pub hash: H256,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, alias = "data")]
    pub input: Option<Bytes>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub nonce: Option<U256>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, rename = "type")]
    pub transaction_type: Option<U64>,
    #[serde(default)]
    pub chain_id: Option<U256>,
    #[serde(default)]
    pub access_list: Option<AccessList>,
    #[serde(default)]
    pub v: Option<U64>,
    #[serde(default)]
    pub r: Option<U256>,
    #[serde(default)]
    pub s: Option<U256>,

    // 블록 위치 메타데이터 (채굴 전에는 null)
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_index: Option<U64>,

    /// 노드가 raw 바이트를 직접 제공한 경우
    #[serde(skip)]
    pub raw: Option<Bytes>,
}

/// 블록 포함 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_hash: H256,
    pub block_number: u64,
    pub transaction_index: u64,
}

impl PendingTxRecord {
    /// calldata 의 함수 셀렉터 (앞 4바이트)
    pub fn selector(&self) -> Option<[u8; SELECTOR_LEN]> {
        let input = self.input.as_ref()?;
        if input.len() < SELECTOR_LEN {
            return None;
        }
        let mut selector = [0u8; SELECTOR_LEN];
        selector.copy_from_slice(&input[..SELECTOR_LEN]);
        Some(selector)
    }

    pub fn block_meta(&self) -> Option<BlockMeta> {
        Some(BlockMeta {
            block_hash: self.block_hash?,
            block_number: self.block_number?.as_u64(),
            transaction_index: self.transaction_index?.as_u64(),
        })
    }

    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some()
    }
}

/// 서명까지 끝난 정규 직렬화 트랜잭션 바이트
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawTransaction(Bytes);

impl RawTransaction {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(value: &str) -> Result<Self, RacerError> {
        let bytes = hex::decode(value.trim().trim_start_matches("0x"))
            .map_err(|e| RacerError::Encoding(format!("invalid raw transaction hex: {}", e)))?;
        if bytes.is_empty() {
            return Err(RacerError::Encoding("raw transaction is empty".to_string()));
        }
        Ok(Self(bytes.into()))
    }

    /// 트랜잭션 해시 = keccak256(raw)
    pub fn hash(&self) -> H256 {
        H256::from(keccak256(self.0.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for RawTransaction {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// 어떤 펜딩 트랜잭션을 트리거로 볼지 정의하는 규칙
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRule {
    pub from: Address,
    pub to: Address,
    pub function_selector: [u8; SELECTOR_LEN],
}

/// 번들 구성 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleMode {
    /// [오너 트랜잭션, 팔로워 트랜잭션]
    #[default]
    Paired,
    /// [팔로워 트랜잭션]
    FollowerOnly,
}

/// 번들 제출 1회의 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSubmissionResult {
    pub bundle_hash: H256,
    pub target_block: u64,
    pub submitted_at: DateTime<Utc>,
}

/// 릴레이가 보고하는 번들 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleStatus {
    /// 아직 아무 정보 없음
    Pending,
    /// 시뮬레이션 통과, 빌더에게 전달됨
    Simulated,
    /// 타겟 블록에 포함됨
    Included,
    /// 릴레이 시뮬레이션 실패
    SimulationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleStats {
    pub bundle_hash: H256,
    pub target_block: u64,
    pub status: BundleStatus,
    pub is_simulated: bool,
    pub is_high_priority: bool,
    pub considered_by_builders: usize,
    pub sealed_by_builders: usize,
}

impl BundleStats {
    pub fn pending(bundle_hash: H256, target_block: u64) -> Self {
        Self {
            bundle_hash,
            target_block,
            status: BundleStatus::Pending,
            is_simulated: false,
            is_high_priority: false,
            considered_by_builders: 0,
            sealed_by_builders: 0,
        }
    }

    pub fn is_included(&self) -> bool {
        self.status == BundleStatus::Included
    }
}

/// 레이스 상태 머신
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaceState {
    Idle,
    Watching,
    Matched,
    Reconstructing,
    Submitting,
    Polling,
    Included,
    Expired,
    Failed,
}

impl RaceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceState::Included | RaceState::Expired | RaceState::Failed)
    }
}

impl fmt::Display for RaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaceState::Idle => "Idle",
            RaceState::Watching => "Watching",
            RaceState::Matched => "Matched",
            RaceState::Reconstructing => "Reconstructing",
            RaceState::Submitting => "Submitting",
            RaceState::Polling => "Polling",
            RaceState::Included => "Included",
            RaceState::Expired => "Expired",
            RaceState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// 레이스 종료 이벤트 - 호출자에게 보이는 유일한 결과
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub race: String,
    pub state: RaceState,
    pub bundle_hash: Option<H256>,
    pub target_block: Option<u64>,
    pub error: Option<String>,
    pub submissions: Vec<BundleSubmissionResult>,
    pub history: Vec<RaceState>,
    pub skipped_records: u32,
}

/// Error types
#[derive(thiserror::Error, Debug)]
pub enum RacerError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("incomplete pending transaction {hash:?}: missing {field}")]
    IncompleteRecord { hash: H256, field: &'static str },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("bundle contains no transactions")]
    EmptyBundle,

    #[error("relay rejected bundle: {0}")]
    RelayRejected(String),

    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("race exhausted after {attempts} submission attempts")]
    RaceExhausted {
        attempts: u32,
        #[source]
        last: Box<RacerError>,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("race cancelled")]
    Cancelled,
}

impl RacerError {
    /// 재시도(재연결/재제출) 대상 여부
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RacerError::TransientTransport(_) | RacerError::RelayUnavailable(_) | RacerError::Timeout(_)
        )
    }

    /// 재구성 실패 - 해당 매치만 건너뛰고 감시를 계속한다
    pub fn is_skippable_record(&self) -> bool {
        matches!(self, RacerError::IncompleteRecord { .. } | RacerError::Encoding(_))
    }

    /// `source()` 체인을 ": " 로 이어 붙인 문자열
    pub fn cause_chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}

/// Result type alias
pub type RacerResult<T> = Result<T, RacerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_input(input: Option<Vec<u8>>) -> PendingTxRecord {
        PendingTxRecord {
            hash: H256::zero(),
            from: Address::zero(),
            to: None,
            input: input.map(Bytes::from),
            value: None,
            nonce: None,
            gas: None,
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            transaction_type: None,
            chain_id: None,
            access_list: None,
            v: None,
            r: None,
            s: None,
            block_hash: None,
            block_number: None,
            transaction_index: None,
            raw: None,
        }
    }

    #[test]
    fn test_selector_extraction() {
        let record = record_with_input(Some(vec![0xa8, 0xea, 0xc4, 0x92, 0x01]));
        assert_eq!(record.selector(), Some([0xa8, 0xea, 0xc4, 0x92]));

        assert_eq!(record_with_input(Some(vec![0x01, 0x02])).selector(), None);
        assert_eq!(record_with_input(None).selector(), None);
    }

    #[test]
    fn test_pending_record_deserialization() {
        let json = serde_json::json!({
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "from": "0xe9d2e42129c04f5627f7894aabd422b8a76737ad",
            "to": "0xa4010fa5a816747f9eba1a60271280beaae28f10",
            "input": "0xa8eac492",
            "value": "0x0",
            "nonce": "0x7",
            "gas": "0x5208",
            "maxFeePerGas": "0x174876e800",
            "maxPriorityFeePerGas": "0x77359400",
            "gasPrice": "0x3b9aca00",
            "type": "0x2",
            "chainId": "0xaa36a7",
            "accessList": [],
            "v": "0x1",
            "yParity": "0x1",
            "r": "0x2",
            "s": "0x3",
            "blockHash": null,
            "blockNumber": null,
            "transactionIndex": null
        });

        let record: PendingTxRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.nonce, Some(U256::from(7)));
        assert_eq!(record.transaction_type, Some(U64::from(2)));
        assert_eq!(record.chain_id, Some(U256::from(11_155_111u64)));
        assert!(record.block_meta().is_none());
        assert!(!record.is_mined());
        assert!(record.raw.is_none());
    }

    #[test]
    fn test_raw_transaction_hex() {
        let raw = RawTransaction::from_hex("0x02f86b").unwrap();
        assert_eq!(raw.as_bytes(), &[0x02, 0xf8, 0x6b]);
        assert_eq!(raw.to_hex(), "0x02f86b");
        assert_eq!(raw.hash(), H256::from(keccak256([0x02, 0xf8, 0x6b])));

        assert!(RawTransaction::from_hex("0x").is_err());
        assert!(RawTransaction::from_hex("zz").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(RacerError::RelayUnavailable("down".into()).is_transient());
        assert!(RacerError::Timeout("lookup".into()).is_transient());
        assert!(!RacerError::RelayRejected("bad".into()).is_transient());
        assert!(!RacerError::EmptyBundle.is_transient());

        assert!(RacerError::Encoding("mixed fees".into()).is_skippable_record());
        assert!(RacerError::IncompleteRecord { hash: H256::zero(), field: "r" }.is_skippable_record());
    }

    #[test]
    fn test_cause_chain_includes_source() {
        let err = RacerError::RaceExhausted {
            attempts: 3,
            last: Box::new(RacerError::RelayUnavailable("connection refused".into())),
        };
        let chain = err.cause_chain();
        assert!(chain.starts_with("race exhausted after 3 submission attempts"));
        assert!(chain.ends_with("relay unavailable: connection refused"));
    }
}
