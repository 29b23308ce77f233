use ethers::types::Address;
use ethers::utils::keccak256;

use crate::constants::SELECTOR_LEN;
use crate::types::{PendingTxRecord, RacerError, TriggerRule};

/// "0xa8eac492" 형태의 셀렉터 문자열을 파싱합니다
pub fn parse_selector(value: &str) -> Result<[u8; SELECTOR_LEN], RacerError> {
    let bytes = hex::decode(value.trim().trim_start_matches("0x"))
        .map_err(|e| RacerError::Config(format!("invalid function selector {}: {}", value, e)))?;

    if bytes.len() != SELECTOR_LEN {
        return Err(RacerError::Config(format!(
            "function selector must be {} bytes, got {}",
            SELECTOR_LEN,
            bytes.len()
        )));
    }

    let mut selector = [0u8; SELECTOR_LEN];
    selector.copy_from_slice(&bytes);
    Ok(selector)
}

/// 함수 시그니처에서 셀렉터 계산 (`enablePresale()` -> keccak256 앞 4바이트)
pub fn selector_from_signature(signature: &str) -> [u8; SELECTOR_LEN] {
    let hash = keccak256(signature.trim().as_bytes());
    let mut selector = [0u8; SELECTOR_LEN];
    selector.copy_from_slice(&hash[..SELECTOR_LEN]);
    selector
}

pub fn format_selector(selector: &[u8; SELECTOR_LEN]) -> String {
    format!("0x{}", hex::encode(selector))
}

impl TriggerRule {
    pub fn new(from: Address, to: Address, function_selector: [u8; SELECTOR_LEN]) -> Self {
        Self { from, to, function_selector }
    }

    /// 발신자/수신자 필터 (노드 측 필터가 느슨할 수 있어 한 번 더 확인)
    pub fn matches_route(&self, record: &PendingTxRecord) -> bool {
        record.from == self.from && record.to == Some(self.to)
    }

    /// calldata 앞 4바이트가 설정된 셀렉터와 같은지 확인
    pub fn matches_selector(&self, record: &PendingTxRecord) -> bool {
        record.selector() == Some(self.function_selector)
    }

    pub fn matches(&self, record: &PendingTxRecord) -> bool {
        self.matches_route(record) && self.matches_selector(record)
    }
}
