use std::ops::RangeInclusive;

use ethers::types::H256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{RacerError, RacerResult, RawTransaction};

/// Flashbots 번들 - 트랜잭션들이 주어진 순서 그대로 하나의 블록에 원자적으로 포함된다
///
/// 생성 후에는 변경할 수 없다. 다른 블록을 노릴 때는 `retarget` 으로 새 번들을 만든다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    id: Uuid,
    transactions: Vec<RawTransaction>,
    target_block: u64,
    min_timestamp: Option<u64>,
    max_timestamp: Option<u64>,
    reverting_tx_hashes: Vec<H256>,
}

/// `eth_sendBundle` 파라미터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBundleParams {
    pub txs: Vec<String>,
    pub block_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reverting_tx_hashes: Vec<H256>,
}

impl Bundle {
    /// 로그 추적용 ID (재타겟팅해도 유지)
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transactions(&self) -> &[RawTransaction] {
        &self.transactions
    }

    pub fn target_block(&self) -> u64 {
        self.target_block
    }

    pub fn min_timestamp(&self) -> Option<u64> {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Option<u64> {
        self.max_timestamp
    }

    /// 번들 트랜잭션 해시 (실행 순서대로)
    pub fn tx_hashes(&self) -> Vec<H256> {
        self.transactions.iter().map(RawTransaction::hash).collect()
    }

    /// 같은 트랜잭션으로 다른 블록을 노리는 번들
    pub fn retarget(&self, target_block: u64) -> Bundle {
        Bundle {
            target_block,
            ..self.clone()
        }
    }

    pub fn to_send_params(&self) -> SendBundleParams {
        SendBundleParams {
            txs: self.transactions.iter().map(RawTransaction::to_hex).collect(),
            block_number: format!("0x{:x}", self.target_block),
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            reverting_tx_hashes: self.reverting_tx_hashes.clone(),
        }
    }
}

/// 번들 빌더
///
/// 트랜잭션 순서를 그대로 보존하며 중복 제거나 재정렬을 하지 않는다.
#[derive(Debug, Clone, Default)]
pub struct BundleBuilder {
    min_timestamp: Option<u64>,
    max_timestamp: Option<u64>,
    reverting_tx_hashes: Vec<H256>,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_timestamp(mut self, timestamp: u64) -> Self {
        self.min_timestamp = Some(timestamp);
        self
    }

    pub fn max_timestamp(mut self, timestamp: u64) -> Self {
        self.max_timestamp = Some(timestamp);
        self
    }

    /// 리버트되어도 번들을 무효화하지 않을 트랜잭션
    pub fn allow_revert(mut self, tx_hash: H256) -> Self {
        self.reverting_tx_hashes.push(tx_hash);
        self
    }

    pub fn build(&self, transactions: Vec<RawTransaction>, target_block: u64) -> RacerResult<Bundle> {
        if transactions.is_empty() {
            return Err(RacerError::EmptyBundle);
        }

        if let (Some(min), Some(max)) = (self.min_timestamp, self.max_timestamp) {
            if min > max {
                return Err(RacerError::Config(format!(
                    "bundle min timestamp {} is after max timestamp {}",
                    min, max
                )));
            }
        }

        Ok(Bundle {
            id: Uuid::new_v4(),
            transactions,
            target_block,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            reverting_tx_hashes: self.reverting_tx_hashes.clone(),
        })
    }

    /// 연속된 블록 범위마다 같은 내용의 번들 생성
    pub fn build_range(
        &self,
        transactions: Vec<RawTransaction>,
        blocks: RangeInclusive<u64>,
    ) -> RacerResult<Vec<Bundle>> {
        if blocks.is_empty() {
            return Err(RacerError::Config(format!(
                "empty target block range {}..={}",
                blocks.start(),
                blocks.end()
            )));
        }

        let first = self.build(transactions, *blocks.start())?;
        Ok(blocks.map(|block| first.retarget(block)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(bytes: &[u8]) -> RawTransaction {
        RawTransaction::new(bytes.to_vec())
    }

    #[test]
    fn test_preserves_order() {
        let owner = tx(&[0x02, 0x01]);
        let follower = tx(&[0x02, 0x02]);

        let bundle = BundleBuilder::new()
            .build(vec![owner.clone(), follower.clone()], 101)
            .unwrap();
        assert_eq!(bundle.transactions(), &[owner.clone(), follower.clone()]);
        assert_eq!(bundle.tx_hashes(), vec![owner.hash(), follower.hash()]);

        let reversed = BundleBuilder::new()
            .build(vec![follower.clone(), owner.clone()], 101)
            .unwrap();
        assert_eq!(reversed.transactions(), &[follower, owner]);
    }

    #[test]
    fn test_keeps_duplicates() {
        let a = tx(&[0x02, 0x01]);
        let bundle = BundleBuilder::new().build(vec![a.clone(), a.clone()], 7).unwrap();
        assert_eq!(bundle.transactions().len(), 2);
    }

    #[test]
    fn test_empty_bundle_rejected() {
        assert!(matches!(BundleBuilder::new().build(vec![], 1), Err(RacerError::EmptyBundle)));
    }

    #[test]
    fn test_invalid_timestamp_window() {
        let builder = BundleBuilder::new().min_timestamp(200).max_timestamp(100);
        assert!(matches!(builder.build(vec![tx(&[1])], 1), Err(RacerError::Config(_))));
    }

    #[test]
    fn test_retarget_keeps_transactions() {
        let bundle = BundleBuilder::new().build(vec![tx(&[1]), tx(&[2])], 100).unwrap();
        let next = bundle.retarget(102);
        assert_eq!(next.target_block(), 102);
        assert_eq!(next.transactions(), bundle.transactions());
        assert_eq!(next.id(), bundle.id());
        assert_eq!(bundle.target_block(), 100);
    }

    #[test]
    fn test_build_range() {
        let bundles = BundleBuilder::new().build_range(vec![tx(&[1])], 100..=102).unwrap();
        let targets: Vec<u64> = bundles.iter().map(Bundle::target_block).collect();
        assert_eq!(targets, vec![100, 101, 102]);

        #[allow(clippy::reversed_empty_ranges)]
        let empty = BundleBuilder::new().build_range(vec![tx(&[1])], 5..=4);
        assert!(empty.is_err());
    }

    #[test]
    fn test_send_params_shape() {
        let revert_ok = H256::from_low_u64_be(9);
        let bundle = BundleBuilder::new()
            .min_timestamp(1_700_000_000)
            .allow_revert(revert_ok)
            .build(vec![tx(&[0xab, 0xcd])], 0x10)
            .unwrap();

        let value = serde_json::to_value(bundle.to_send_params()).unwrap();
        assert_eq!(value["txs"][0], "0xabcd");
        assert_eq!(value["blockNumber"], "0x10");
        assert_eq!(value["minTimestamp"], 1_700_000_000u64);
        assert!(value.get("maxTimestamp").is_none());
        assert_eq!(value["revertingTxHashes"].as_array().unwrap().len(), 1);
    }
}
