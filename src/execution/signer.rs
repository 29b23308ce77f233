use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};
use tracing::{debug, info};

use crate::config::FollowerConfig;
use crate::constants::GWEI;
use crate::types::{RacerError, RacerResult, RawTransaction};

/// 트랜잭션 서명자
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    /// 트랜잭션에 서명하고 정규 직렬화 바이트를 돌려준다
    async fn sign_transaction(&self, tx: &TypedTransaction) -> RacerResult<RawTransaction>;
}

/// 로컬 개인키 기반 서명자
#[derive(Debug, Clone)]
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn from_private_key(private_key: &str, chain_id: u64) -> RacerResult<Self> {
        let wallet = private_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RacerError::Signer(format!("invalid private key: {}", e)))?
            .with_chain_id(chain_id);
        Ok(Self { wallet })
    }

    pub fn chain_id(&self) -> u64 {
        self.wallet.chain_id()
    }
}

#[async_trait]
impl TransactionSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> RacerResult<RawTransaction> {
        let mut tx = tx.clone();
        if tx.chain_id().is_none() {
            tx.set_chain_id(self.wallet.chain_id());
        }

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RacerError::Signer(e.to_string()))?;

        Ok(RawTransaction::new(tx.rlp_signed(&signature)))
    }
}

/// 팔로워(구매) 트랜잭션 설계도
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerPlan {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub chain_id: u64,
}

impl FollowerPlan {
    pub fn from_config(config: &FollowerConfig, chain_id: u64) -> RacerResult<Self> {
        let to = config
            .to
            .ok_or_else(|| RacerError::Config("follower.to is required without raw_transaction".to_string()))?;

        let data = match config.data.as_deref() {
            Some(hex_data) => hex::decode(hex_data.trim().trim_start_matches("0x"))
                .map_err(|e| RacerError::Config(format!("invalid follower calldata: {}", e)))?
                .into(),
            None => Bytes::default(),
        };

        let value = match config.value_wei.as_deref() {
            Some(value) => U256::from_dec_str(value.trim())
                .map_err(|e| RacerError::Config(format!("invalid follower value {}: {}", value, e)))?,
            None => U256::zero(),
        };

        Ok(Self {
            to,
            data,
            value,
            gas_limit: U256::from(config.gas_limit),
            max_fee_per_gas: U256::from(config.max_fee_per_gas_gwei) * U256::from(GWEI),
            max_priority_fee_per_gas: U256::from(config.max_priority_fee_per_gas_gwei) * U256::from(GWEI),
            chain_id,
        })
    }

    /// 주어진 논스로 EIP-1559 트랜잭션 구성
    pub fn to_transaction(&self, nonce: U256) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .to(self.to)
            .nonce(nonce)
            .gas(self.gas_limit)
            .max_fee_per_gas(self.max_fee_per_gas)
            .max_priority_fee_per_gas(self.max_priority_fee_per_gas)
            .value(self.value)
            .data(self.data.clone())
            .chain_id(self.chain_id)
            .into()
    }
}

/// 팔로워 트랜잭션 준비 - 사전 서명된 raw 가 있으면 그대로 쓰고, 없으면 서명한다
pub async fn prepare_follower_transaction(
    config: &FollowerConfig,
    signer: Option<&dyn TransactionSigner>,
    nonce: Option<U256>,
    chain_id: u64,
) -> RacerResult<RawTransaction> {
    if let Some(raw) = config.raw_transaction.as_deref() {
        let raw = RawTransaction::from_hex(raw)?;
        info!("📝 사전 서명된 팔로워 트랜잭션 사용: {:?}", raw.hash());
        return Ok(raw);
    }

    let signer = signer.ok_or_else(|| RacerError::Signer("follower signer is not configured".to_string()))?;
    let nonce = nonce.ok_or_else(|| RacerError::Signer("follower nonce is unknown".to_string()))?;
    let plan = FollowerPlan::from_config(config, chain_id)?;

    let raw = signer.sign_transaction(&plan.to_transaction(nonce)).await?;
    debug!("팔로워 트랜잭션 논스 {} 로 서명", nonce);
    info!("✍️ 팔로워 트랜잭션 서명 완료: {:?} (from {:?})", raw.hash(), signer.address());
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::reconstructor::RawTransactionReconstructor;
    use crate::mocks::mempool_mock::signed_record;

    const KEY: &str = "0x4c0883a69102937d6231471b5decb208e5c3c4a3d9d5c0d0e6f6f2f3b2a1c0d1";

    fn follower_config() -> FollowerConfig {
        FollowerConfig {
            raw_transaction: None,
            private_key: None,
            to: Some("0xa4010fa5a816747f9eba1a60271280beaae28f10".parse().unwrap()),
            data: Some("0xefef39a10000000000000000000000000000000000000000000000000000000000000001".to_string()),
            value_wei: Some("10000000000000000".to_string()),
            gas_limit: 200_000,
            max_fee_per_gas_gwei: 100,
            max_priority_fee_per_gas_gwei: 2,
        }
    }

    #[test]
    fn test_plan_from_config() {
        let plan = FollowerPlan::from_config(&follower_config(), 1).unwrap();
        assert_eq!(plan.value, U256::from(10_000_000_000_000_000u64));
        assert_eq!(plan.max_fee_per_gas, U256::from(100u64 * GWEI));
        assert_eq!(plan.data.len(), 36);

        let mut missing_to = follower_config();
        missing_to.to = None;
        assert!(matches!(FollowerPlan::from_config(&missing_to, 1), Err(RacerError::Config(_))));

        let mut bad_value = follower_config();
        bad_value.value_wei = Some("0.01".to_string());
        assert!(FollowerPlan::from_config(&bad_value, 1).is_err());
    }

    #[tokio::test]
    async fn test_signed_follower_reconstructs_to_same_hash() {
        let signer = WalletSigner::from_private_key(KEY, 11_155_111).unwrap();
        let raw = prepare_follower_transaction(&follower_config(), Some(&signer), Some(U256::from(4u64)), 11_155_111)
            .await
            .unwrap();
        assert_eq!(raw.as_bytes()[0], 0x02);

        // 같은 트랜잭션을 노드 레코드 형태로 만든 뒤 재구성해도 동일해야 한다
        let plan = FollowerPlan::from_config(&follower_config(), 11_155_111).unwrap();
        let (record, expected) = signed_record(&signer.wallet, &plan.to_transaction(U256::from(4u64))).unwrap();
        assert_eq!(raw, expected);
        assert_eq!(RawTransactionReconstructor::new().reconstruct(&record).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_presigned_raw_is_used_verbatim() {
        let mut config = follower_config();
        config.raw_transaction = Some("0x02f8b1".to_string());

        let raw = prepare_follower_transaction(&config, None, None, 1).await.unwrap();
        assert_eq!(raw.to_hex(), "0x02f8b1");
    }

    #[tokio::test]
    async fn test_missing_signer_is_an_error() {
        let err = prepare_follower_transaction(&follower_config(), None, Some(U256::zero()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RacerError::Signer(_)));
    }

    #[test]
    fn test_invalid_private_key() {
        assert!(matches!(WalletSigner::from_private_key("0x1234", 1), Err(RacerError::Signer(_))));
    }
}
