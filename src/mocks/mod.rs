pub mod flashbots_mock;
pub mod mempool_mock;

pub use flashbots_mock::MockRelayClient;
pub use mempool_mock::{MockEvent, MockTransport};

use std::env;
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, U256};
use tracing::info;

use crate::constants::GWEI;
use crate::types::{RacerResult, TriggerRule};

/// Check if mock mode is enabled
pub fn is_mock_mode() -> bool {
    env::var("API_MODE").unwrap_or_default() == "mock"
}

/// Get mock configuration values
pub fn get_mock_config() -> MockConfig {
    MockConfig {
        chain_id: env::var("MOCK_CHAIN_ID")
            .unwrap_or_else(|_| "1337".to_string())
            .parse()
            .unwrap_or(1337),
        start_block: env::var("MOCK_START_BLOCK")
            .unwrap_or_else(|_| "18000000".to_string())
            .parse()
            .unwrap_or(18_000_000),
        block_time_ms: env::var("MOCK_BLOCK_TIME_MS")
            .unwrap_or_else(|_| "12000".to_string())
            .parse()
            .unwrap_or(12_000),
        network_latency: env::var("MOCK_NETWORK_LATENCY")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .unwrap_or(50),
        include_after_polls: env::var("MOCK_INCLUDE_AFTER_POLLS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3),
    }
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub chain_id: u64,
    pub start_block: u64,
    pub block_time_ms: u64,
    pub network_latency: u64,
    pub include_after_polls: u32,
}

/// 모의 실행 환경: 트리거 트랜잭션 하나가 예약된 노드와 n 번째 조회에 포함을 보고하는 릴레이
///
/// 트리거보다 먼저 셀렉터가 다른 트랜잭션을 하나 흘려 필터 경로도 거치게 한다.
pub async fn mock_race_environment(
    rule: &TriggerRule,
    mock_config: &MockConfig,
) -> RacerResult<(Arc<MockTransport>, Arc<MockRelayClient>)> {
    let owner = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(mock_config.chain_id);
    let latency = Duration::from_millis(mock_config.network_latency);

    let owner_call = |nonce: u64, selector: [u8; 4]| -> Eip1559TransactionRequest {
        Eip1559TransactionRequest::new()
            .to(rule.to)
            .nonce(nonce)
            .gas(100_000u64)
            .max_fee_per_gas(U256::from(50 * GWEI))
            .max_priority_fee_per_gas(U256::from(2 * GWEI))
            .value(U256::zero())
            .data(selector.to_vec())
            .chain_id(mock_config.chain_id)
    };

    let (mut decoy, _) = mempool_mock::signed_record(&owner, &TypedTransaction::Eip1559(owner_call(0, [0xde, 0xad, 0xbe, 0xef])))?;
    let (mut trigger, _) = mempool_mock::signed_record(&owner, &TypedTransaction::Eip1559(owner_call(1, rule.function_selector)))?;
    // 발신자는 서명 페이로드에 포함되지 않으므로 규칙의 주소로 바꿔도 해시는 그대로다
    decoy.from = rule.from;
    trigger.from = rule.from;

    let transport = MockTransport::new(mock_config.start_block)
        .with_latency(latency)
        .with_session(vec![MockEvent::Hash(decoy.hash), MockEvent::Hash(trigger.hash)]);
    transport.insert_record(decoy).await;
    transport.insert_record(trigger.clone()).await;

    let relay = MockRelayClient::new()
        .with_latency(latency)
        .include_after_polls(mock_config.include_after_polls);

    info!("🎭 [MOCK] 모의 레이스 환경 준비: trigger={:?}", trigger.hash);
    Ok((Arc::new(transport), Arc::new(relay)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::reconstructor::RawTransactionReconstructor;
    use crate::mempool::filters::selector_from_signature;
    use crate::mempool::watcher::PendingTxTransport;
    use ethers::types::Address;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_environment_serves_signed_trigger() {
        let rule = TriggerRule::new(
            Address::from_low_u64_be(0xaa),
            Address::from_low_u64_be(0xbb),
            selector_from_signature("enablePresale()"),
        );
        let mock_config = MockConfig {
            chain_id: 1337,
            start_block: 500,
            block_time_ms: 0,
            network_latency: 0,
            include_after_polls: 1,
        };

        let (transport, _relay) = mock_race_environment(&rule, &mock_config).await.unwrap();
        let hashes: Vec<_> = transport.subscribe(rule.from, rule.to).await.unwrap().take(2).collect().await;
        assert_eq!(hashes.len(), 2);

        let decoy = transport.get_transaction(*hashes[0].as_ref().unwrap()).await.unwrap().unwrap();
        let trigger = transport.get_transaction(*hashes[1].as_ref().unwrap()).await.unwrap().unwrap();
        assert!(rule.matches_route(&decoy));
        assert!(!rule.matches_selector(&decoy));
        assert!(rule.matches(&trigger));

        // 발신자를 바꿔도 서명된 바이트의 해시는 광고된 해시와 같다
        let raw = RawTransactionReconstructor::new().reconstruct(&trigger).unwrap();
        assert_eq!(raw.hash(), trigger.hash);
        assert_eq!(transport.current_block(), 500);
    }
}
