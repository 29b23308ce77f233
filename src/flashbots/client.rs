use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use ethers::utils::keccak256;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bundle::Bundle;
use crate::constants::{ETH_SEND_BUNDLE, FLASHBOTS_GET_BUNDLE_STATS, FLASHBOTS_SIGNATURE_HEADER};
use crate::types::{BundleStats, BundleStatus, BundleSubmissionResult, RacerError, RacerResult};

/// 번들 릴레이 클라이언트
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// 번들 제출. 같은 번들을 같은 블록에 다시 내면 같은 해시가 돌아온다.
    async fn submit(&self, bundle: &Bundle) -> RacerResult<BundleSubmissionResult>;

    /// 제출한 번들의 상태 조회
    async fn get_stats(&self, bundle_hash: H256, target_block: u64) -> RacerResult<BundleStats>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: [P; 1],
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBundleResponse {
    bundle_hash: H256,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleStatsParams {
    bundle_hash: H256,
    block_number: String,
}

/// `flashbots_getBundleStatsV2` 응답
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RelayBundleStats {
    is_simulated: bool,
    is_high_priority: bool,
    simulated_at: Option<String>,
    received_at: Option<String>,
    considered_by_builders_at: Vec<serde_json::Value>,
    sealed_by_builders_at: Vec<serde_json::Value>,
}

/// Flashbots 릴레이 클라이언트
///
/// 모든 요청 본문은 인증 키로 서명되어 `X-Flashbots-Signature` 헤더에 실린다.
/// 릴레이 통계는 포함 여부를 알려주지 않으므로, 포함 판정은 프로바이더로 읽은
/// 타겟 블록의 트랜잭션 순서로 한다.
pub struct FlashbotsRelayClient<M = Provider<Http>> {
    relay_url: String,
    http_client: HttpClient,
    /// 릴레이 평판용 인증 키 (트랜잭션 서명 키와 별개)
    auth_signer: LocalWallet,
    provider: Arc<M>,
    /// 제출된 번들 해시 -> 번들 트랜잭션 해시
    submitted_bundles: Mutex<HashMap<H256, Vec<H256>>>,
    request_id: AtomicU64,
}

impl<M: Middleware + 'static> FlashbotsRelayClient<M> {
    pub fn new(
        relay_url: impl Into<String>,
        auth_signer: LocalWallet,
        timeout: Duration,
        provider: Arc<M>,
    ) -> RacerResult<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RacerError::Config(format!("failed to build relay http client: {}", e)))?;

        let relay_url = relay_url.into();
        info!("🔗 Flashbots 릴레이 클라이언트 초기화: {} (auth {:?})", relay_url, auth_signer.address());

        Ok(Self {
            relay_url,
            http_client,
            auth_signer,
            provider,
            submitted_bundles: Mutex::new(HashMap::new()),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// 이 클라이언트로 제출한 번들이 타겟 블록에 순서대로 들어갔는지 확인
    async fn check_inclusion(&self, bundle_hash: H256, target_block: u64) -> RacerResult<bool> {
        let tx_hashes = self.submitted_bundles.lock().await.get(&bundle_hash).cloned();
        let Some(tx_hashes) = tx_hashes else {
            warn!("⚠️ 이 클라이언트로 제출하지 않은 번들: {:?}", bundle_hash);
            return Ok(false);
        };

        let block = self
            .provider
            .get_block(target_block)
            .await
            .map_err(|e| RacerError::TransientTransport(format!("failed to fetch block {}: {}", target_block, e)))?;

        match block {
            Some(block) if is_bundle_in_block(&tx_hashes, &block.transactions) => {
                info!("🎉 번들이 블록 {} 에 포함됨: {:?}", target_block, bundle_hash);
                Ok(true)
            }
            Some(_) => {
                debug!("블록 {} 에 번들 없음", target_block);
                Ok(false)
            }
            None => {
                debug!("블록 {} 아직 생성 전", target_block);
                Ok(false)
            }
        }
    }

    async fn call<P, R>(&self, method: &str, params: P) -> RacerResult<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: [params],
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| RacerError::Encoding(format!("failed to encode {} request: {}", method, e)))?;
        let signature = create_flashbots_signature(&self.auth_signer, &body).await?;

        let response = self
            .http_client
            .post(&self.relay_url)
            .header(CONTENT_TYPE, "application/json")
            .header(FLASHBOTS_SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RacerError::RelayUnavailable(format!("{} timed out: {}", method, e))
                } else {
                    RacerError::RelayUnavailable(format!("{} request failed: {}", method, e))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RacerError::RelayUnavailable(format!("failed to read relay response: {}", e)))?;
        debug!("릴레이 응답 {} [{}]: {}", method, status, text);

        parse_response(status, &text)
    }
}

/// 릴레이 응답 해석
///
/// JSON-RPC 에러는 거절, 5xx/429 와 본문이 깨진 응답은 일시적 불가, 나머지 4xx 는 거절.
fn parse_response<R: DeserializeOwned>(status: StatusCode, text: &str) -> RacerResult<R> {
    let parsed: JsonRpcResponse<R> = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(RacerError::RelayUnavailable(format!("HTTP {}: {}", status, text)));
            }
            if status.is_client_error() {
                return Err(RacerError::RelayRejected(format!("HTTP {}: {}", status, text)));
            }
            return Err(RacerError::RelayUnavailable(format!("malformed relay response: {}", e)));
        }
    };

    if let Some(error) = parsed.error {
        return Err(RacerError::RelayRejected(format!("{} (code {})", error.message, error.code)));
    }

    if status.is_server_error() {
        return Err(RacerError::RelayUnavailable(format!("HTTP {}", status)));
    }

    parsed
        .result
        .ok_or_else(|| RacerError::RelayUnavailable("relay response has no result".to_string()))
}

/// `X-Flashbots-Signature` 헤더 값 (`address:signature`)
///
/// 본문의 keccak256 을 0x 헥스 문자열로 만든 뒤 EIP-191 메시지로 서명한다.
pub async fn create_flashbots_signature(signer: &LocalWallet, body: &str) -> RacerResult<String> {
    let message = format!("0x{}", hex::encode(keccak256(body.as_bytes())));
    let signature = signer
        .sign_message(message)
        .await
        .map_err(|e| RacerError::Signer(format!("failed to sign relay request: {}", e)))?;

    Ok(format!("{:#x}:0x{}", signer.address(), hex::encode(signature.to_vec())))
}

/// 번들 트랜잭션들이 블록 안에 순서대로 연속해서 들어 있는지 확인
pub fn is_bundle_in_block(bundle_txs: &[H256], block_txs: &[H256]) -> bool {
    let Some(first) = bundle_txs.first() else {
        return false;
    };

    match block_txs.iter().position(|tx| tx == first) {
        Some(start) => block_txs
            .get(start..start + bundle_txs.len())
            .map_or(false, |window| window == bundle_txs),
        None => false,
    }
}

#[async_trait]
impl<M: Middleware + 'static> RelayClient for FlashbotsRelayClient<M> {
    async fn submit(&self, bundle: &Bundle) -> RacerResult<BundleSubmissionResult> {
        info!(
            "📤 번들 제출: {} (블록 {}, 트랜잭션 {}개)",
            bundle.id(),
            bundle.target_block(),
            bundle.transactions().len()
        );

        let response: SendBundleResponse = self.call(ETH_SEND_BUNDLE, bundle.to_send_params()).await?;

        self.submitted_bundles
            .lock()
            .await
            .insert(response.bundle_hash, bundle.tx_hashes());

        info!("✅ 번들 접수됨: {:?} (블록 {})", response.bundle_hash, bundle.target_block());
        Ok(BundleSubmissionResult {
            bundle_hash: response.bundle_hash,
            target_block: bundle.target_block(),
            submitted_at: Utc::now(),
        })
    }

    async fn get_stats(&self, bundle_hash: H256, target_block: u64) -> RacerResult<BundleStats> {
        let params = BundleStatsParams {
            bundle_hash,
            block_number: format!("0x{:x}", target_block),
        };
        let relay_stats: RelayBundleStats = self.call(FLASHBOTS_GET_BUNDLE_STATS, params).await?;
        debug!(
            "번들 통계 {:?}: simulated={} received_at={:?} simulated_at={:?}",
            bundle_hash, relay_stats.is_simulated, relay_stats.received_at, relay_stats.simulated_at
        );

        let mut stats = BundleStats {
            bundle_hash,
            target_block,
            status: if relay_stats.is_simulated {
                BundleStatus::Simulated
            } else {
                BundleStatus::Pending
            },
            is_simulated: relay_stats.is_simulated,
            is_high_priority: relay_stats.is_high_priority,
            considered_by_builders: relay_stats.considered_by_builders_at.len(),
            sealed_by_builders: relay_stats.sealed_by_builders_at.len(),
        };

        if self.check_inclusion(bundle_hash, target_block).await? {
            stats.status = BundleStatus::Included;
        }

        Ok(stats)
    }
}
