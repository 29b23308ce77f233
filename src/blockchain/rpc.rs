use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use futures::stream::{self, StreamExt};
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::constants::{ETH_GET_RAW_TRANSACTION_BY_HASH, ETH_GET_TRANSACTION_BY_HASH, ETH_SUBSCRIBE};
use crate::mempool::watcher::{PendingHashStream, PendingTxTransport};
use crate::types::{PendingTxRecord, RacerError, RacerResult};

/// 노드 전송 계층
///
/// 펜딩 트랜잭션 구독은 웹소켓으로, 조회는 HTTP 프로바이더로 처리한다.
pub struct NodeTransport {
    ws_url: String,
    subscription_method: String,
    http_provider: Arc<Provider<Http>>,
    /// `eth_getRawTransactionByHash` 로 raw 바이트를 먼저 시도
    fetch_raw: bool,
}

impl NodeTransport {
    pub fn new(rpc_url: &str, ws_url: &str, subscription_method: &str, fetch_raw: bool) -> RacerResult<Self> {
        let http_provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| RacerError::Config(format!("invalid rpc url {}: {}", rpc_url, e)))?;

        info!("🔌 노드 전송 계층 초기화: rpc={} ws={}", rpc_url, ws_url);
        Ok(Self {
            ws_url: ws_url.to_string(),
            subscription_method: subscription_method.to_string(),
            http_provider: Arc::new(http_provider),
            fetch_raw,
        })
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        Arc::clone(&self.http_provider)
    }

    pub async fn chain_id(&self) -> RacerResult<u64> {
        let chain_id = self
            .http_provider
            .get_chainid()
            .await
            .map_err(|e| RacerError::TransientTransport(format!("eth_chainId failed: {}", e)))?;
        Ok(chain_id.as_u64())
    }

    /// 펜딩 상태 기준 논스
    pub async fn pending_nonce(&self, address: Address) -> RacerResult<U256> {
        self.http_provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| RacerError::TransientTransport(format!("eth_getTransactionCount failed: {}", e)))
    }

    async fn get_raw_transaction(&self, hash: H256) -> Option<Bytes> {
        match self
            .http_provider
            .request::<_, Option<Bytes>>(ETH_GET_RAW_TRANSACTION_BY_HASH, [hash])
            .await
        {
            Ok(raw) => raw.filter(|bytes| !bytes.is_empty()),
            Err(e) => {
                debug!("raw 트랜잭션 조회 불가, 필드 재구성으로 대체: {}", e);
                None
            }
        }
    }
}

/// `eth_subscribe` 요청 본문
pub fn subscription_request(method: &str, from: Address, to: Address) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": ETH_SUBSCRIBE,
        "params": [
            method,
            {
                "fromAddress": from,
                "toAddress": to,
                "hashesOnly": true
            }
        ]
    })
}

/// 구독 응답에서 구독 ID 추출. 구독 알림이 아닌 다른 메시지면 `None`.
pub fn parse_subscription_ack(text: &str) -> RacerResult<Option<String>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RacerError::TransientTransport(format!("malformed subscription response: {}", e)))?;

    if let Some(error) = value.get("error") {
        return Err(RacerError::TransientTransport(format!("subscription rejected: {}", error)));
    }

    if value.get("id").is_none() {
        return Ok(None);
    }

    Ok(value.get("result").and_then(Value::as_str).map(str::to_string))
}

/// 구독 알림에서 트랜잭션 해시 추출
///
/// `hashesOnly` 면 result 가 해시 문자열이고, 아니면 트랜잭션 객체의 `hash` 필드를 쓴다.
pub fn parse_notification(text: &str) -> Option<RacerResult<H256>> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("⚠️ 해석할 수 없는 구독 메시지: {}", e);
            return None;
        }
    };

    if value.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return None;
    }

    let result = value.get("params")?.get("result")?;
    let hash = match result {
        Value::String(hash) => hash.as_str(),
        Value::Object(tx) => tx.get("hash")?.as_str()?,
        _ => return None,
    };

    Some(
        hash.parse::<H256>()
            .map_err(|e| RacerError::TransientTransport(format!("invalid transaction hash {}: {}", hash, e))),
    )
}

#[async_trait]
impl PendingTxTransport for NodeTransport {
    async fn subscribe(&self, from: Address, to: Address) -> RacerResult<PendingHashStream> {
        let (mut ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| RacerError::TransientTransport(format!("websocket connect failed: {}", e)))?;

        let request = subscription_request(&self.subscription_method, from, to);
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| RacerError::TransientTransport(format!("failed to send subscription: {}", e)))?;

        let subscription_id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(id) = parse_subscription_ack(&text)? {
                        break id;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .map_err(|e| RacerError::TransientTransport(format!("failed to answer ping: {}", e)))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(RacerError::TransientTransport(format!(
                        "websocket closed during handshake: {:?}",
                        frame
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(RacerError::TransientTransport(format!("websocket error during handshake: {}", e)));
                }
                None => {
                    return Err(RacerError::TransientTransport("websocket closed during handshake".to_string()));
                }
            }
        };
        info!("✅ {} 구독 완료: {}", self.subscription_method, subscription_id);

        let hashes = stream::unfold(Some(ws), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(item) = parse_notification(&text) {
                            return Some((item, Some(ws)));
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = ws.send(Message::Pong(payload)).await {
                            let error = RacerError::TransientTransport(format!("failed to answer ping: {}", e));
                            return Some((Err(error), None));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let error = RacerError::TransientTransport(format!("websocket closed: {:?}", frame));
                        return Some((Err(error), None));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let error = RacerError::TransientTransport(format!("websocket error: {}", e));
                        return Some((Err(error), None));
                    }
                    None => return None,
                }
            }
        });

        Ok(hashes.boxed())
    }

    async fn get_transaction(&self, hash: H256) -> RacerResult<Option<PendingTxRecord>> {
        let record: Option<PendingTxRecord> = self
            .http_provider
            .request(ETH_GET_TRANSACTION_BY_HASH, [hash])
            .await
            .map_err(|e| RacerError::TransientTransport(format!("eth_getTransactionByHash failed: {}", e)))?;

        let Some(mut record) = record else {
            return Ok(None);
        };

        if self.fetch_raw {
            record.raw = self.get_raw_transaction(hash).await;
        }

        Ok(Some(record))
    }

    async fn block_number(&self) -> RacerResult<u64> {
        let block = self
            .http_provider
            .get_block_number()
            .await
            .map_err(|e| RacerError::TransientTransport(format!("eth_blockNumber failed: {}", e)))?;
        Ok(block.as_u64())
    }
}
