use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256, U64};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::mempool::watcher::{PendingHashStream, PendingTxTransport};
use crate::types::{PendingTxRecord, RacerError, RacerResult, RawTransaction};

/// 구독 스트림에 흘려보낼 이벤트
#[derive(Debug, Clone)]
pub enum MockEvent {
    Hash(H256),
    Error(String),
}

#[derive(Debug, Clone)]
enum MockSession {
    Fail(String),
    Events(Vec<MockEvent>),
}

/// 스크립트 기반 노드 전송 계층
///
/// `subscribe` 호출마다 준비된 세션을 하나씩 꺼낸다. 세션 이벤트를 모두 흘린 뒤에는
/// 연결을 끊지 않고 대기하며, 세션이 바닥나면 아무 이벤트도 없는 구독을 돌려준다.
pub struct MockTransport {
    sessions: Mutex<VecDeque<MockSession>>,
    records: Mutex<HashMap<H256, PendingTxRecord>>,
    lookup_failures: Mutex<HashMap<H256, u32>>,
    block: AtomicU64,
    auto_advance: AtomicBool,
    subscribe_calls: AtomicU32,
    lookup_calls: AtomicU32,
    latency: Duration,
}

impl MockTransport {
    pub fn new(start_block: u64) -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            records: Mutex::new(HashMap::new()),
            lookup_failures: Mutex::new(HashMap::new()),
            block: AtomicU64::new(start_block),
            auto_advance: AtomicBool::new(false),
            subscribe_calls: AtomicU32::new(0),
            lookup_calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_session(mut self, events: Vec<MockEvent>) -> Self {
        self.sessions.get_mut().push_back(MockSession::Events(events));
        self
    }

    pub fn with_failed_subscription(mut self, reason: &str) -> Self {
        self.sessions.get_mut().push_back(MockSession::Fail(reason.to_string()));
        self
    }

    /// `block_number` 을 읽을 때마다 블록 높이가 1씩 증가
    pub fn auto_advancing(self) -> Self {
        self.auto_advance.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn insert_record(&self, record: PendingTxRecord) {
        self.records.lock().await.insert(record.hash, record);
    }

    /// 해당 해시 조회를 `times` 번 실패시킨다
    pub async fn fail_lookups(&self, hash: H256, times: u32) {
        self.lookup_failures.lock().await.insert(hash, times);
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    pub fn current_block(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> u32 {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// 주기적으로 블록 높이를 올리는 백그라운드 작업
    pub fn spawn_block_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let block = transport.block.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("🎭 [MOCK] 새 블록 {}", block);
            }
        })
    }
}

#[async_trait]
impl PendingTxTransport for MockTransport {
    async fn subscribe(&self, from: Address, to: Address) -> RacerResult<PendingHashStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let session = self.sessions.lock().await.pop_front();
        match session {
            Some(MockSession::Fail(reason)) => {
                debug!("🎭 [MOCK] 구독 실패 주입: {}", reason);
                Err(RacerError::TransientTransport(reason))
            }
            Some(MockSession::Events(events)) => {
                info!("🎭 [MOCK] 구독 시작 from={:?} to={:?} ({}개 이벤트)", from, to, events.len());
                let items = events.into_iter().map(|event| match event {
                    MockEvent::Hash(hash) => Ok(hash),
                    MockEvent::Error(reason) => Err(RacerError::TransientTransport(reason)),
                });
                Ok(stream::iter(items).chain(stream::pending()).boxed())
            }
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn get_transaction(&self, hash: H256) -> RacerResult<Option<PendingTxRecord>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(remaining) = self.lookup_failures.lock().await.get_mut(&hash) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RacerError::TransientTransport(format!("lookup of {:?} failed", hash)));
            }
        }

        Ok(self.records.lock().await.get(&hash).cloned())
    }

    async fn block_number(&self) -> RacerResult<u64> {
        if self.auto_advance.load(Ordering::SeqCst) {
            Ok(self.block.fetch_add(1, Ordering::SeqCst))
        } else {
            Ok(self.block.load(Ordering::SeqCst))
        }
    }
}

/// 서명 없는 임의 해시의 펜딩 레코드
pub fn test_record(from: Address, to: Option<Address>, input: &[u8]) -> PendingTxRecord {
    PendingTxRecord {
        hash: H256::random(),
        from,
        to,
        input: Some(Bytes::from(input.to_vec())),
        value: Some(U256::zero()),
        nonce: Some(U256::zero()),
        gas: Some(U256::from(21_000u64)),
        gas_price: Some(U256::from(1_000_000_000u64)),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        transaction_type: Some(U64::zero()),
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

/// 실제로 서명한 트랜잭션과, 노드가 돌려줄 형태의 레코드
pub fn signed_record(wallet: &LocalWallet, tx: &TypedTransaction) -> RacerResult<(PendingTxRecord, RawTransaction)> {
    let mut tx = tx.clone();
    let chain_id = tx.chain_id().map(|id| id.as_u64()).unwrap_or_else(|| wallet.chain_id());
    tx.set_chain_id(chain_id);

    let signature = wallet
        .sign_transaction_sync(&tx)
        .map_err(|e| RacerError::Signer(e.to_string()))?;
    let raw = RawTransaction::new(tx.rlp_signed(&signature));
    let y_parity = signature.v.saturating_sub(chain_id * 2 + 35);

    let (transaction_type, gas_price, max_fee_per_gas, max_priority_fee_per_gas, access_list, v) = match &tx {
        TypedTransaction::Legacy(request) => (0u64, request.gas_price, None, None, None, signature.v),
        TypedTransaction::Eip2930(request) => (
            1,
            request.tx.gas_price,
            None,
            None,
            Some(request.access_list.clone()),
            y_parity,
        ),
        // 노드는 펜딩 1559 트랜잭션에도 gasPrice 를 채워 준다
        TypedTransaction::Eip1559(request) => (
            2,
            request.max_fee_per_gas,
            request.max_fee_per_gas,
            request.max_priority_fee_per_gas,
            Some(request.access_list.clone()),
            y_parity,
        ),
    };

    let record = PendingTxRecord {
        hash: raw.hash(),
        from: wallet.address(),
        to: tx.to().and_then(|to| to.as_address().copied()),
        input: Some(tx.data().cloned().unwrap_or_default()),
        value: Some(tx.value().copied().unwrap_or_default()),
        nonce: tx.nonce().copied(),
        gas: tx.gas().copied(),
        gas_price,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        transaction_type: Some(U64::from(transaction_type)),
        chain_id: Some(U256::from(chain_id)),
        access_list,
        v: Some(U64::from(v)),
        r: Some(signature.r),
        s: Some(signature.s),
        block_hash: None,
        block_number: None,
        transaction_index: None,
        raw: None,
    };

    Ok((record, raw))
}
