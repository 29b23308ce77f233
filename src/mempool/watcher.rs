use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{TimeoutConfig, WatcherConfig};
use crate::constants::DEFAULT_SEEN_CAPACITY;
use crate::types::{PendingTxRecord, RacerError, RacerResult, TriggerRule};

/// 구독이 돌려주는 트랜잭션 해시 스트림
pub type PendingHashStream = BoxStream<'static, RacerResult<H256>>;

/// 노드 전송 계층
///
/// 필터링된 펜딩 트랜잭션 구독과 해시 -> 레코드 조회만 추상화한다.
/// 실제 와이어 포맷은 구현체(`NodeTransport`, `MockTransport`)가 책임진다.
#[async_trait]
pub trait PendingTxTransport: Send + Sync {
    /// 발신자/수신자로 필터링된 펜딩 트랜잭션 구독을 연다
    async fn subscribe(&self, from: Address, to: Address) -> RacerResult<PendingHashStream>;

    /// 해시로 펜딩 트랜잭션 조회 (멤풀에서 빠졌으면 `None`)
    async fn get_transaction(&self, hash: H256) -> RacerResult<Option<PendingTxRecord>>;

    /// 현재 블록 높이
    async fn block_number(&self) -> RacerResult<u64>;
}

/// 감시자 재연결/조회 설정
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub subscribe_timeout: Duration,
    pub lookup_timeout: Duration,
    pub lookup_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` 이면 재연결을 무기한 시도 (지연은 `max_backoff` 로 상한)
    pub max_reconnect_attempts: Option<u32>,
    /// 중복 제거 집합 상한. 넘치면 가장 오래된 해시부터 잊는다.
    pub seen_capacity: usize,
}

impl WatcherSettings {
    pub fn from_config(watcher: &WatcherConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            subscribe_timeout: Duration::from_millis(timeouts.subscribe_ms),
            lookup_timeout: Duration::from_millis(timeouts.lookup_ms),
            lookup_retries: watcher.lookup_retries,
            initial_backoff: Duration::from_millis(watcher.initial_backoff_ms),
            max_backoff: Duration::from_millis(watcher.max_backoff_ms),
            max_reconnect_attempts: watcher.max_reconnect_attempts,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }

    /// 재연결 n번째 시도의 대기 시간 (지터 제외)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(16);
        let base = self.initial_backoff.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff.as_millis() as u64))
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from_config(&WatcherConfig::default(), &TimeoutConfig::default())
    }
}

/// 펜딩 트랜잭션 감시자
///
/// 구독 연결을 단독으로 소유하고, 들어오는 해시를 조회해 규칙의 발신자/수신자와
/// 일치하는 레코드만 내보낸다. 연결이 끊기면 지수 백오프로 새 구독을 연다.
/// 재연결 시 조회 중복 제거 상태는 초기화되지만 규칙은 유지된다.
pub struct PendingTransactionWatcher {
    transport: Arc<dyn PendingTxTransport>,
    rule: TriggerRule,
    settings: WatcherSettings,
    stream: Option<PendingHashStream>,
    seen: HashSet<H256>,
    seen_order: VecDeque<H256>,
    reconnect_attempts: u32,
    subscriptions_opened: u32,
}

impl PendingTransactionWatcher {
    pub fn new(transport: Arc<dyn PendingTxTransport>, rule: TriggerRule, settings: WatcherSettings) -> Self {
        Self {
            transport,
            rule,
            settings,
            stream: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            reconnect_attempts: 0,
            subscriptions_opened: 0,
        }
    }

    pub fn rule(&self) -> &TriggerRule {
        &self.rule
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn subscriptions_opened(&self) -> u32 {
        self.subscriptions_opened
    }

    /// 구독을 즉시 닫는다
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("🔌 펜딩 트랜잭션 구독 종료");
        }
        self.forget_seen();
    }

    /// 규칙의 발신자/수신자와 일치하는 다음 펜딩 트랜잭션
    ///
    /// 재연결 한도를 모두 소진한 경우에만 에러를 돌려준다.
    pub async fn next_record(&mut self) -> RacerResult<PendingTxRecord> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.connect().await?;
                continue;
            };

            let item = stream.next().await;
            match item {
                Some(Ok(hash)) => {
                    self.reconnect_attempts = 0;
                    if let Some(record) = self.resolve(hash).await {
                        return Ok(record);
                    }
                }
                Some(Err(e)) => {
                    warn!("⚠️ 구독 스트림 오류, 재연결 예정: {}", e);
                    self.drop_subscription();
                }
                None => {
                    warn!("⚠️ 구독 스트림이 닫힘, 재연결 예정");
                    self.drop_subscription();
                }
            }
        }
    }

    /// 감시자를 스트림으로 변환 (재연결 한도 소진 시 에러 하나를 내보내고 종료)
    pub fn into_stream(self) -> impl Stream<Item = RacerResult<PendingTxRecord>> {
        stream::unfold(Some(self), |state| async move {
            let mut watcher = state?;
            match watcher.next_record().await {
                Ok(record) => Some((Ok(record), Some(watcher))),
                Err(e) => {
                    watcher.close();
                    Some((Err(e), None))
                }
            }
        })
    }

    fn drop_subscription(&mut self) {
        self.stream = None;
        self.forget_seen();
        self.reconnect_attempts += 1;
    }

    fn forget_seen(&mut self) {
        self.seen.clear();
        self.seen_order.clear();
    }

    /// 처음 보는 해시면 기억하고 `true`
    fn remember(&mut self, hash: H256) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.seen_order.push_back(hash);
        while self.seen_order.len() > self.settings.seen_capacity.max(1) {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    async fn connect(&mut self) -> RacerResult<()> {
        loop {
            if let Some(max) = self.settings.max_reconnect_attempts {
                if self.reconnect_attempts > max {
                    return Err(RacerError::TransientTransport(format!(
                        "pending transaction subscription failed after {} reconnect attempts",
                        max
                    )));
                }
            }

            if self.reconnect_attempts > 0 {
                let delay = self.jittered_delay();
                warn!("🔁 {}ms 후 재구독 (시도 {})", delay.as_millis(), self.reconnect_attempts);
                sleep(delay).await;
            }

            let subscribe = self.transport.subscribe(self.rule.from, self.rule.to);
            match timeout(self.settings.subscribe_timeout, subscribe).await {
                Ok(Ok(stream)) => {
                    self.stream = Some(stream);
                    self.forget_seen();
                    self.subscriptions_opened += 1;
                    info!(
                        "👁️ 펜딩 트랜잭션 구독 시작: from={:?} to={:?}",
                        self.rule.from, self.rule.to
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("❌ 구독 실패: {}", e);
                    self.reconnect_attempts += 1;
                }
                Err(_) => {
                    warn!("⏱️ 구독 핸드셰이크 타임아웃 ({}ms)", self.settings.subscribe_timeout.as_millis());
                    self.reconnect_attempts += 1;
                }
            }
        }
    }

    fn jittered_delay(&self) -> Duration {
        let delay = self.settings.backoff_delay(self.reconnect_attempts);
        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// 해시를 레코드로 변환. 조회 실패/타임아웃은 제한 횟수만큼 재시도 후 건너뛴다.
    async fn resolve(&mut self, hash: H256) -> Option<PendingTxRecord> {
        if !self.remember(hash) {
            debug!("중복 해시 무시: {:?}", hash);
            return None;
        }
        debug!("📨 새 펜딩 트랜잭션: {:?}", hash);

        let mut attempt = 0;
        loop {
            match timeout(self.settings.lookup_timeout, self.transport.get_transaction(hash)).await {
                Ok(Ok(Some(record))) => {
                    if !self.rule.matches_route(&record) {
                        debug!("발신자/수신자 불일치, 무시: {:?}", hash);
                        return None;
                    }
                    if record.is_mined() {
                        debug!("이미 채굴된 트랜잭션, 무시: {:?}", hash);
                        return None;
                    }
                    return Some(record);
                }
                Ok(Ok(None)) => {
                    debug!("멤풀에서 사라진 트랜잭션: {:?}", hash);
                    return None;
                }
                Ok(Err(e)) => {
                    warn!("⚠️ 트랜잭션 조회 실패 {:?}: {}", hash, e);
                }
                Err(_) => {
                    warn!("⏱️ 트랜잭션 조회 타임아웃: {:?}", hash);
                }
            }

            attempt += 1;
            if attempt > self.settings.lookup_retries {
                warn!("트랜잭션 조회 포기: {:?}", hash);
                return None;
            }
        }
    }
}
