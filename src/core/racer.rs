use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RaceConfig, TimeoutConfig};
use crate::constants::MAX_CONSECUTIVE_POLL_ERRORS;
use crate::execution::reconstructor::RawTransactionReconstructor;
use crate::flashbots::bundle::{Bundle, BundleBuilder};
use crate::flashbots::client::RelayClient;
use crate::mempool::filters::format_selector;
use crate::mempool::watcher::{PendingTransactionWatcher, PendingTxTransport, WatcherSettings};
use crate::types::{
    BundleMode, BundleStatus, BundleSubmissionResult, RaceOutcome, RaceState, RacerError, RacerResult,
    RawTransaction, TriggerRule,
};

/// 레이스 1회의 동작 파라미터
#[derive(Debug, Clone)]
pub struct RacerSettings {
    pub lookahead_blocks: u64,
    /// 제출 시도 총 횟수 (첫 제출 포함)
    pub retry_count: u32,
    pub poll_interval: Duration,
    pub grace_window_blocks: u64,
    pub bundle_mode: BundleMode,
    pub submit_timeout: Duration,
    pub stats_timeout: Duration,
    pub block_timeout: Duration,
}

impl RacerSettings {
    pub fn from_config(race: &RaceConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            lookahead_blocks: race.lookahead_blocks,
            retry_count: race.retry_count,
            poll_interval: race.poll_interval(),
            grace_window_blocks: race.grace_window_blocks,
            bundle_mode: race.bundle_mode,
            submit_timeout: Duration::from_millis(timeouts.submit_ms),
            stats_timeout: Duration::from_millis(timeouts.stats_ms),
            block_timeout: Duration::from_millis(timeouts.lookup_ms),
        }
    }
}

/// 한 번의 제출에 대한 폴링 결과
enum PollResult {
    Included,
    Expired { current_block: u64 },
    SimulationFailed(String),
    Aborted(RacerError),
}

/// 제출/폴링 단계에서 공유하는 불변 상태
struct RaceContext {
    name: String,
    transport: Arc<dyn PendingTxTransport>,
    relay: Arc<dyn RelayClient>,
    settings: RacerSettings,
    cancel: CancellationToken,
}

impl RaceContext {
    /// 다음 타겟 블록: 현재 블록 + lookahead, 이전 타겟보다 반드시 크다
    async fn next_target_block(&self, previous: Option<u64>) -> RacerResult<u64> {
        let current = self.current_block().await?;
        let target = current + self.settings.lookahead_blocks;
        Ok(match previous {
            Some(previous) => target.max(previous + 1),
            None => target,
        })
    }

    async fn current_block(&self) -> RacerResult<u64> {
        timeout(self.settings.block_timeout, self.transport.block_number())
            .await
            .map_err(|_| RacerError::Timeout("block number lookup".to_string()))?
    }

    async fn submit(&self, bundle: &Bundle) -> RacerResult<BundleSubmissionResult> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RacerError::Cancelled),
            result = timeout(self.settings.submit_timeout, self.relay.submit(bundle)) => match result {
                Ok(result) => result,
                Err(_) => Err(RacerError::RelayUnavailable(format!(
                    "submit timed out after {}ms",
                    self.settings.submit_timeout.as_millis()
                ))),
            },
        }
    }

    /// 포함 / 데드라인 경과 / 중단까지 상태 폴링
    async fn poll(&self, submission: &BundleSubmissionResult) -> PollResult {
        let deadline = submission.target_block + self.settings.grace_window_blocks;
        // 릴레이와 노드 실패는 따로 센다
        let mut stats_errors = 0u32;
        let mut block_errors = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollResult::Aborted(RacerError::Cancelled),
                _ = sleep(self.settings.poll_interval) => {}
            }

            let stats = timeout(
                self.settings.stats_timeout,
                self.relay.get_stats(submission.bundle_hash, submission.target_block),
            )
            .await
            .unwrap_or_else(|_| Err(RacerError::Timeout("bundle stats lookup".to_string())));

            match stats {
                Ok(stats) => {
                    stats_errors = 0;
                    match stats.status {
                        BundleStatus::Included => {
                            info!("🎉 [{}] 번들 포함: {:?} (블록 {})", self.name, stats.bundle_hash, stats.target_block);
                            return PollResult::Included;
                        }
                        BundleStatus::SimulationFailed(reason) => return PollResult::SimulationFailed(reason),
                        status => debug!(
                            "[{}] 번들 상태 {:?}: {:?} (빌더 {}곳 검토)",
                            self.name, stats.bundle_hash, status, stats.considered_by_builders
                        ),
                    }
                }
                Err(e) if e.is_transient() => {
                    stats_errors += 1;
                    warn!("⚠️ [{}] 번들 상태 조회 실패 ({}회 연속): {}", self.name, stats_errors, e);
                    if stats_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        return PollResult::Aborted(e);
                    }
                }
                Err(e) => return PollResult::Aborted(e),
            }

            match self.current_block().await {
                Ok(current_block) if current_block >= deadline => return PollResult::Expired { current_block },
                Ok(_) => block_errors = 0,
                Err(e) if e.is_transient() => {
                    block_errors += 1;
                    warn!("⚠️ [{}] 블록 높이 조회 실패 ({}회 연속): {}", self.name, block_errors, e);
                    if block_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        return PollResult::Aborted(e);
                    }
                }
                Err(e) => return PollResult::Aborted(e),
            }
        }
    }
}

/// 번들 레이서
///
/// 트리거 트랜잭션을 기다렸다가 `[오너 트랜잭션, 팔로워 트랜잭션]` 번들을 다음 블록에 제출하고,
/// 포함되거나 재시도를 모두 소진할 때까지 상태를 추적한다.
///
/// ```text
/// Idle -> Watching -> Matched -> Reconstructing -> Submitting -> Polling -> Included
///            ^                        |                ^            |
///            +---- (재구성 실패) ------+                +-- 만료 -----+  (재시도 남음)
/// ```
///
/// 시도별 만료는 기록에 남기지 않는다. `history` 의 종료 상태는 항상 마지막 한 번뿐이다.
///
/// `run` 은 `self` 를 소비하므로 종료된 레이서는 다시 시작할 수 없다.
pub struct BundleRacer {
    ctx: RaceContext,
    watcher: PendingTransactionWatcher,
    reconstructor: RawTransactionReconstructor,
    builder: BundleBuilder,
    follower_tx: RawTransaction,
    state: RaceState,
    history: Vec<RaceState>,
    submissions: Vec<BundleSubmissionResult>,
    skipped_records: u32,
}

impl BundleRacer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        rule: TriggerRule,
        transport: Arc<dyn PendingTxTransport>,
        relay: Arc<dyn RelayClient>,
        follower_tx: RawTransaction,
        settings: RacerSettings,
        watcher_settings: WatcherSettings,
        cancel: CancellationToken,
    ) -> Self {
        let watcher = PendingTransactionWatcher::new(Arc::clone(&transport), rule, watcher_settings);
        Self {
            ctx: RaceContext {
                name: name.into(),
                transport,
                relay,
                settings,
                cancel,
            },
            watcher,
            reconstructor: RawTransactionReconstructor::new(),
            builder: BundleBuilder::new(),
            follower_tx,
            state: RaceState::Idle,
            history: vec![RaceState::Idle],
            submissions: Vec::new(),
            skipped_records: 0,
        }
    }

    pub fn with_bundle_builder(mut self, builder: BundleBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn state(&self) -> RaceState {
        self.state
    }

    /// 레이스 실행. 종료 상태(Included/Expired/Failed) 하나로 끝난다.
    pub async fn run(mut self) -> RaceOutcome {
        let rule = *self.watcher.rule();
        info!(
            "🏁 레이스 시작 [{}]: from={:?} to={:?} selector={} mode={:?}",
            self.ctx.name,
            rule.from,
            rule.to,
            format_selector(&rule.function_selector),
            self.ctx.settings.bundle_mode
        );

        self.transition(RaceState::Watching);
        let owner_tx = match self.watch().await {
            Ok(owner_tx) => owner_tx,
            Err(e) => return self.finish(RaceState::Failed, Some(e)),
        };

        let transactions = match owner_tx {
            Some(owner_tx) => vec![owner_tx, self.follower_tx.clone()],
            None => vec![self.follower_tx.clone()],
        };

        self.race(transactions).await
    }

    fn transition(&mut self, next: RaceState) {
        if self.state == next {
            return;
        }
        debug!("[{}] {} -> {}", self.ctx.name, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// 트리거가 나타날 때까지 감시. 페어 모드면 재구성된 오너 트랜잭션을 돌려준다.
    async fn watch(&mut self) -> RacerResult<Option<RawTransaction>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => None,
                record = self.watcher.next_record() => Some(record),
            };
            let record = match next {
                Some(record) => record?,
                None => {
                    self.watcher.close();
                    return Err(RacerError::Cancelled);
                }
            };

            if !self.watcher.rule().matches_selector(&record) {
                debug!(
                    "[{}] 셀렉터 불일치, 무시: {:?} ({:?})",
                    self.ctx.name,
                    record.hash,
                    record.selector().map(|selector| format_selector(&selector))
                );
                continue;
            }

            self.transition(RaceState::Matched);
            info!("🎯 [{}] 트리거 트랜잭션 발견: {:?}", self.ctx.name, record.hash);

            if self.ctx.settings.bundle_mode == BundleMode::FollowerOnly {
                self.watcher.close();
                return Ok(None);
            }

            self.transition(RaceState::Reconstructing);
            match self.reconstructor.reconstruct(&record) {
                Ok(raw) => {
                    self.watcher.close();
                    info!("🔧 [{}] 오너 트랜잭션 재구성 완료 ({} bytes)", self.ctx.name, raw.len());
                    return Ok(Some(raw));
                }
                Err(e) if e.is_skippable_record() => {
                    warn!("⚠️ [{}] 재구성 실패, 감시 계속: {}", self.ctx.name, e);
                    self.skipped_records += 1;
                    self.transition(RaceState::Watching);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 제출/폴링 루프
    async fn race(mut self, transactions: Vec<RawTransaction>) -> RaceOutcome {
        let mut attempts = 0u32;
        let mut previous_target: Option<u64> = None;
        let mut last_error: Option<RacerError> = None;
        let mut base_bundle: Option<Bundle> = None;

        while attempts < self.ctx.settings.retry_count {
            if self.ctx.cancel.is_cancelled() {
                return self.finish(RaceState::Failed, Some(RacerError::Cancelled));
            }

            attempts += 1;
            self.transition(RaceState::Submitting);

            let target = match self.ctx.next_target_block(previous_target).await {
                Ok(target) => target,
                Err(e) if e.is_transient() => {
                    warn!("⚠️ [{}] 블록 높이 조회 실패 (시도 {}): {}", self.ctx.name, attempts, e);
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return self.finish(RaceState::Failed, Some(e)),
            };
            previous_target = Some(target);

            let bundle = match &base_bundle {
                Some(base) => base.retarget(target),
                None => match self.builder.build(transactions.clone(), target) {
                    Ok(bundle) => {
                        base_bundle = Some(bundle.clone());
                        bundle
                    }
                    Err(e) => return self.finish(RaceState::Failed, Some(e)),
                },
            };

            let submission = match self.ctx.submit(&bundle).await {
                Ok(submission) => submission,
                Err(RacerError::Cancelled) => return self.finish(RaceState::Failed, Some(RacerError::Cancelled)),
                Err(e) if e.is_transient() || matches!(e, RacerError::RelayRejected(_)) => {
                    warn!(
                        "⚠️ [{}] 번들 제출 실패 (시도 {}/{}, 블록 {}): {}",
                        self.ctx.name, attempts, self.ctx.settings.retry_count, target, e
                    );
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return self.finish(RaceState::Failed, Some(e)),
            };

            info!(
                "📤 [{}] 번들 제출 완료: {:?} (블록 {}, 시도 {}/{})",
                self.ctx.name, submission.bundle_hash, submission.target_block, attempts, self.ctx.settings.retry_count
            );
            self.submissions.push(submission.clone());
            self.transition(RaceState::Polling);

            match self.ctx.poll(&submission).await {
                PollResult::Included => return self.finish(RaceState::Included, None),
                PollResult::Expired { current_block } => {
                    info!(
                        "⌛ [{}] 블록 {} 까지 미포함 (현재 블록 {})",
                        self.ctx.name,
                        submission.target_block + self.ctx.settings.grace_window_blocks,
                        current_block
                    );
                    last_error = None;
                }
                PollResult::SimulationFailed(reason) => {
                    warn!("⚠️ [{}] 릴레이 시뮬레이션 실패: {}", self.ctx.name, reason);
                    last_error = Some(RacerError::RelayRejected(format!("simulation failed: {}", reason)));
                }
                PollResult::Aborted(e) => return self.finish(RaceState::Failed, Some(e)),
            }
        }

        match last_error {
            None => self.finish(RaceState::Expired, None),
            Some(last) => self.finish(
                RaceState::Failed,
                Some(RacerError::RaceExhausted {
                    attempts,
                    last: Box::new(last),
                }),
            ),
        }
    }

    fn finish(mut self, state: RaceState, error: Option<RacerError>) -> RaceOutcome {
        self.watcher.close();
        self.transition(state);

        let last = self.submissions.last().cloned();
        match (&error, state) {
            (Some(e), _) => error!("❌ [{}] 레이스 실패: {}", self.ctx.name, e.cause_chain()),
            (None, RaceState::Included) => info!(
                "✅ [{}] 레이스 성공: 번들 {:?} 블록 {}",
                self.ctx.name,
                last.as_ref().map(|s| s.bundle_hash),
                last.as_ref().map(|s| s.target_block).unwrap_or_default()
            ),
            (None, _) => warn!(
                "⌛ [{}] 레이스 만료: {}회 제출 모두 미포함",
                self.ctx.name,
                self.submissions.len()
            ),
        }

        RaceOutcome {
            race: self.ctx.name,
            state,
            bundle_hash: last.as_ref().map(|s| s.bundle_hash),
            target_block: last.as_ref().map(|s| s.target_block),
            error: error.map(|e| e.cause_chain()),
            submissions: self.submissions,
            history: self.history,
            skipped_records: self.skipped_records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::filters::selector_from_signature;
    use crate::mempool::watcher::PendingHashStream;
    use crate::mocks::mempool_mock::{signed_record, test_record};
    use crate::mocks::{MockEvent, MockRelayClient, MockTransport};
    use crate::types::PendingTxRecord;
    use async_trait::async_trait;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Address, Eip1559TransactionRequest, H256, U256};
    use std::sync::atomic::{AtomicU32, Ordering};

    const CHAIN_ID: u64 = 11_155_111;

    fn rule() -> TriggerRule {
        TriggerRule::new(
            "0xe9d2e42129c04f5627f7894aabd422b8a76737ad".parse().unwrap(),
            "0xa4010fa5a816747f9eba1a60271280beaae28f10".parse().unwrap(),
            selector_from_signature("enablePresale()"),
        )
    }

    fn settings() -> RacerSettings {
        RacerSettings {
            lookahead_blocks: 1,
            retry_count: 3,
            poll_interval: Duration::from_millis(1),
            grace_window_blocks: 2,
            bundle_mode: BundleMode::Paired,
            submit_timeout: Duration::from_millis(500),
            stats_timeout: Duration::from_millis(500),
            block_timeout: Duration::from_millis(500),
        }
    }

    fn watcher_settings() -> WatcherSettings {
        WatcherSettings {
            subscribe_timeout: Duration::from_millis(500),
            lookup_timeout: Duration::from_millis(500),
            lookup_retries: 0,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_reconnect_attempts: Some(3),
            seen_capacity: 64,
        }
    }

    /// 오너가 실제로 서명한 트리거 트랜잭션 (발신자는 규칙 주소로 표시)
    fn owner_record(rule: &TriggerRule, nonce: u64, selector: [u8; 4]) -> (PendingTxRecord, RawTransaction) {
        let wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(CHAIN_ID);
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(rule.to)
            .nonce(nonce)
            .gas(80_000u64)
            .max_fee_per_gas(U256::from(40_000_000_000u64))
            .max_priority_fee_per_gas(U256::from(1_000_000_000u64))
            .value(U256::zero())
            .data(selector.to_vec())
            .chain_id(CHAIN_ID)
            .into();
        let (mut record, raw) = signed_record(&wallet, &tx).unwrap();
        record.from = rule.from;
        (record, raw)
    }

    fn follower() -> RawTransaction {
        RawTransaction::new(vec![0x02, 0xf8, 0x70, 0x01])
    }

    async fn transport_with(records: Vec<PendingTxRecord>, start_block: u64) -> MockTransport {
        let transport = MockTransport::new(start_block)
            .with_session(records.iter().map(|record| MockEvent::Hash(record.hash)).collect());
        for record in records {
            transport.insert_record(record).await;
        }
        transport
    }

    fn racer(
        transport: Arc<MockTransport>,
        relay: Arc<MockRelayClient>,
        settings: RacerSettings,
        cancel: CancellationToken,
    ) -> BundleRacer {
        BundleRacer::new("presale", rule(), transport, relay, follower(), settings, watcher_settings(), cancel)
    }

    #[tokio::test]
    async fn test_happy_path_included() {
        let rule = rule();
        let (record, owner_raw) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(MockRelayClient::new().include_after_polls(2));

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Included);
        assert_eq!(outcome.target_block, Some(101));
        assert!(outcome.bundle_hash.is_some());
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.history,
            vec![
                RaceState::Idle,
                RaceState::Watching,
                RaceState::Matched,
                RaceState::Reconstructing,
                RaceState::Submitting,
                RaceState::Polling,
                RaceState::Included,
            ]
        );

        let bundles = relay.submitted_bundles().await;
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].transactions(), &[owner_raw, follower()]);
        assert_eq!(bundles[0].target_block(), 101);
        assert_eq!(relay.stats_calls(), 2);
    }

    #[tokio::test]
    async fn test_incomplete_record_is_skipped() {
        let rule = rule();
        let (mut broken, _) = owner_record(&rule, 0, rule.function_selector);
        broken.r = None;
        let (valid, owner_raw) = owner_record(&rule, 1, rule.function_selector);

        let transport = Arc::new(transport_with(vec![broken, valid], 100).await);
        let relay = Arc::new(MockRelayClient::new().include_after_polls(1));

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Included);
        assert_eq!(outcome.skipped_records, 1);
        let bundles = relay.submitted_bundles().await;
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].transactions()[0], owner_raw);
        assert!(outcome
            .history
            .windows(2)
            .any(|pair| pair == [RaceState::Reconstructing, RaceState::Watching]));
    }

    #[tokio::test]
    async fn test_retries_after_relay_unavailable() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(
            MockRelayClient::new()
                .fail_next_submit(RacerError::RelayUnavailable("503 Service Unavailable".into()))
                .include_after_polls(1),
        );

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Included);
        assert_eq!(relay.submit_calls(), 2);
        // 두 번째 제출은 현재 블록 + 2 를 노린다
        assert_eq!(outcome.target_block, Some(102));
        assert_eq!(outcome.submissions.len(), 1);
    }

    #[tokio::test]
    async fn test_expires_after_retry_budget() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await.auto_advancing());
        let relay = Arc::new(MockRelayClient::new());

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Expired);
        assert_eq!(relay.submit_calls(), 3);

        let targets: Vec<u64> = relay
            .submitted_bundles()
            .await
            .iter()
            .map(Bundle::target_block)
            .collect();
        assert_eq!(targets.len(), 3);
        assert!(targets.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(outcome.target_block, targets.last().copied());

        // 시도별 만료는 기록되지 않고 종료 상태는 마지막에 한 번만 나온다
        assert_eq!(outcome.history.iter().filter(|state| state.is_terminal()).count(), 1);
        assert_eq!(outcome.history.last(), Some(&RaceState::Expired));
        assert_eq!(
            outcome.history.iter().filter(|state| **state == RaceState::Submitting).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_exhausted_submissions_fail_with_last_cause() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(
            MockRelayClient::new()
                .fail_next_submit(RacerError::RelayUnavailable("down".into()))
                .fail_next_submit(RacerError::RelayUnavailable("down".into()))
                .fail_next_submit(RacerError::RelayRejected("bundle rejected".into())),
        );

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Failed);
        assert_eq!(relay.submit_calls(), 3);
        let error = outcome.error.unwrap();
        assert!(error.contains("race exhausted after 3"));
        assert!(error.contains("bundle rejected"));
        assert!(outcome.bundle_hash.is_none());
    }

    #[tokio::test]
    async fn test_selector_mismatch_never_submits() {
        let rule = rule();
        let other = selector_from_signature("setBaseURI(string)");
        let (record, _) = owner_record(&rule, 0, other);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(MockRelayClient::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(racer(transport.clone(), relay.clone(), settings(), cancel.clone()).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.submit_calls(), 0);
        assert_eq!(transport.lookup_calls(), 1);

        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state, RaceState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("race cancelled"));
        assert_eq!(relay.submit_calls(), 0);
        assert!(!outcome.history.contains(&RaceState::Matched));
    }

    #[tokio::test]
    async fn test_cancel_while_polling() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(MockRelayClient::new());
        let cancel = CancellationToken::new();

        let mut slow_polls = settings();
        slow_polls.poll_interval = Duration::from_millis(20);
        let handle = tokio::spawn(racer(transport, relay.clone(), slow_polls, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.state, RaceState::Failed);
        assert_eq!(outcome.error.as_deref(), Some("race cancelled"));
        assert_eq!(relay.submit_calls(), 1);
        assert!(outcome.bundle_hash.is_some());
        assert!(outcome.history.contains(&RaceState::Polling));
    }

    #[tokio::test]
    async fn test_follower_only_skips_reconstruction() {
        let rule = rule();
        // 서명 필드가 전혀 없는 레코드라도 팔로워 단독 모드에서는 문제없다
        let record = test_record(rule.from, Some(rule.to), &rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(MockRelayClient::new().include_after_polls(1));

        let mut follower_only = settings();
        follower_only.bundle_mode = BundleMode::FollowerOnly;
        let outcome = racer(transport, relay.clone(), follower_only, CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Included);
        assert!(!outcome.history.contains(&RaceState::Reconstructing));
        let bundles = relay.submitted_bundles().await;
        assert_eq!(bundles[0].transactions(), &[follower()]);
    }

    #[tokio::test]
    async fn test_simulation_failure_consumes_attempt() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(
            MockRelayClient::new()
                .with_stats(vec![Ok(BundleStatus::SimulationFailed("nonce too low".into()))])
                .include_after_polls(1),
        );

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;

        assert_eq!(outcome.state, RaceState::Included);
        assert_eq!(relay.submit_calls(), 2);
        assert_eq!(outcome.submissions.len(), 2);
        assert_eq!(outcome.target_block, Some(102));
    }

    #[tokio::test]
    async fn test_transient_stats_errors_are_tolerated() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let relay = Arc::new(
            MockRelayClient::new()
                .with_stats(vec![
                    Err(RacerError::RelayUnavailable("502".into())),
                    Err(RacerError::Timeout("stats".into())),
                    Ok(BundleStatus::Simulated),
                    Ok(BundleStatus::Included),
                ]),
        );

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;
        assert_eq!(outcome.state, RaceState::Included);
        assert_eq!(relay.stats_calls(), 4);
    }

    #[tokio::test]
    async fn test_persistent_stats_errors_fail_the_race() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(transport_with(vec![record], 100).await);
        let errors = (0..MAX_CONSECUTIVE_POLL_ERRORS)
            .map(|_| Err(RacerError::RelayUnavailable("502".into())))
            .collect();
        let relay = Arc::new(MockRelayClient::new().with_stats(errors));

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;
        assert_eq!(outcome.state, RaceState::Failed);
        assert_eq!(relay.submit_calls(), 1);
        assert!(outcome.error.unwrap().contains("relay unavailable"));
    }

    /// 첫 블록 높이 조회만 성공하고 이후로는 계속 실패하는 노드
    struct StalledBlockTransport {
        inner: MockTransport,
        block_calls: AtomicU32,
    }

    #[async_trait]
    impl PendingTxTransport for StalledBlockTransport {
        async fn subscribe(&self, from: Address, to: Address) -> RacerResult<PendingHashStream> {
            self.inner.subscribe(from, to).await
        }

        async fn get_transaction(&self, hash: H256) -> RacerResult<Option<PendingTxRecord>> {
            self.inner.get_transaction(hash).await
        }

        async fn block_number(&self) -> RacerResult<u64> {
            if self.block_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.block_number().await
            } else {
                Err(RacerError::TransientTransport("header not found".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_block_height_failures_end_polling() {
        let rule = rule();
        let (record, _) = owner_record(&rule, 0, rule.function_selector);
        let transport = Arc::new(StalledBlockTransport {
            inner: transport_with(vec![record], 100).await,
            block_calls: AtomicU32::new(0),
        });
        // 릴레이는 계속 정상 응답(Pending)한다
        let relay = Arc::new(MockRelayClient::new());

        let racer = BundleRacer::new(
            "presale",
            rule,
            transport.clone(),
            relay.clone(),
            follower(),
            settings(),
            watcher_settings(),
            CancellationToken::new(),
        );
        let outcome = tokio::time::timeout(Duration::from_secs(2), racer.run())
            .await
            .expect("race must terminate while the node keeps failing");

        assert_eq!(outcome.state, RaceState::Failed);
        assert!(outcome.error.unwrap().contains("header not found"));
        assert_eq!(relay.submit_calls(), 1);
        assert_eq!(relay.stats_calls(), MAX_CONSECUTIVE_POLL_ERRORS);
        assert_eq!(transport.block_calls.load(Ordering::SeqCst), MAX_CONSECUTIVE_POLL_ERRORS + 1);
    }

    #[tokio::test]
    async fn test_watcher_failure_fails_the_race() {
        let transport = Arc::new(
            MockTransport::new(100)
                .with_failed_subscription("refused")
                .with_failed_subscription("refused")
                .with_failed_subscription("refused")
                .with_failed_subscription("refused"),
        );
        let relay = Arc::new(MockRelayClient::new());

        let outcome = racer(transport, relay.clone(), settings(), CancellationToken::new()).run().await;
        assert_eq!(outcome.state, RaceState::Failed);
        assert_eq!(relay.submit_calls(), 0);
        assert_eq!(outcome.history, vec![RaceState::Idle, RaceState::Watching, RaceState::Failed]);
    }

    #[test]
    fn test_settings_from_config() {
        let config = crate::config::Config::default();
        let settings = RacerSettings::from_config(&config.races[0], &config.timeouts);
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.lookahead_blocks, 1);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.submit_timeout, Duration::from_millis(config.timeouts.submit_ms));
    }
}
