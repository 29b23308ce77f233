use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::H256;
use ethers::utils::keccak256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::flashbots::bundle::Bundle;
use crate::flashbots::client::RelayClient;
use crate::types::{BundleStats, BundleStatus, BundleSubmissionResult, RacerError, RacerResult};

/// 스크립트 기반 릴레이
///
/// 제출 결과와 상태 조회 결과를 호출 순서대로 돌려준다. 스크립트가 바닥나면
/// 제출은 항상 접수되고, 상태는 `include_after_polls` 에 따라 결정된다.
pub struct MockRelayClient {
    submit_script: Mutex<VecDeque<RacerError>>,
    stats_script: Mutex<VecDeque<RacerResult<BundleStatus>>>,
    include_after_polls: Option<u32>,
    bundle_hashes: Mutex<HashMap<(Vec<H256>, u64), H256>>,
    polls_per_bundle: Mutex<HashMap<H256, u32>>,
    submitted: Mutex<Vec<Bundle>>,
    submit_calls: AtomicU32,
    stats_calls: AtomicU32,
    latency: Duration,
}

impl Default for MockRelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRelayClient {
    pub fn new() -> Self {
        Self {
            submit_script: Mutex::new(VecDeque::new()),
            stats_script: Mutex::new(VecDeque::new()),
            include_after_polls: None,
            bundle_hashes: Mutex::new(HashMap::new()),
            polls_per_bundle: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            submit_calls: AtomicU32::new(0),
            stats_calls: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// 다음 제출을 주어진 에러로 실패시킨다 (여러 번 호출하면 순서대로 적용)
    pub fn fail_next_submit(mut self, error: RacerError) -> Self {
        self.submit_script.get_mut().push_back(error);
        self
    }

    /// 상태 조회 결과를 순서대로 지정
    pub fn with_stats(mut self, results: Vec<RacerResult<BundleStatus>>) -> Self {
        self.stats_script.get_mut().extend(results);
        self
    }

    /// 번들별로 n 번째 조회부터 Included
    pub fn include_after_polls(mut self, polls: u32) -> Self {
        self.include_after_polls = Some(polls);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> u32 {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// 접수된 번들 (제출 순서대로)
    pub async fn submitted_bundles(&self) -> Vec<Bundle> {
        self.submitted.lock().await.clone()
    }

    fn bundle_hash(tx_hashes: &[H256], target_block: u64) -> H256 {
        let mut preimage = Vec::with_capacity(tx_hashes.len() * 32 + 8);
        for hash in tx_hashes {
            preimage.extend_from_slice(hash.as_bytes());
        }
        preimage.extend_from_slice(&target_block.to_be_bytes());
        H256::from(keccak256(preimage))
    }
}

#[async_trait]
impl RelayClient for MockRelayClient {
    async fn submit(&self, bundle: &Bundle) -> RacerResult<BundleSubmissionResult> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(error) = self.submit_script.lock().await.pop_front() {
            warn!("🎭 [MOCK] ❌ 번들 제출 실패 주입 (호출 {}): {}", call, error);
            return Err(error);
        }

        let tx_hashes = bundle.tx_hashes();
        let key = (tx_hashes.clone(), bundle.target_block());
        let mut hashes = self.bundle_hashes.lock().await;
        let bundle_hash = match hashes.get(&key) {
            Some(existing) => {
                debug!("🎭 [MOCK] 중복 제출, 기존 해시 반환: {:?}", existing);
                *existing
            }
            None => {
                let hash = Self::bundle_hash(&tx_hashes, bundle.target_block());
                hashes.insert(key, hash);
                hash
            }
        };
        drop(hashes);

        self.submitted.lock().await.push(bundle.clone());
        info!(
            "🎭 [MOCK] 📤 번들 접수: {:?} (블록 {}, 트랜잭션 {}개)",
            bundle_hash,
            bundle.target_block(),
            tx_hashes.len()
        );

        Ok(BundleSubmissionResult {
            bundle_hash,
            target_block: bundle.target_block(),
            submitted_at: Utc::now(),
        })
    }

    async fn get_stats(&self, bundle_hash: H256, target_block: u64) -> RacerResult<BundleStats> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let polls = {
            let mut polls = self.polls_per_bundle.lock().await;
            let count = polls.entry(bundle_hash).or_insert(0);
            *count += 1;
            *count
        };

        let status = match self.stats_script.lock().await.pop_front() {
            Some(scripted) => scripted?,
            None => match self.include_after_polls {
                Some(threshold) if polls >= threshold => BundleStatus::Included,
                _ => BundleStatus::Pending,
            },
        };
        debug!("🎭 [MOCK] 번들 상태 {:?} (조회 {}): {:?}", bundle_hash, polls, status);

        let mut stats = BundleStats::pending(bundle_hash, target_block);
        stats.is_simulated = matches!(status, BundleStatus::Simulated | BundleStatus::Included);
        stats.status = status;
        Ok(stats)
    }
}
