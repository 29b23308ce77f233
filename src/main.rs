use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::U256;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use presale_bundle_racer::blockchain::NodeTransport;
use presale_bundle_racer::config::{Config, RaceConfig};
use presale_bundle_racer::execution::{prepare_follower_transaction, TransactionSigner, WalletSigner};
use presale_bundle_racer::flashbots::{FlashbotsRelayClient, RelayClient};
use presale_bundle_racer::mempool::{PendingTxTransport, WatcherSettings};
use presale_bundle_racer::mocks::{self, MockConfig};
use presale_bundle_racer::types::{RaceOutcome, RaceState, RawTransaction};
use presale_bundle_racer::{BundleRacer, RacerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("presale-bundle-racer")
        .version("0.1.0")
        .about("⚡ 펜딩 트랜잭션 트리거 Flashbots 번들 레이서")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("설정 파일 경로")
                .default_value("config/racer.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("로그 레벨 (trace, debug, info, warn, error), 기본은 설정 파일 값"),
        )
        .arg(
            Arg::new("race")
                .short('r')
                .long("race")
                .value_name("NAME")
                .help("지정한 레이스만 실행 (기본: 전체)"),
        )
        .get_matches();

    dotenvy::dotenv().ok();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/racer.toml");
    let mut config = Config::load(config_path)?;

    let log_filter = config
        .monitoring
        .effective_log_level(matches.get_one::<String>("log-level").map(String::as_str))
        .to_string();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("📋 설정 파일 로드됨: {}", config_path);
    load_environment_variables(&mut config);

    if let Some(name) = matches.get_one::<String>("race") {
        config.races.retain(|race| &race.name == name);
        if config.races.is_empty() {
            return Err(anyhow!("레이스를 찾을 수 없습니다: {}", name));
        }
    }

    if let Err(e) = config.validate() {
        error!("❌ 설정 검증 실패: {}", e);
        std::process::exit(1);
    }
    info!("✅ 설정 로드 완료: 레이스 {}개", config.races.len());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 종료 신호 수신됨, 진행 중인 레이스 취소");
                shutdown.cancel();
            }
            Err(err) => error!("❌ 신호 처리 오류: {}", err),
        }
    });

    let mut races = JoinSet::new();
    if mocks::is_mock_mode() {
        let mock_config = mocks::get_mock_config();
        info!("🎭 [MOCK] 모의 모드로 실행 (chain_id={})", mock_config.chain_id);
        for race in &config.races {
            let racer = build_mock_racer(&config, race, &mock_config, cancel.child_token()).await?;
            races.spawn(racer.run());
        }
    } else {
        for race in &config.races {
            let racer = build_racer(&config, race, cancel.child_token()).await?;
            races.spawn(racer.run());
        }
    }

    let mut missed = 0;
    while let Some(joined) = races.join_next().await {
        match joined {
            Ok(outcome) => {
                if outcome.state != RaceState::Included {
                    missed += 1;
                }
                report_outcome(&outcome);
            }
            Err(e) => {
                missed += 1;
                error!("❌ 레이스 태스크 비정상 종료: {}", e);
            }
        }
    }

    if missed > 0 {
        return Err(anyhow!("{}개 레이스가 포함되지 못했습니다", missed));
    }
    info!("✅ 모든 레이스 완료");
    Ok(())
}

async fn build_racer(config: &Config, race: &RaceConfig, cancel: CancellationToken) -> Result<BundleRacer> {
    let network = &config.network;
    let transport = NodeTransport::new(
        &network.rpc_url,
        &network.ws_url,
        &network.subscription_method,
        network.fetch_raw,
    )?;

    let chain_id = transport.chain_id().await.context("체인 ID 조회 실패")?;
    if chain_id != network.chain_id {
        warn!("⚠️ 설정된 체인 ID {} 와 노드 체인 ID {} 가 다릅니다", network.chain_id, chain_id);
    }

    let follower = &race.follower;
    let follower_tx = if follower.is_presigned() {
        prepare_follower_transaction(follower, None, None, chain_id).await?
    } else {
        let key = follower
            .private_key
            .as_deref()
            .ok_or_else(|| anyhow!("레이스 {}: 팔로워 개인키가 없습니다", race.name))?;
        let signer = WalletSigner::from_private_key(key, chain_id)?;
        let nonce = transport.pending_nonce(signer.address()).await?;
        prepare_follower_transaction(follower, Some(&signer as &dyn TransactionSigner), Some(nonce), chain_id).await?
    };

    let relay = FlashbotsRelayClient::new(
        config.flashbots.relay_url.clone(),
        auth_signer(&config.flashbots.auth_private_key)?,
        Duration::from_millis(config.timeouts.submit_ms),
        transport.provider(),
    )?;

    let transport: Arc<dyn PendingTxTransport> = Arc::new(transport);
    let relay: Arc<dyn RelayClient> = Arc::new(relay);
    assemble(config, race, transport, relay, follower_tx, cancel)
}

async fn build_mock_racer(
    config: &Config,
    race: &RaceConfig,
    mock_config: &MockConfig,
    cancel: CancellationToken,
) -> Result<BundleRacer> {
    let rule = race.trigger_rule()?;
    let (transport, relay) = mocks::mock_race_environment(&rule, mock_config).await?;
    if mock_config.block_time_ms > 0 {
        transport.spawn_block_ticker(Duration::from_millis(mock_config.block_time_ms));
    }

    let wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(mock_config.chain_id);
    let signer = WalletSigner::new(wallet);
    let follower_tx = prepare_follower_transaction(
        &race.follower,
        Some(&signer as &dyn TransactionSigner),
        Some(U256::zero()),
        mock_config.chain_id,
    )
    .await?;

    assemble(config, race, transport, relay, follower_tx, cancel)
}

fn assemble(
    config: &Config,
    race: &RaceConfig,
    transport: Arc<dyn PendingTxTransport>,
    relay: Arc<dyn RelayClient>,
    follower_tx: RawTransaction,
    cancel: CancellationToken,
) -> Result<BundleRacer> {
    Ok(BundleRacer::new(
        race.name.clone(),
        race.trigger_rule()?,
        transport,
        relay,
        follower_tx,
        RacerSettings::from_config(race, &config.timeouts),
        WatcherSettings::from_config(&config.watcher, &config.timeouts),
        cancel,
    ))
}

fn auth_signer(private_key: &str) -> Result<LocalWallet> {
    if private_key.is_empty() {
        warn!("⚠️ Flashbots 인증 키가 없어 임시 키를 생성합니다 (평판 누적 불가)");
        return Ok(LocalWallet::new(&mut rand::thread_rng()));
    }
    private_key
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| anyhow!("Flashbots 인증 키 파싱 실패: {}", e))
}

fn report_outcome(outcome: &RaceOutcome) {
    match outcome.state {
        RaceState::Included => info!(
            "🎉 [{}] 번들 포함: {:?} (블록 {:?}, 제출 {}회)",
            outcome.race,
            outcome.bundle_hash,
            outcome.target_block,
            outcome.submissions.len()
        ),
        RaceState::Expired => warn!(
            "⌛ [{}] 번들 만료: 마지막 대상 블록 {:?}, 제출 {}회",
            outcome.race,
            outcome.target_block,
            outcome.submissions.len()
        ),
        _ => error!(
            "❌ [{}] 레이스 실패: {}",
            outcome.race,
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
    if outcome.skipped_records > 0 {
        info!("  ⏭️ 건너뛴 레코드: {}개", outcome.skipped_records);
    }
}

fn load_environment_variables(config: &mut Config) {
    if let Ok(private_key) = env::var("FOLLOWER_PRIVATE_KEY") {
        for race in config.races.iter_mut().filter(|race| race.follower.private_key.is_none()) {
            race.follower.private_key = Some(private_key.clone());
        }
        info!("🔑 Follower private key loaded from environment");
    }

    if let Ok(auth_key) = env::var("FLASHBOTS_AUTH_KEY") {
        config.flashbots.auth_private_key = auth_key;
        info!("🔑 Flashbots auth key loaded from environment");
    }

    if let Ok(rpc_url) = env::var("RPC_URL") {
        config.network.rpc_url = rpc_url;
        info!("🌐 RPC URL loaded from environment");
    }

    if let Ok(ws_url) = env::var("WS_URL") {
        config.network.ws_url = ws_url;
        info!("🔌 WebSocket URL loaded from environment");
    }

    if let Ok(flashbots_url) = env::var("FLASHBOTS_RELAY_URL") {
        config.flashbots.relay_url = flashbots_url;
        info!("⚡ Flashbots relay URL loaded from environment");
    }
}
