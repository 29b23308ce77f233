// Presale Bundle Racer Library

pub mod config;
pub mod core;
pub mod mocks;
pub mod blockchain;
pub mod execution;
pub mod flashbots;
pub mod mempool;

// Core types
pub mod types;
pub mod constants;

// Re-exports for convenience
pub use config::Config;
pub use core::{BundleRacer, RacerSettings};
pub use execution::{RawTransactionReconstructor, TransactionSigner, WalletSigner};
pub use flashbots::{Bundle, BundleBuilder, FlashbotsRelayClient, RelayClient};
pub use mempool::{PendingTransactionWatcher, PendingTxTransport, WatcherSettings};
pub use types::{RaceOutcome, RaceState, RacerError, RacerResult};
