pub mod reconstructor;
pub mod signer;

pub use reconstructor::RawTransactionReconstructor;
pub use signer::{prepare_follower_transaction, FollowerPlan, TransactionSigner, WalletSigner};
