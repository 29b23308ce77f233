pub mod bundle;
pub mod client;

pub use bundle::{Bundle, BundleBuilder, SendBundleParams};
pub use client::{create_flashbots_signature, is_bundle_in_block, FlashbotsRelayClient, RelayClient};
