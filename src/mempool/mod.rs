pub mod filters;
pub mod watcher;

pub use filters::{format_selector, parse_selector, selector_from_signature};
pub use watcher::{PendingHashStream, PendingTransactionWatcher, PendingTxTransport, WatcherSettings};
