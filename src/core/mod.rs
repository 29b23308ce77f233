pub mod racer;

pub use racer::{BundleRacer, RacerSettings};
