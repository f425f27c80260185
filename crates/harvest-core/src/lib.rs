pub mod admission;
pub mod crawl;
pub mod error;
pub mod fetch_gate;
pub mod job;
pub mod metrics;
pub mod models;
pub mod quality;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use error::AppError;
pub use models::{Manifest, Source, SourceKind, compute_hash};
pub use session::{Pipeline, RunOptions};
pub use traits::{Extractor, ExtractorFactory, Fetcher, Normalizer, RobotsSource, Storage};
