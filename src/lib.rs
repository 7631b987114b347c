pub mod archiver;
pub mod chain;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod ingest;
pub mod merge;
pub mod registry;
pub mod responder;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod tokenizer;
pub mod weighted;

pub use chain::{Chain, Edge, Parent};
pub use config::{EngineConfig, IntervalUnit};
pub use engine::{Engine, WriteReport};
pub use error::*;
pub use generator::{Instructions, Method};
pub use responder::{ResponseError, RetryPolicy};
pub use stats::StatsSnapshot;
