pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod loop_;
pub mod stats;

pub use config::TrainConfig;
pub use context::{Device, WorkerContext};
pub use error::{Result, WorkerErr};
pub use loop_::{LoopOptions, TrainLoop, TrainSummary};
