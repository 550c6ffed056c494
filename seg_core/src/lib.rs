mod dataset;
mod error;
mod loss;
mod model;
mod optimizer;
mod schedule;

pub use dataset::{Batch, Loader, SyntheticLoader};
pub use error::{Result, SegErr};
pub use loss::{IGNORE_LABEL, OhemCrossEntropy};
pub use model::{GroupSpec, NamedTensor, PixelClassifier, SegModel};
pub use optimizer::{GroupSettings, Optimizer};
pub use schedule::LrSchedule;
