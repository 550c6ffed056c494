mod error;
mod group;
pub mod msg;

pub use error::{CollectiveErr, Result};
pub use group::{GroupConfig, ProcessGroup};
