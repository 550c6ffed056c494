use std::{error::Error, fmt};

/// The result type used across the training-math modules.
pub type Result<T> = std::result::Result<T, SegErr>;

/// Training-math failures.
#[derive(Debug)]
pub enum SegErr {
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    LabelOutOfRange {
        label: u32,
        classes: usize,
    },
    InvalidSchedule(&'static str),
    InvalidGroup(&'static str),
    InvalidDataset(&'static str),
    InvalidModel(&'static str),
}

impl fmt::Display for SegErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch on {what}: got {got}, expected {expected}"),
            SegErr::LabelOutOfRange { label, classes } => write!(
                f,
                "label {label} is neither a class index below {classes} nor the ignore sentinel"
            ),
            SegErr::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
            SegErr::InvalidGroup(msg) => write!(f, "invalid parameter group: {msg}"),
            SegErr::InvalidDataset(msg) => write!(f, "invalid dataset: {msg}"),
            SegErr::InvalidModel(msg) => write!(f, "invalid model: {msg}"),
        }
    }
}

impl Error for SegErr {}
