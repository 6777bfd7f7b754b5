use crate::LabelType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("data size mismatch: expected {expected} bytes, got {actual}")]
  DimensionMismatch { expected: usize, actual: usize },

  #[error("label {0} not found")]
  LabelNotFound(LabelType),

  #[error("label {0} is already deleted")]
  AlreadyDeleted(LabelType),

  #[error("label {0} is not deleted")]
  NotDeleted(LabelType),

  #[error("index is full (max_elements={max_elements})")]
  CapacityExceeded { max_elements: usize },

  #[error("index is empty")]
  EmptyIndex,

  #[error("corrupt snapshot: {0}")]
  CorruptSnapshot(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("integrity check failed: {0}")]
  Integrity(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
