use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer overflow: capacity {capacity}, need {need}")]
    BufferOverflow { capacity: usize, need: usize },

    #[error("buffer is full: capacity {capacity}, current length {len}")]
    BufferFull { capacity: usize, len: usize },

    #[error("Invalid user key: {0}")]
    InvalidUserKey(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;
