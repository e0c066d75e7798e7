//! Errors raised while setting up a dissemination session.
//!
//! Once a session runs, protocol anomalies never surface as errors: they are
//! logged and dropped.

#[derive(Debug, thiserror::Error)]
pub enum DelugeError {
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object {object_id} is already being disseminated")]
    AlreadyDisseminating { object_id: u8 },
    #[error("object of {size} bytes exceeds the {max}-byte limit")]
    ObjectTooLarge { size: u64, max: u64 },
}
