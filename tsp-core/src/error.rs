//! Error types for the core crate.

use thiserror::Error;

/// Errors raised by the core data model.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The resident buffer could not be reserved.
    #[error("cannot allocate packet buffer of {requested} bytes: {message}")]
    Allocation { requested: usize, message: String },

    /// The requested buffer is too small to hold a single packet slot.
    #[error("buffer size {requested} bytes is below the minimum of {minimum}")]
    BufferTooSmall { requested: usize, minimum: usize },

    /// A packet slice shorter than 188 bytes was presented.
    #[error("truncated TS packet: {0} bytes")]
    PacketTooShort(usize),

    /// Byte 0 of a packet is neither the sync byte nor the drop marker.
    #[error("invalid sync byte 0x{0:02X}")]
    InvalidSyncByte(u8),

    /// A label outside 0..=31 was used.
    #[error("packet label {0} out of range")]
    LabelOutOfRange(usize),

    /// I/O errors from buffer setup.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
