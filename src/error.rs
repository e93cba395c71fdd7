use std::io;

/// The error type used in this crate.
///
/// Failures of a single monitored process (unreadable memory, torn
/// descriptors) are handled internally and never surface here; this type
/// only carries failures of the reader itself.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse ELF data: {0}")]
    ElfParse(#[from] object::read::Error),

    #[error("The debug info callback refused a batch of records")]
    CallbackFailed,

    #[error("No debug info callback has been registered")]
    CallbackNotRegistered,
}
