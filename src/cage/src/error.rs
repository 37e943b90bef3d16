use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;

/// Stable error codes, also mirrored in the process-wide last-error slot.
pub const ERR_NOMEM: i32 = -1;
pub const ERR_NOSPACE: i32 = -2;
pub const ERR_CANNOT_MAP: i32 = -3;
pub const ERR_INVALID_ELF: i32 = -4;
pub const ERR_VERIFY: i32 = -5;
pub const ERR_INVALID_GAS: i32 = -6;
pub const ERR_CONFIG: i32 = -7;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    Nomem,
    #[error("no free sandbox slot")]
    NoSpace,
    #[error("cannot map: {0}")]
    CannotMap(Errno),
    #[error("invalid ELF image: {0}")]
    InvalidElf(&'static str),
    #[error("code verification failed")]
    Verify,
    #[error("gas metering is not supported on this architecture")]
    InvalidGas,
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::Nomem => ERR_NOMEM,
            Error::NoSpace => ERR_NOSPACE,
            Error::CannotMap(_) => ERR_CANNOT_MAP,
            Error::InvalidElf(_) => ERR_INVALID_ELF,
            Error::Verify => ERR_VERIFY,
            Error::InvalidGas => ERR_INVALID_GAS,
            Error::Config(_) => ERR_CONFIG,
        }
    }
}

impl From<boxmap::Error> for Error {
    fn from(e: boxmap::Error) -> Self {
        match e {
            boxmap::Error::Reserve(_) => Error::Nomem,
            boxmap::Error::NoSpace => Error::NoSpace,
            boxmap::Error::SizeMismatch { .. } => Error::Config("sandbox slot size mismatch"),
        }
    }
}

impl From<memtab::Error> for Error {
    fn from(e: memtab::Error) -> Self {
        match e {
            memtab::Error::NoSpace => Error::Nomem,
            memtab::Error::OutOfRange { .. }
            | memtab::Error::Misaligned
            | memtab::Error::EmptyRange => Error::CannotMap(Errno::EINVAL),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

static LAST_ERROR: AtomicI32 = AtomicI32::new(0);

/// Stable code of the most recent failure, 0 if none. Diagnostic only; the
/// authoritative error is the one returned by the failing call.
pub fn last_error() -> i32 {
    LAST_ERROR.load(Ordering::Relaxed)
}

/// Record `e` in the last-error slot on the way out of a failing operation.
pub(crate) fn seterr(e: Error) -> Error {
    LAST_ERROR.store(e.code(), Ordering::Relaxed);
    e
}
