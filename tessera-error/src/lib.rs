//! Error handling for the Tessera storage engine.
//!
//! All fallible Tessera APIs return [`TesseraResult`]. Errors are constructed
//! with the [`tessera_err`] and [`tessera_bail`] macros so that call sites
//! stay terse and the variant taxonomy stays in one place.

use std::borrow::Cow;

use thiserror::Error;

/// An error message string, either borrowed or owned.
pub type ErrString = Cow<'static, str>;

/// The unified error type returned by every fallible Tessera operation.
///
/// Buffer overflow during a read is deliberately *not* represented here: it
/// is a normal signalled state of the read loop, surfaced through
/// `Reader::incomplete`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TesseraError {
    /// A required setter was not called before `init` or `read`.
    #[error("not initialized: {0}")]
    NotInitialized(ErrString),
    /// The named attribute does not exist in the array schema.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(ErrString),
    /// A fixed-size buffer was supplied for a var-sized attribute, or vice
    /// versa.
    #[error("var-length mismatch: {0}")]
    VarLengthMismatch(ErrString),
    /// A subarray range is malformed or falls outside the array domain.
    #[error("invalid range: {0}")]
    InvalidRange(ErrString),
    /// The operation is not defined for the domain's coordinate type.
    #[error("unsupported domain type: {0}")]
    UnsupportedDomainType(ErrString),
    /// A single tile exceeds the configured memory budget.
    #[error("memory budget exceeded: {0}")]
    MemoryBudgetExceeded(ErrString),
    /// A configuration value failed to parse.
    #[error("invalid config: {0}")]
    InvalidConfig(ErrString),
    /// An error surfaced from the storage layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The reverse filter pipeline failed to decode a tile.
    #[error("decode error: {0}")]
    Decode(ErrString),
    /// The query was cancelled through its cancellation token.
    #[error("cancelled")]
    Cancelled,
    /// An internal invariant was violated. Reaching this is a bug.
    #[error("internal error: {0}")]
    Internal(ErrString),
}

/// Convenience alias for `Result<T, TesseraError>`.
pub type TesseraResult<T> = Result<T, TesseraError>;

/// Construct a [`TesseraError`].
///
/// `tessera_err!("...")` produces an `Internal` error; a leading variant
/// name followed by a colon selects the variant:
/// `tessera_err!(InvalidRange: "dimension {} is empty", d)`.
#[macro_export]
macro_rules! tessera_err {
    (Cancelled) => {
        $crate::TesseraError::Cancelled
    };
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::TesseraError::$variant(format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::TesseraError::Internal(format!($fmt $(, $arg)*).into())
    };
}

/// Return early with a [`TesseraError`]. Accepts the same forms as
/// [`tessera_err`].
#[macro_export]
macro_rules! tessera_bail {
    ($($tt:tt)+) => {
        return Err($crate::tessera_err!($($tt)+))
    };
}

/// `expect` with a message, for `Option` and `Result` values whose failure
/// indicates a bug rather than a recoverable error.
pub trait TesseraExpect {
    type Output;

    fn tessera_expect(self, msg: &str) -> Self::Output;
}

impl<T> TesseraExpect for Option<T> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        match self {
            Some(v) => v,
            None => panic!("expected Some: {msg}"),
        }
    }
}

impl<T, E: std::fmt::Display> TesseraExpect for Result<T, E> {
    type Output = T;

    fn tessera_expect(self, msg: &str) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("expected Ok: {msg}: {e}"),
        }
    }
}

/// `unwrap` for results whose error type converts into [`TesseraError`],
/// panicking with the full error display.
pub trait TesseraUnwrap {
    type Output;

    fn tessera_unwrap(self) -> Self::Output;
}

impl<T, E: Into<TesseraError>> TesseraUnwrap for Result<T, E> {
    type Output = T;

    fn tessera_unwrap(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => panic!("unexpected error: {}", e.into()),
        }
    }
}
