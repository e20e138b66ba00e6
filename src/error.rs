//! Error type used throughout `lls`.
//!
//! Mirrors the kind-tagged `Error` used by the BFT core this crate grew
//! out of: a small enum of error *kinds*, with an optional boxed source
//! error attached for diagnostics.

use std::error;
use std::fmt;
use std::result;

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The kinds of errors `lls` can report.
///
/// See the crate-level error handling design: `PreconditionViolated`
/// fails fast and is never retried; `TransientRemote` is bubbled up and
/// retried by the caller on the next heartbeat; `Corruption` triggers a
/// forced restore; `Cancelled` means shutdown or an explicit
/// cancellation token fired; `Fatal` means a configuration assertion
/// failed at startup and the process must not proceed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// A precondition was violated; the caller made a mistake that
    /// retrying will not fix.
    PreconditionViolated,
    /// A remote call to the global store, central storage, or event
    /// store failed in a way that may succeed if retried.
    TransientRemote,
    /// The content location database reported corruption.
    Corruption,
    /// The operation was cancelled, e.g. during shutdown.
    Cancelled,
    /// A fatal configuration or startup assertion failed.
    Fatal,
}

/// Extension of the standard library's `Result` type, used to wrap its
/// error in an `lls::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Like `ResultWrappedExt`, but drops the underlying error, useful when
/// it doesn't implement `Send + Sync`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::message(kind, msg))
    }
}

enum ErrorInner {
    Simple(ErrorKind),
    Message(ErrorKind, String),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

impl Error {
    /// Returns an error not wrapping another error, with the given kind.
    pub fn simple(kind: ErrorKind) -> Self {
        Error {
            inner: ErrorInner::Simple(kind),
        }
    }

    /// Returns an error carrying a plain message, with the given kind.
    pub fn message(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::Message(kind, msg.into()),
        }
    }

    /// Wraps an arbitrary error in an `Error`, with the given kind.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error {
            inner: ErrorInner::Wrapped(kind, e.into()),
        }
    }

    /// Returns this error's kind.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Message(k, _) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Returns true if this error should trigger a retry on the next
    /// background cycle rather than being surfaced as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransientRemote)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Message(k, m) => write!(f, "{:?}: {}", k, m),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrapped(ErrorKind::TransientRemote, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_simple_and_wrapped() {
        let e = Error::simple(ErrorKind::Fatal);
        assert_eq!(e.kind(), ErrorKind::Fatal);

        let e: Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            .wrapped(ErrorKind::TransientRemote);
        assert_eq!(e.unwrap_err().kind(), ErrorKind::TransientRemote);
        assert!(matches!(
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
                .wrapped(ErrorKind::TransientRemote)
                .unwrap_err()
                .kind(),
            ErrorKind::TransientRemote
        ));
    }

    #[test]
    fn is_transient_only_for_transient_remote() {
        assert!(Error::simple(ErrorKind::TransientRemote).is_transient());
        assert!(!Error::simple(ErrorKind::Corruption).is_transient());
    }
}
