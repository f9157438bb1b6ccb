use thiserror::Error;

/// The kind of an [`Error`].
#[derive(Debug, Clone, Copy, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O error occurred while creating, seeking in, or writing the
    /// output file.
    #[error("I/O error writing meta.db")]
    Io,
    /// The model handed to the writer violated one of its invariants (an
    /// unflattened formula leaf, an unresolvable identifier, a top-level
    /// scope that isn't a known placeholder kind, and so on).
    #[error("meta.db model invariant violated")]
    Invariant,
    /// The [`Config`](crate::Config) passed to [`Writer::new`](crate::Writer::new)
    /// could not be honored (for example an output directory that doesn't
    /// exist).
    #[error("invalid meta.db writer configuration")]
    Config,
}

/// The error type returned by this crate.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new `Error` from an [`ErrorKind`], with a source error for
    /// context.
    pub fn new<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            kind,
            source: Some(source.into()),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err)
    }
}

/// A specialized [`Result`] type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_carry_the_io_kind() {
        let io_err = std::io::Error::other("disk full");
        let err: Error = io_err.into();
        matches!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn bare_kind_has_no_source() {
        let err: Error = ErrorKind::Invariant.into();
        assert!(std::error::Error::source(&err).is_none());
    }
}
