use std::backtrace::Backtrace;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BamlErrorKind {
    /// The model answered but the answer did not fit the function's output type.
    Validation,
    /// The provider rejected the request.
    ClientHttp { status: u16 },
    /// The caller passed arguments the function cannot render into a prompt.
    InvalidArgument,
}

impl BamlErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "BamlValidationError",
            Self::ClientHttp { .. } => "BamlClientHttpError",
            Self::InvalidArgument => "BamlInvalidArgumentError",
        }
    }
}

/// Domain error raised by an LLM function.
///
/// `Display` is the bare message so that reported failures carry exactly what
/// the function said. The backtrace is taken where the error is built, so it
/// points at the failing function rather than at whoever reports it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BamlError {
    pub kind: BamlErrorKind,
    pub message: String,
    pub backtrace: String,
}

impl BamlError {
    pub fn new(kind: BamlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(BamlErrorKind::Validation, message)
    }

    pub fn client_http(status: u16, message: impl Into<String>) -> Self {
        Self::new(BamlErrorKind::ClientHttp { status }, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(BamlErrorKind::InvalidArgument, message)
    }
}

// Two errors are the same failure whatever stack they were raised from.
impl PartialEq for BamlError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for BamlError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_bare_message() {
        let e = BamlError::client_http(429, "rate limited");
        assert_eq!(e.to_string(), "rate limited");
        assert_eq!(e.kind.as_str(), "BamlClientHttpError");
        assert_eq!(e.kind, BamlErrorKind::ClientHttp { status: 429 });
    }

    #[inline(never)]
    fn raise_from_here() -> BamlError {
        BamlError::validation("bad output")
    }

    #[test]
    fn backtrace_is_taken_at_construction() {
        let e = raise_from_here();
        assert!(
            e.backtrace.contains("raise_from_here"),
            "backtrace: {}",
            e.backtrace
        );
        // equality ignores where the error came from
        assert_eq!(e, BamlError::validation("bad output"));
    }
}
