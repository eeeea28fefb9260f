use std::borrow::Cow;

/// All `devlink` error kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No codec is registered for a protocol and model pair.
    UnknownModel,
    /// The virtual devices supplied to a codec do not match the ones it
    /// requires.
    BindingMismatch,
    /// A payload cannot be decoded.
    DecodeFailure,
    /// A property cannot be commanded.
    UnsupportedOperation,
    /// A command cannot be published on the transport.
    PublishFailure,
    /// A value does not have the type expected by a property.
    InvalidValue,
    /// A processor has failed.
    Processor,
    /// A configuration is invalid.
    Config,
    /// The transport has reported an error.
    Transport,
}

impl ErrorKind {
    pub(crate) const fn description(self) -> &'static str {
        match self {
            Self::UnknownModel => "Unknown Model",
            Self::BindingMismatch => "Binding Mismatch",
            Self::DecodeFailure => "Decode Failure",
            Self::UnsupportedOperation => "Unsupported Operation",
            Self::PublishFailure => "Publish Failure",
            Self::InvalidValue => "Invalid Value",
            Self::Processor => "Processor",
            Self::Config => "Configuration",
            Self::Transport => "Transport",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.description().fmt(f)
    }
}

/// A `devlink` error.
#[derive(Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error().fmt(f)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::DecodeFailure, format!("Json error caused by {e}"))
    }
}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn unsupported(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, description)
    }

    pub(crate) fn decode(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::DecodeFailure, description)
    }

    pub(crate) fn binding(description: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::BindingMismatch, description)
    }

    fn error(&self) -> String {
        format!("{}: {}", self.kind, self.description)
    }
}

/// A specialized [`Result`] type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
