use std::fmt;

/// Reasons a `start()` or background operation could not proceed or continue.
///
/// Mirrors the taxonomy a session surfaces to its caller: construction-time
/// configuration failures, startup preconditions, capture faults (recoverable
/// and otherwise), and the three model failure kinds. Per-packet failures
/// that are absorbed into `DetectionStatistics` never reach this type — see
/// `stats::DetectionStatistics::processing_errors`.
#[derive(Debug, Clone)]
pub enum SynwatchError {
    Configuration { option: String, reason: String },
    NotReady { cause: String },
    UnknownInterface(String),
    CaptureOpenFailed { cause: String },
    CaptureRuntime { cause: String },
    Model(ModelErrorKind),
    Lock(String),
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelErrorKind {
    NotLoaded,
    ShapeMismatch { expected: usize, found: usize },
    BackendError(String),
}

impl fmt::Display for SynwatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynwatchError::Configuration { option, reason } => {
                write!(f, "configuration error in `{}`: {}", option, reason)
            }
            SynwatchError::NotReady { cause } => write!(f, "not ready: {}", cause),
            SynwatchError::UnknownInterface(id) => write!(f, "unknown interface: {}", id),
            SynwatchError::CaptureOpenFailed { cause } => {
                write!(f, "failed to open capture: {}", cause)
            }
            SynwatchError::CaptureRuntime { cause } => {
                write!(f, "capture runtime error: {}", cause)
            }
            SynwatchError::Model(kind) => write!(f, "model error: {}", kind),
            SynwatchError::Lock(msg) => write!(f, "lock error: {}", msg),
            SynwatchError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErrorKind::NotLoaded => write!(f, "no artefact loaded"),
            ModelErrorKind::ShapeMismatch { expected, found } => {
                write!(f, "expected arity {}, found {}", expected, found)
            }
            ModelErrorKind::BackendError(msg) => write!(f, "backend error: {}", msg),
        }
    }
}

impl std::error::Error for SynwatchError {}

impl From<std::io::Error> for SynwatchError {
    fn from(err: std::io::Error) -> Self {
        SynwatchError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SynwatchError {
    fn from(err: toml::de::Error) -> Self {
        SynwatchError::Configuration {
            option: "<file>".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<ctrlc::Error> for SynwatchError {
    fn from(err: ctrlc::Error) -> Self {
        SynwatchError::Io(err.to_string())
    }
}

impl From<Box<dyn std::error::Error>> for SynwatchError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        SynwatchError::Model(ModelErrorKind::BackendError(err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, SynwatchError>;
