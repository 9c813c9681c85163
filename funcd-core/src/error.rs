/// The platform error taxonomy.
///
/// Every fallible operation in funcd returns one of these variants; the
/// HTTP mapping happens exactly once, in the server's response layer, and
/// the placer consults [`Error::is_placement_retryable`] to decide whether
/// to try the next runner or surface the error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed request or invalid resource.
    Validation(String),
    /// The named resource does not exist.
    NotFound(String),
    /// Unique-key violation on create.
    Conflict(String),
    /// The node is at capacity; a placer may retry elsewhere.
    ResourceUnavailable,
    /// Waited beyond the deadline for a container slot.
    SlotTimeout,
    /// The invocation deadline elapsed before any runner accepted.
    PlacementDeadlineExceeded,
    /// The invocation deadline elapsed while the container was running.
    DeadlineExceeded,
    /// The container failed to start or crashed mid-invocation.
    ContainerError(String),
    /// The container exited non-zero.
    FunctionError { exit_code: i32, details: String },
    /// A data-access upstream failed.
    Upstream(String),
    /// The node is shutting down and refuses new work.
    NodeDraining,
    /// The operation is not supported by this node role.
    Unsupported(&'static str),
    /// Configuration or invariant violation; fatal at startup only.
    Fatal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a placer should move on to the next runner after this error.
    pub fn is_placement_retryable(&self) -> bool {
        matches!(self, Error::ResourceUnavailable | Error::SlotTimeout)
    }

    /// Construct an `Upstream` variant from any error type.
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        Error::Upstream(err.to_string())
    }

    /// Construct a `Fatal` variant from any error type.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Error::Fatal(err.to_string())
    }

    /// Short machine-readable name, used in logs and call records.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not-found",
            Error::Conflict(_) => "conflict",
            Error::ResourceUnavailable => "resource-unavailable",
            Error::SlotTimeout => "slot-timeout",
            Error::PlacementDeadlineExceeded => "placement-deadline-exceeded",
            Error::DeadlineExceeded => "deadline-exceeded",
            Error::ContainerError(_) => "container-error",
            Error::FunctionError { .. } => "function-error",
            Error::Upstream(_) => "upstream",
            Error::NodeDraining => "node-draining",
            Error::Unsupported(_) => "unsupported",
            Error::Fatal(_) => "fatal",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "invalid request: {msg}"),
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::Conflict(what) => write!(f, "{what} already exists"),
            Error::ResourceUnavailable => write!(f, "node at capacity"),
            Error::SlotTimeout => write!(f, "timed out waiting for a container slot"),
            Error::PlacementDeadlineExceeded => {
                write!(f, "deadline elapsed before any runner accepted the call")
            }
            Error::DeadlineExceeded => write!(f, "invocation deadline exceeded"),
            Error::ContainerError(msg) => write!(f, "container error: {msg}"),
            Error::FunctionError { exit_code, details } => {
                write!(f, "function exited with code {exit_code}: {details}")
            }
            Error::Upstream(msg) => write!(f, "upstream error: {msg}"),
            Error::NodeDraining => write!(f, "node is shutting down"),
            Error::Unsupported(op) => write!(f, "{op} is not supported by this node"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
