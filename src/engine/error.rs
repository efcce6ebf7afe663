use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidInput(String),
    OutOfHours,
    Unavailable(String),
    Forbidden,
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }

    /// Short label for the rejection-reason metric.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::OutOfHours => "out_of_hours",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Forbidden => "forbidden",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::OutOfHours => {
                write!(f, "requested time is outside the restaurant's operating hours")
            }
            EngineError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            EngineError::Forbidden => write!(f, "not allowed to modify this reservation"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            // Backend trouble rejects the operation rather than half-applying it.
            StoreError::Io(msg) => EngineError::Unavailable(format!("storage failure: {msg}")),
        }
    }
}
