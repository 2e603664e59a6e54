use itertools::Itertools;

use std::error;
use std::fmt;
use std::fmt::Display;

use crate::results::ActionKind;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum ErrorType {
    General,
    NotSupported,
    IndexOutOfRange,
    ActionNotRegistered,
    AuthenticationError,
    Cancelled,
    PollLimitExceeded,
    RemoteCallError,
    ParameterError,
    ParseError,
    SerializationError,
    IoError,
    UnexpectedError,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Error {
    pub error_type: ErrorType,
    pub message: String,
    /// Remote operation or data source operation the error originated from.
    pub operation: Option<String>,
    /// Name of the registered resource the error relates to.
    pub resource: Option<String>,
}

impl Error {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Error {
            error_type,
            message,
            operation: None,
            resource: None,
        }
    }

    pub fn from_error<E: Display>(error_type: ErrorType, error: E) -> Self {
        Error::new(error_type, error.to_string())
    }

    pub fn from_result<T, E: Display>(error_type: ErrorType, result: Result<T, E>) -> Result<T, Self> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(Error::from_error(error_type, e)),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_owned());
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_owned());
        self
    }

    pub fn not_supported(message: String) -> Self {
        Error::new(ErrorType::NotSupported, message)
    }

    pub fn index_out_of_range(index: usize, len: usize) -> Self {
        Error::new(
            ErrorType::IndexOutOfRange,
            format!("Result index out of range: {} (results: {})", index, len),
        )
    }

    pub fn action_not_registered(kind: ActionKind, registered: &[ActionKind]) -> Self {
        Error::new(
            ErrorType::ActionNotRegistered,
            format!(
                "Action '{}' not registered, available actions: {}",
                kind,
                registered.iter().map(|k| format!("'{}'", k)).join(", ")
            ),
        )
    }

    pub fn authentication_error(message: &str) -> Self {
        Error::new(ErrorType::AuthenticationError, message.to_owned())
    }

    pub fn cancelled(what: &str) -> Self {
        Error::new(ErrorType::Cancelled, format!("{} was cancelled", what))
    }

    /// Returns true if the error was produced by a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.error_type == ErrorType::Cancelled
    }

    pub fn poll_limit_exceeded(attempts: u32) -> Self {
        Error::new(
            ErrorType::PollLimitExceeded,
            format!("Terminal status not reached after {} attempts", attempts),
        )
    }

    pub fn remote_call_error(operation: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::RemoteCallError,
            format!("Remote call '{}' failed: {}", operation, message),
        )
        .with_operation(operation)
    }

    pub fn parameter_error(message: String) -> Self {
        Error::new(ErrorType::ParameterError, message)
    }

    pub fn parse_error(what: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::ParseError,
            format!("Failed to parse {}: {}", what, message),
        )
    }

    pub fn serialization_error(what: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::SerializationError,
            format!("Failed to serialize {}: {}", what, message),
        )
    }

    pub fn general_error(message: String) -> Self {
        Error::new(ErrorType::General, message)
    }

    pub fn unexpected_error(message: String) -> Self {
        Error::new(ErrorType::UnexpectedError, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{} (resource '{}')", self.message, resource),
            None => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for Error {}
