use std::fmt::{Display, Formatter};
use std::io;

/// Errors that occur inside the driver loops are not propagated as `Result` to the
///  application - there is no caller to propagate them to. They are reported through the
///  `on_error` callback of the owning service, server, session or client instead, as a
///  (code, category, message) triple.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorInfo {
    /// OS error code where one exists, -1 otherwise
    pub code: i32,
    pub category: &'static str,
    pub message: String,
}

pub const CATEGORY_SYSTEM: &str = "system";
pub const CATEGORY_TLS: &str = "tls";
pub const CATEGORY_WEBSOCKET: &str = "websocket";
pub const CATEGORY_FRAMING: &str = "framing";

impl ErrorInfo {
    pub fn new(code: i32, category: &'static str, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            code,
            category,
            message: message.into(),
        }
    }

    pub fn from_io(e: &io::Error) -> ErrorInfo {
        ErrorInfo {
            code: e.raw_os_error().unwrap_or(-1),
            category: CATEGORY_SYSTEM,
            message: e.to_string(),
        }
    }

    pub fn tls(message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::new(-1, CATEGORY_TLS, message)
    }

    pub fn websocket(message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::new(-1, CATEGORY_WEBSOCKET, message)
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

/// Transient errors are retried by the driver loops and never surfaced to the application.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_without_os_code() {
        let e = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let info = ErrorInfo::from_io(&e);
        assert_eq!(info.code, -1);
        assert_eq!(info.category, CATEGORY_SYSTEM);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
