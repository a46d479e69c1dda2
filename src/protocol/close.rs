//! Close codes and close events.
//!
//! Every fatal protocol condition is reported by closing the socket with one
//! of the codes below. Codes in the `1xxx` range belong to the transport
//! itself; `4xxx` codes are defined by the subscription protocol.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Largest close reason, in bytes, that fits in a single control frame.
///
/// A close frame carries at most 125 payload bytes, two of which hold the
/// status code.
pub const MAX_CLOSE_REASON_LEN: usize = 123;

// ============================================================================
// CloseCode
// ============================================================================

/// Close codes used by the protocol and the transports carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Orderly shutdown, e.g. lazy close or dispose.
    NormalClosure = 1000,
    /// Endpoint is going away (server shutdown).
    GoingAway = 1001,
    /// No status code was present in the close frame.
    NoStatus = 1005,
    /// Connection dropped without a close frame.
    Abnormal = 1006,
    /// The client received a message it cannot understand.
    BadResponse = 4004,
    /// The client hit an internal failure.
    InternalClientError = 4005,
    /// The server received a malformed or unexpected message.
    BadRequest = 4400,
    /// An operation was requested before the handshake completed.
    Unauthorized = 4401,
    /// The connection init hook rejected the handshake.
    Forbidden = 4403,
    /// The transport negotiated an unsupported subprotocol.
    SubprotocolNotAcceptable = 4406,
    /// No `connection_init` arrived in time.
    ConnectionInitialisationTimeout = 4408,
    /// A `subscribe` reused the id of a live operation.
    SubscriberAlreadyExists = 4409,
    /// More than one `connection_init` was received.
    TooManyInitialisationRequests = 4429,
    /// Synthesized by the client on `terminate()`.
    Terminated = 4499,
    /// The server hit an internal failure.
    InternalServerError = 4500,
    /// No `connection_ack` arrived in time.
    ConnectionAcknowledgementTimeout = 4504,
}

impl CloseCode {
    const ALL: [Self; 16] = [
        Self::NormalClosure,
        Self::GoingAway,
        Self::NoStatus,
        Self::Abnormal,
        Self::BadResponse,
        Self::InternalClientError,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::SubprotocolNotAcceptable,
        Self::ConnectionInitialisationTimeout,
        Self::SubscriberAlreadyExists,
        Self::TooManyInitialisationRequests,
        Self::Terminated,
        Self::InternalServerError,
        Self::ConnectionAcknowledgementTimeout,
    ];

    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a known close code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|known| known.code() == code)
    }

    /// Returns the canonical close reason for this code.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::NormalClosure => "Normal Closure",
            Self::GoingAway => "Going away",
            Self::NoStatus => "",
            Self::Abnormal => "timeout",
            Self::BadResponse => "Bad response",
            Self::InternalClientError => "Internal client error",
            Self::BadRequest => "Bad request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::SubprotocolNotAcceptable => "Subprotocol not acceptable",
            Self::ConnectionInitialisationTimeout => "Connection initialisation timeout",
            Self::SubscriberAlreadyExists => "Subscriber already exists",
            Self::TooManyInitialisationRequests => "Too many initialisation requests",
            Self::Terminated => "Terminated",
            Self::InternalServerError => "Internal server error",
            Self::ConnectionAcknowledgementTimeout => "Connection acknowledgement timeout",
        }
    }
}

impl From<CloseCode> for u16 {
    #[inline]
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

// ============================================================================
// Close code classification
// ============================================================================

/// Returns `true` for transport-level codes that indicate an unrecoverable
/// failure of the connection itself.
///
/// Normal, going-away, no-status, abnormal and the "try again later" family
/// (1012–1014) are recoverable; every other `1xxx` code is not.
#[must_use]
pub fn is_fatal_internal_close_code(code: u16) -> bool {
    if matches!(code, 1000 | 1001 | 1005 | 1006 | 1012 | 1013 | 1014) {
        return false;
    }
    (1000..=1999).contains(&code)
}

/// Returns `true` for protocol codes that are reported to subscribers
/// immediately and never retried.
#[must_use]
pub fn is_terminal_protocol_close_code(code: u16) -> bool {
    matches!(
        CloseCode::from_code(code),
        Some(
            CloseCode::InternalServerError
                | CloseCode::InternalClientError
                | CloseCode::BadRequest
                | CloseCode::BadResponse
                | CloseCode::Unauthorized
                | CloseCode::SubprotocolNotAcceptable
                | CloseCode::SubscriberAlreadyExists
                | CloseCode::TooManyInitialisationRequests
        )
    )
}

/// Bounds a close reason to one control frame.
///
/// Reasons that do not fit are replaced with `when_too_long` rather than
/// cut, since a truncated message can be misleading.
#[must_use]
pub fn limit_close_reason(reason: &str, when_too_long: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        reason.to_owned()
    } else {
        when_too_long.to_owned()
    }
}

// ============================================================================
// CloseEvent
// ============================================================================

/// A socket close as observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
    /// Whether the close handshake completed.
    pub was_clean: bool,
}

impl CloseEvent {
    /// Creates a clean close event.
    #[inline]
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// Creates a close event for a connection that dropped without a handshake.
    #[inline]
    #[must_use]
    pub fn unclean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Creates the event the client synthesizes on `terminate()`.
    #[inline]
    #[must_use]
    pub fn terminated() -> Self {
        Self::unclean(CloseCode::Terminated.code(), CloseCode::Terminated.reason())
    }

    /// Returns the known close code, if any.
    #[inline]
    #[must_use]
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_code(self.code)
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        assert_eq!(CloseCode::from_code(4409), Some(CloseCode::SubscriberAlreadyExists));
        assert_eq!(CloseCode::from_code(4444), None);
        assert_eq!(u16::from(CloseCode::Terminated), 4499);
    }

    #[test]
    fn test_fatal_internal_codes() {
        assert!(!is_fatal_internal_close_code(1000));
        assert!(!is_fatal_internal_close_code(1006));
        assert!(!is_fatal_internal_close_code(1013));
        assert!(is_fatal_internal_close_code(1002));
        assert!(is_fatal_internal_close_code(1011));
        assert!(!is_fatal_internal_close_code(4400));
    }

    #[test]
    fn test_terminal_protocol_codes() {
        assert!(is_terminal_protocol_close_code(4400));
        assert!(is_terminal_protocol_close_code(4409));
        assert!(!is_terminal_protocol_close_code(4408));
        assert!(!is_terminal_protocol_close_code(4499));
        assert!(!is_terminal_protocol_close_code(1005));
    }

    #[test]
    fn test_limit_close_reason() {
        assert_eq!(limit_close_reason("short", "fallback"), "short");

        let exact = "a".repeat(MAX_CLOSE_REASON_LEN);
        assert_eq!(limit_close_reason(&exact, "fallback"), exact);

        let long = "a".repeat(MAX_CLOSE_REASON_LEN + 1);
        assert_eq!(limit_close_reason(&long, "fallback"), "fallback");
    }

    #[test]
    fn test_limit_counts_bytes_not_chars() {
        // 62 two-byte chars = 124 bytes
        let wide = "é".repeat(62);
        assert_eq!(limit_close_reason(&wide, "fallback"), "fallback");
    }

    #[test]
    fn test_terminated_event() {
        let event = CloseEvent::terminated();
        assert_eq!(event.code, 4499);
        assert_eq!(event.reason, "Terminated");
        assert!(!event.was_clean);
    }
}
