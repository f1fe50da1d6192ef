use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    BodyTooLarge,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::BodyTooLarge => "body_too_large",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    InvalidHeaderName,
    InvalidHeaderValue,
    DuplicateRequest,
    NetworkUnreachable,
    Transport,
    Timeout,
    Cancelled,
    HttpStatus,
    Domain,
    Decode,
    RecoveryFailed,
    RecoveryNotConfigured,
    DeferralLimitExceeded,
    TransportInit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::DuplicateRequest => "duplicate_request",
            Self::NetworkUnreachable => "network_unreachable",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::HttpStatus => "http_status",
            Self::Domain => "domain",
            Self::Decode => "decode",
            Self::RecoveryFailed => "recovery_failed",
            Self::RecoveryNotConfigured => "recovery_not_configured",
            Self::DeferralLimitExceeded => "deferral_limit_exceeded",
            Self::TransportInit => "transport_init",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("duplicate request rejected for {method} {uri}")]
    DuplicateRequest { method: Method, uri: String },
    #[error("network unreachable for {method} {uri}: {message}")]
    NetworkUnreachable {
        method: Method,
        uri: String,
        message: String,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("request cancelled: {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("domain error {code}: {message}")]
    Domain { code: String, message: String },
    #[error("failed to decode response envelope: {source}; body={body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("credential recovery failed: {message}")]
    RecoveryFailed { message: String },
    #[error("request deferred for {method} {uri} but no recovery action is configured")]
    RecoveryNotConfigured { method: Method, uri: String },
    #[error("deferral limit exceeded ({limit}) for {method} {uri}")]
    DeferralLimitExceeded {
        limit: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to initialize http transport: {message}")]
    TransportInit { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::DuplicateRequest { .. } => ErrorCode::DuplicateRequest,
            Self::NetworkUnreachable { .. } => ErrorCode::NetworkUnreachable,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Domain { .. } => ErrorCode::Domain,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::RecoveryFailed { .. } => ErrorCode::RecoveryFailed,
            Self::RecoveryNotConfigured { .. } => ErrorCode::RecoveryNotConfigured,
            Self::DeferralLimitExceeded { .. } => ErrorCode::DeferralLimitExceeded,
            Self::TransportInit { .. } => ErrorCode::TransportInit,
        }
    }

    /// Domain code carried by the error, when the server (or the envelope codec)
    /// produced one.
    pub fn domain_code(&self) -> Option<&str> {
        match self {
            Self::Domain { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
