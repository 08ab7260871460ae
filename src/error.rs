use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by every component. Only the kind decides how a
/// failure is handled; the message is for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsErrorKind {
    /// Credential rejection. Never retried, halts the instance.
    AuthError,
    /// Vendor throttling. Retried with backoff.
    RateLimit,
    /// Transient transport fault, including bounded-read timeouts.
    Network,
    /// Vendor rejected the request itself (bad text, unsupported voice...).
    VendorBusiness,
    Unknown,
}

impl TtsErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TtsErrorKind::RateLimit | TtsErrorKind::Network)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TtsErrorKind::AuthError)
    }
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("vendor error {code}: {message}")]
    Vendor { code: i64, message: String },
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl TtsError {
    pub fn kind(&self) -> TtsErrorKind {
        match self {
            TtsError::Auth(_) => TtsErrorKind::AuthError,
            TtsError::RateLimit(_) => TtsErrorKind::RateLimit,
            TtsError::Network(_) => TtsErrorKind::Network,
            TtsError::Vendor { .. } => TtsErrorKind::VendorBusiness,
            TtsError::Unknown(_) => TtsErrorKind::Unknown,
        }
    }

    /// Map a vendor response code onto the taxonomy. Vendors reuse HTTP
    /// status conventions in their body codes often enough that this single
    /// mapping covers the wire formats the strategies speak; anything
    /// unrecognized stays Unknown rather than guessing.
    pub fn from_vendor_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => TtsError::Auth(message),
            429 => TtsError::RateLimit(message),
            code if (500..600).contains(&code) => TtsError::Network(message),
            code if (400..500).contains(&code) => TtsError::Vendor { code, message },
            _ => TtsError::Vendor { code, message },
        }
    }

    pub fn from_http_status(status: http::StatusCode, message: impl Into<String>) -> Self {
        Self::from_vendor_code(status.as_u16() as i64, message)
    }

    /// Classify an error propagated through anyhow. Transport-library errors
    /// that never went through the taxonomy count as network faults.
    pub fn classify(err: &anyhow::Error) -> TtsErrorKind {
        if let Some(e) = err.downcast_ref::<TtsError>() {
            return e.kind();
        }
        if err
            .downcast_ref::<tokio_tungstenite::tungstenite::Error>()
            .is_some()
        {
            return TtsErrorKind::Network;
        }
        if let Some(e) = err.downcast_ref::<reqwest::Error>() {
            if let Some(status) = e.status() {
                return Self::from_http_status(status, e.to_string()).kind();
            }
            if e.is_timeout() || e.is_connect() || e.is_request() {
                return TtsErrorKind::Network;
            }
        }
        if err.downcast_ref::<std::io::Error>().is_some() {
            return TtsErrorKind::Network;
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return TtsErrorKind::Network;
        }
        TtsErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_vendor_code_mapping() {
        assert_eq!(
            TtsError::from_vendor_code(401, "bad key").kind(),
            TtsErrorKind::AuthError
        );
        assert_eq!(
            TtsError::from_vendor_code(403, "forbidden").kind(),
            TtsErrorKind::AuthError
        );
        assert_eq!(
            TtsError::from_vendor_code(429, "slow down").kind(),
            TtsErrorKind::RateLimit
        );
        assert_eq!(
            TtsError::from_vendor_code(503, "unavailable").kind(),
            TtsErrorKind::Network
        );
        assert_eq!(
            TtsError::from_vendor_code(400, "bad voice").kind(),
            TtsErrorKind::VendorBusiness
        );
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(TtsErrorKind::Network.is_retryable());
        assert!(TtsErrorKind::RateLimit.is_retryable());
        assert!(!TtsErrorKind::AuthError.is_retryable());
        assert!(!TtsErrorKind::VendorBusiness.is_retryable());
        assert!(!TtsErrorKind::Unknown.is_retryable());
        assert!(TtsErrorKind::AuthError.is_fatal());
        assert!(!TtsErrorKind::Network.is_fatal());
    }

    #[test]
    fn test_classify_taxonomy_and_foreign_errors() {
        let auth: anyhow::Error = TtsError::Auth("expired".to_string()).into();
        assert_eq!(TtsError::classify(&auth), TtsErrorKind::AuthError);

        let io: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(TtsError::classify(&io), TtsErrorKind::Network);

        let other = anyhow!("something else entirely");
        assert_eq!(TtsError::classify(&other), TtsErrorKind::Unknown);
    }
}
