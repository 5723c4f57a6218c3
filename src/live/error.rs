// =============================================================================
// VenueError — typed exchange failure with the numeric code retry logic
// branches on
// =============================================================================

use thiserror::Error;

/// Failure from the signed REST client. The venue wraps errors in a
/// `{code, msg}` envelope; transport failures carry no code.
#[derive(Debug, Clone, Error)]
#[error("venue error{}{}: {message}", fmt_code(.code), fmt_status(.http_status))]
pub struct VenueError {
    pub code: Option<i64>,
    pub http_status: Option<u16>,
    pub message: String,
}

fn fmt_code(code: &Option<i64>) -> String {
    code.map(|c| format!(" {c}")).unwrap_or_default()
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (http {s})")).unwrap_or_default()
}

impl VenueError {
    /// Transport-level failure (no response body to pull a code from).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            http_status: None,
            message: message.into(),
        }
    }

    /// Build from an HTTP status plus the response body, extracting the
    /// `{code, msg}` envelope when present.
    pub fn from_response(http_status: u16, body: &serde_json::Value) -> Self {
        let code = body.get("code").and_then(serde_json::Value::as_i64);
        let message = body
            .get("msg")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| body.to_string());
        Self {
            code,
            http_status: Some(http_status),
            message,
        }
    }

    pub fn is_code(&self, code: i64) -> bool {
        self.code == Some(code)
    }

    /// Margin-type change that is already in effect. The venue reports this
    /// as an error but it is an idempotent success.
    pub fn is_margin_noop(&self) -> bool {
        self.is_code(-4046) || self.message.contains("No need to change margin type")
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            code: None,
            http_status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_code_and_message() {
        let err = VenueError::from_response(400, &json!({ "code": -4028, "msg": "Invalid leverage" }));
        assert!(err.is_code(-4028));
        assert_eq!(err.http_status, Some(400));
        assert_eq!(err.message, "Invalid leverage");
    }

    #[test]
    fn body_without_envelope_is_preserved() {
        let err = VenueError::from_response(500, &json!("gateway timeout"));
        assert_eq!(err.code, None);
        assert!(err.message.contains("gateway timeout"));
    }

    #[test]
    fn margin_noop_detection() {
        assert!(VenueError::from_response(400, &json!({ "code": -4046, "msg": "x" })).is_margin_noop());
        assert!(VenueError::from_response(
            400,
            &json!({ "msg": "No need to change margin type." })
        )
        .is_margin_noop());
        assert!(!VenueError::from_response(400, &json!({ "code": -4028, "msg": "x" })).is_margin_noop());
    }

    #[test]
    fn display_includes_code() {
        let err = VenueError::from_response(400, &json!({ "code": -2010, "msg": "would match" }));
        let text = err.to_string();
        assert!(text.contains("-2010"));
        assert!(text.contains("would match"));
    }
}
