//! Request/response chat types.

use serde::{Deserialize, Serialize};

/// Scheduling lane for a request.
///
/// Lower lanes are served after higher ones, but the dispatcher's starvation
/// threshold still promotes any request that has waited too long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// One-shot chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub input_text: String,
    /// Per-request deadline in milliseconds, measured from submission.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl ChatRequest {
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            deadline_ms: None,
            priority: None,
        }
    }
}

/// One-shot chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub request_id: u64,
    /// Time the request spent queued before a worker picked it up.
    #[serde(default)]
    pub queued_ms: u64,
}

/// JSON error envelope returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    /// Whether resubmitting the same request later may succeed.
    #[serde(default)]
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_minimal() {
        let request: ChatRequest = serde_json::from_str(r#"{"input_text": "hello"}"#).unwrap();
        assert_eq!(request.input_text, "hello");
        assert!(request.deadline_ms.is_none());
        assert!(request.priority.is_none());
    }

    #[test]
    fn test_chat_request_with_options() {
        let json = r#"{"input_text": "hi", "deadline_ms": 250, "priority": "low"}"#;
        let request: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.deadline_ms, Some(250));
        assert_eq!(request.priority, Some(Priority::Low));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_error_body_type_field() {
        let body = ErrorBody {
            error: ErrorDetail {
                error_type: "queue_full".to_string(),
                message: "Queue is full".to_string(),
                retryable: true,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["type"], "queue_full");
        assert_eq!(json["error"]["retryable"], true);
    }
}
