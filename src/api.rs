//! Remote API boundary for CloudWatch Logs.
//!
//! [`LogsApi`] is the seam between the delivery engine and the service. The
//! production implementation is [`crate::client::CloudWatchLogsClient`]; tests
//! substitute scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::LogEvent;

/// Errors surfaced by the remote API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The append carried a token other than the one the stream expects
    #[error("Invalid sequence token (expected: {})", .expected.as_deref().unwrap_or("none"))]
    InvalidSequenceToken { expected: Option<String> },

    /// The batch was already accepted under the supplied token
    #[error("Batch already accepted (expected: {})", .expected.as_deref().unwrap_or("none"))]
    DataAlreadyAccepted { expected: Option<String> },

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    /// Any other service-reported failure
    #[error("Service error {code} ({status}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    /// Failed to parse response body
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Request(err)
        }
    }
}

impl ApiError {
    /// Build an error from a service error code, as found after the `#` of
    /// the `__type` field.
    pub fn from_service(
        status: u16,
        code: &str,
        message: String,
        expected_sequence_token: Option<String>,
    ) -> Self {
        match code {
            "InvalidSequenceTokenException" => ApiError::InvalidSequenceToken {
                expected: expected_sequence_token,
            },
            "DataAlreadyAcceptedException" => ApiError::DataAlreadyAccepted {
                expected: expected_sequence_token,
            },
            "ResourceAlreadyExistsException" => ApiError::ResourceAlreadyExists(message),
            "ResourceNotFoundException" => ApiError::ResourceNotFound(message),
            "ThrottlingException" => ApiError::Throttled(message),
            _ if status == 429 => ApiError::Throttled(message),
            _ => ApiError::Service {
                status,
                code: code.to_string(),
                message,
            },
        }
    }

    /// Whether the service rejected the append because of a stale token.
    pub fn is_token_conflict(&self) -> bool {
        matches!(
            self,
            ApiError::InvalidSequenceToken { .. } | ApiError::DataAlreadyAccepted { .. }
        )
    }

    /// Token the service expects next, when it reported one.
    pub fn expected_sequence_token(&self) -> Option<&str> {
        match self {
            ApiError::InvalidSequenceToken { expected }
            | ApiError::DataAlreadyAccepted { expected } => {
                expected.as_deref().filter(|token| !token.is_empty())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogGroup {
    pub log_group_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

impl LogGroup {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            log_group_name: name.into(),
            arn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStream {
    pub log_stream_name: String,
}

impl LogStream {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            log_stream_name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogGroupsRequest<'a> {
    pub log_group_name_prefix: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogGroupsResponse {
    #[serde(default)]
    pub log_groups: Vec<LogGroup>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogStreamsRequest<'a> {
    pub log_group_name: &'a str,
    pub log_stream_name_prefix: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeLogStreamsResponse {
    #[serde(default)]
    pub log_streams: Vec<LogStream>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLogStreamRequest<'a> {
    pub log_group_name: &'a str,
    pub log_stream_name: &'a str,
}

/// A single append to a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutLogEventsRequest {
    pub log_group_name: String,
    pub log_stream_name: String,
    pub log_events: Vec<LogEvent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_token: Option<String>,
}

/// Boundary indices of events the service refused from a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedLogEventsInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_log_event_end_index: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub too_old_log_event_end_index: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub too_new_log_event_start_index: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutLogEventsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sequence_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_log_events_info: Option<RejectedLogEventsInfo>,
}

/// Operations the delivery engine needs from CloudWatch Logs.
#[async_trait]
pub trait LogsApi: Send + Sync {
    /// Groups whose name starts with `name_prefix`, sorted by name.
    async fn describe_log_groups(&self, name_prefix: &str) -> Result<Vec<LogGroup>, ApiError>;

    /// Streams in `group` whose name starts with `stream_prefix`, sorted by name.
    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
    ) -> Result<Vec<LogStream>, ApiError>;

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), ApiError>;

    async fn put_log_events(
        &self,
        request: &PutLogEventsRequest,
    ) -> Result<PutLogEventsResponse, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_request_serialization() {
        let request = PutLogEventsRequest {
            log_group_name: "frontend".to_string(),
            log_stream_name: "appStream".to_string(),
            log_events: vec![LogEvent::at(5, "a")],
            sequence_token: None,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["logGroupName"], "frontend");
        assert_eq!(json["logStreamName"], "appStream");
        assert_eq!(json["logEvents"][0]["timestamp"], 5);
        assert!(json.get("sequenceToken").is_none());
    }

    #[test]
    fn test_put_request_with_token() {
        let request = PutLogEventsRequest {
            log_group_name: "g".to_string(),
            log_stream_name: "s".to_string(),
            log_events: vec![],
            sequence_token: Some("T1".to_string()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["sequenceToken"], "T1");
    }

    #[test]
    fn test_put_response_deserialization() {
        let json = r#"{
            "nextSequenceToken": "T2",
            "rejectedLogEventsInfo": {"tooOldLogEventEndIndex": 3}
        }"#;
        let response: PutLogEventsResponse = serde_json::from_str(json).unwrap();

        assert_eq!(response.next_sequence_token.as_deref(), Some("T2"));
        let info = response.rejected_log_events_info.unwrap();
        assert_eq!(info.too_old_log_event_end_index, Some(3));
        assert_eq!(info.expired_log_event_end_index, None);
    }

    #[test]
    fn test_put_response_empty_body() {
        let response: PutLogEventsResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, PutLogEventsResponse::default());
    }

    #[test]
    fn test_describe_responses_tolerate_missing_lists() {
        let groups: DescribeLogGroupsResponse = serde_json::from_str("{}").unwrap();
        assert!(groups.log_groups.is_empty());

        let streams: DescribeLogStreamsResponse =
            serde_json::from_str(r#"{"logStreams":[{"logStreamName":"s","storedBytes":0}]}"#)
                .unwrap();
        assert_eq!(streams.log_streams, vec![LogStream::named("s")]);
    }

    #[test]
    fn test_error_classification() {
        let err = ApiError::from_service(
            400,
            "InvalidSequenceTokenException",
            "bad token".to_string(),
            Some("T9".to_string()),
        );
        assert!(err.is_token_conflict());
        assert_eq!(err.expected_sequence_token(), Some("T9"));

        let err = ApiError::from_service(400, "DataAlreadyAcceptedException", String::new(), None);
        assert!(err.is_token_conflict());
        assert_eq!(err.expected_sequence_token(), None);

        let err = ApiError::from_service(400, "ResourceAlreadyExistsException", "x".into(), None);
        assert!(matches!(err, ApiError::ResourceAlreadyExists(_)));
        assert!(!err.is_token_conflict());

        let err = ApiError::from_service(429, "SomethingElse", "slow down".into(), None);
        assert!(matches!(err, ApiError::Throttled(_)));

        let err = ApiError::from_service(500, "ServiceUnavailableException", "down".into(), None);
        assert!(matches!(err, ApiError::Service { status: 500, .. }));
    }

    #[test]
    fn test_empty_expected_token_is_absent() {
        let err = ApiError::InvalidSequenceToken {
            expected: Some(String::new()),
        };
        assert_eq!(err.expected_sequence_token(), None);
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::InvalidSequenceToken {
            expected: Some("T2".to_string()),
        };
        assert_eq!(format!("{}", err), "Invalid sequence token (expected: T2)");

        let err = ApiError::DataAlreadyAccepted { expected: None };
        assert_eq!(format!("{}", err), "Batch already accepted (expected: none)");

        assert_eq!(format!("{}", ApiError::Timeout), "Request timed out");
    }
}
