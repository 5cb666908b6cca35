use std::time::Duration;

use cloudwatch_shipper::api::{ApiError, LogStream, LogsApi, PutLogEventsRequest};
use cloudwatch_shipper::client::CloudWatchLogsClient;
use cloudwatch_shipper::event::LogEvent;
use cloudwatch_shipper::sigv4::Credentials;
use mockito::{Matcher, Server};
use serde_json::json;

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

fn client_for(server: &Server, max_retries: u32) -> CloudWatchLogsClient {
    CloudWatchLogsClient::with_settings(
        &server.url(),
        "us-east-1",
        Credentials::new("AKIDEXAMPLE", "SECRET"),
        Duration::from_secs(5),
        max_retries,
    )
    .expect("failed to create client")
    .with_retry_base_delay(Duration::from_millis(1))
}

fn put_request(token: Option<&str>) -> PutLogEventsRequest {
    PutLogEventsRequest {
        log_group_name: "frontend".to_string(),
        log_stream_name: "appStream".to_string(),
        log_events: vec![LogEvent::at(1_700_000_000_000, "a"), LogEvent::at(1_700_000_000_001, "b")],
        sequence_token: token.map(str::to_string),
    }
}

#[tokio::test]
async fn describe_log_groups_parses_response() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("x-amz-target", "Logs_20140328.DescribeLogGroups")
        .match_header("content-type", CONTENT_TYPE)
        .match_header("authorization", Matcher::Regex("^AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/".into()))
        .match_header("x-amz-date", Matcher::Regex(r"^\d{8}T\d{6}Z$".into()))
        .match_body(Matcher::Json(json!({ "logGroupNamePrefix": "frontend" })))
        .with_status(200)
        .with_header("content-type", CONTENT_TYPE)
        .with_body(
            json!({
                "logGroups": [
                    { "logGroupName": "frontend", "arn": "arn:aws:logs:us-east-1:123:log-group:frontend:*" },
                    { "logGroupName": "frontend-staging" }
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let groups = client.describe_log_groups("frontend").await.unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].log_group_name, "frontend");
    assert!(groups[0].arn.is_some());
    assert_eq!(groups[1].log_group_name, "frontend-staging");
    mock.assert_async().await;
}

#[tokio::test]
async fn describe_log_streams_sends_group_and_prefix() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("x-amz-target", "Logs_20140328.DescribeLogStreams")
        .match_body(Matcher::Json(json!({
            "logGroupName": "frontend",
            "logStreamNamePrefix": "appStream"
        })))
        .with_status(200)
        .with_body(r#"{"logStreams":[{"logStreamName":"appStream","uploadSequenceToken":"T1"}]}"#)
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let streams = client
        .describe_log_streams("frontend", "appStream")
        .await
        .unwrap();

    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0], LogStream::named("appStream"));
    mock.assert_async().await;
}

#[tokio::test]
async fn describe_without_matches_returns_empty() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let client = client_for(&server, 0);
    assert!(client.describe_log_groups("missing").await.unwrap().is_empty());
}

#[tokio::test]
async fn create_log_stream_accepts_empty_body() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("x-amz-target", "Logs_20140328.CreateLogStream")
        .match_body(Matcher::Json(json!({
            "logGroupName": "frontend",
            "logStreamName": "appStream"
        })))
        .with_status(200)
        .with_body("")
        .create_async()
        .await;

    let client = client_for(&server, 0);
    client.create_log_stream("frontend", "appStream").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn create_log_stream_maps_already_exists() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body(
            r#"{"__type":"com.amazonaws.logs#ResourceAlreadyExistsException","message":"The specified log stream already exists"}"#,
        )
        .create_async()
        .await;

    let client = client_for(&server, 3);
    let err = client
        .create_log_stream("frontend", "appStream")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::ResourceAlreadyExists(ref m) if m.contains("already exists")));
}

#[tokio::test]
async fn put_log_events_sends_token_and_returns_next() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_header("x-amz-target", "Logs_20140328.PutLogEvents")
        .match_body(Matcher::Json(json!({
            "logGroupName": "frontend",
            "logStreamName": "appStream",
            "logEvents": [
                { "timestamp": 1_700_000_000_000_i64, "message": "a" },
                { "timestamp": 1_700_000_000_001_i64, "message": "b" }
            ],
            "sequenceToken": "T1"
        })))
        .with_status(200)
        .with_body(r#"{"nextSequenceToken":"T2"}"#)
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let response = client.put_log_events(&put_request(Some("T1"))).await.unwrap();

    assert_eq!(response.next_sequence_token.as_deref(), Some("T2"));
    assert!(response.rejected_log_events_info.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn put_log_events_omits_absent_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .match_body(Matcher::Json(json!({
            "logGroupName": "frontend",
            "logStreamName": "appStream",
            "logEvents": [
                { "timestamp": 1_700_000_000_000_i64, "message": "a" },
                { "timestamp": 1_700_000_000_001_i64, "message": "b" }
            ]
        })))
        .with_status(200)
        .with_body(r#"{"nextSequenceToken":"T1"}"#)
        .create_async()
        .await;

    let client = client_for(&server, 0);
    client.put_log_events(&put_request(None)).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn put_log_events_reports_rejections() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body(r#"{"nextSequenceToken":"T2","rejectedLogEventsInfo":{"tooOldLogEventEndIndex":0}}"#)
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let response = client.put_log_events(&put_request(Some("T1"))).await.unwrap();

    let info = response.rejected_log_events_info.unwrap();
    assert_eq!(info.too_old_log_event_end_index, Some(0));
    assert_eq!(info.expired_log_event_end_index, None);
}

#[tokio::test]
async fn invalid_sequence_token_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body(
            r#"{"__type":"InvalidSequenceTokenException","message":"The given sequenceToken is invalid.","expectedSequenceToken":"T2"}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, 3);
    let err = client
        .put_log_events(&put_request(Some("T1")))
        .await
        .unwrap_err();

    assert!(err.is_token_conflict());
    assert_eq!(err.expected_sequence_token(), Some("T2"));
    mock.assert_async().await;
}

#[tokio::test]
async fn data_already_accepted_is_mapped() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body(
            r#"{"__type":"com.amazonaws.logs#DataAlreadyAcceptedException","Message":"already accepted","expectedSequenceToken":"T9"}"#,
        )
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let err = client.put_log_events(&put_request(None)).await.unwrap_err();

    assert!(matches!(err, ApiError::DataAlreadyAccepted { ref expected } if expected.as_deref() == Some("T9")));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .with_body(r#"{"__type":"ServiceUnavailableException","message":"try later"}"#)
        .expect(2)
        .create_async()
        .await;

    let client = client_for(&server, 1);
    let err = client.describe_log_groups("frontend").await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::Service { status: 500, ref code, .. } if code == "ServiceUnavailableException"
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn throttling_is_retried_until_exhausted() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body(r#"{"__type":"ThrottlingException","message":"Rate exceeded"}"#)
        .expect(3)
        .create_async()
        .await;

    let client = client_for(&server, 2);
    let err = client.describe_log_groups("frontend").await.unwrap_err();

    assert!(matches!(err, ApiError::Throttled(ref m) if m == "Rate exceeded"));
    mock.assert_async().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body(r#"{"__type":"InvalidParameterException","message":"bad group name"}"#)
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, 3);
    let err = client.describe_log_groups("??").await.unwrap_err();

    assert!(matches!(err, ApiError::Service { status: 400, .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn unparseable_success_body_is_parse_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;

    let client = client_for(&server, 0);
    let err = client.describe_log_groups("frontend").await.unwrap_err();
    assert!(matches!(err, ApiError::Parse(_)));
}
