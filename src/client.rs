//! HTTP client for the CloudWatch Logs JSON API.
//!
//! This module provides an async HTTP client with connection pooling,
//! SigV4 request signing, retry logic with exponential backoff for transient
//! failures, and mapping of service error payloads onto [`ApiError`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::api::{
    ApiError, CreateLogStreamRequest, DescribeLogGroupsRequest, DescribeLogGroupsResponse,
    DescribeLogStreamsRequest, DescribeLogStreamsResponse, LogGroup, LogStream, LogsApi,
    PutLogEventsRequest, PutLogEventsResponse,
};
use crate::config::Config;
use crate::sigv4::{Credentials, Signer};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Target prefix of the CloudWatch Logs JSON 1.1 protocol.
const TARGET_PREFIX: &str = "Logs_20140328";

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

const SERVICE_NAME: &str = "logs";

/// Error payload returned by the service on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    error_type: Option<String>,

    #[serde(alias = "Message", default)]
    message: Option<String>,

    #[serde(default)]
    expected_sequence_token: Option<String>,
}

/// CloudWatch Logs client speaking the JSON protocol over HTTPS.
///
/// # Example
///
/// ```no_run
/// use cloudwatch_shipper::api::LogsApi;
/// use cloudwatch_shipper::client::CloudWatchLogsClient;
/// use cloudwatch_shipper::config::Config;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::from_env().expect("Failed to load config");
///     let client = CloudWatchLogsClient::new(&config).expect("Failed to create client");
///
///     match client.describe_log_groups(&config.log_group).await {
///         Ok(groups) => println!("{} matching groups", groups.len()),
///         Err(e) => eprintln!("Failed to describe groups: {}", e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct CloudWatchLogsClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    endpoint: Url,

    /// Value of the `host` header covered by the signature
    host: String,

    signer: Signer,

    /// Maximum number of retry attempts
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,

    base_delay: Duration,
}

impl CloudWatchLogsClient {
    /// Create a new client from the agent configuration.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` if the endpoint is not a valid URL or the
    /// HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        Self::with_settings(
            &config.endpoint,
            &config.region,
            config.credentials.clone(),
            config.request_timeout,
            config.max_retries,
        )
    }

    /// Create a new client with custom settings.
    pub fn with_settings(
        endpoint: &str,
        region: &str,
        credentials: Credentials,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ApiError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ApiError::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ApiError::Config(format!(
                    "endpoint '{}' has no host",
                    endpoint
                )))
            }
        };

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            host,
            signer: Signer::new(credentials, region, SERVICE_NAME),
            max_retries,
            timeout,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        })
    }

    /// Override the base delay of the transport backoff.
    pub fn with_retry_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Invoke one API action, retrying transient failures.
    ///
    /// # Retryable Errors
    ///
    /// - Network connection errors and timeouts
    /// - Throttling (`ThrottlingException` or HTTP 429)
    /// - Server errors (5xx status codes)
    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, ApiError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(request).map_err(|e| ApiError::Parse(e.to_string()))?;
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    action = action,
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }

            match self.send_request(action, &payload).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let is_retryable = self.is_retryable_error(&e);

                    if is_retryable && attempt < self.max_retries {
                        warn!(
                            action = action,
                            error = %e,
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            "Request failed, will retry"
                        );
                        attempt += 1;
                    } else {
                        if is_retryable {
                            error!(
                                action = action,
                                error = %e,
                                attempts = attempt + 1,
                                "Request failed permanently"
                            );
                        }
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Send a single signed request without retry logic.
    async fn send_request<Resp: DeserializeOwned>(
        &self,
        action: &str,
        payload: &[u8],
    ) -> Result<Resp, ApiError> {
        let target = format!("{}.{}", TARGET_PREFIX, action);
        let signed = self.signer.sign_post(
            &self.host,
            &[("content-type", CONTENT_TYPE), ("x-amz-target", target.as_str())],
            payload,
            Utc::now(),
        );

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-target", &target);
        for (name, value) in signed {
            builder = builder.header(name, value);
        }

        debug!(action = action, bytes = payload.len(), "Sending request");
        let response = builder.body(payload.to_vec()).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
            serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))
        } else {
            Err(Self::service_error(status, &body))
        }
    }

    /// Map an error response onto [`ApiError`].
    fn service_error(status: StatusCode, body: &str) -> ApiError {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let code = parsed
            .error_type
            .as_deref()
            .map(|t| t.rsplit('#').next().unwrap_or(t))
            .unwrap_or("UnknownError")
            .to_string();
        let message = parsed.message.unwrap_or_else(|| body.to_string());

        ApiError::from_service(status.as_u16(), &code, message, parsed.expected_sequence_token)
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.base_delay.as_millis() as u64;

        let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

        // Add jitter (up to 25% of the delay)
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay.saturating_add(jitter).min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    /// Check if an error is retryable.
    fn is_retryable_error(&self, error: &ApiError) -> bool {
        match error {
            ApiError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ApiError::Timeout => true,
            ApiError::Throttled(_) => true,
            ApiError::Service { status, .. } => *status >= 500,
            ApiError::InvalidSequenceToken { .. }
            | ApiError::DataAlreadyAccepted { .. }
            | ApiError::ResourceAlreadyExists(_)
            | ApiError::ResourceNotFound(_)
            | ApiError::Parse(_)
            | ApiError::Config(_) => false,
        }
    }

    /// Get the configured endpoint.
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl LogsApi for CloudWatchLogsClient {
    async fn describe_log_groups(&self, name_prefix: &str) -> Result<Vec<LogGroup>, ApiError> {
        let response: DescribeLogGroupsResponse = self
            .call(
                "DescribeLogGroups",
                &DescribeLogGroupsRequest {
                    log_group_name_prefix: name_prefix,
                },
            )
            .await?;
        Ok(response.log_groups)
    }

    async fn describe_log_streams(
        &self,
        group: &str,
        stream_prefix: &str,
    ) -> Result<Vec<LogStream>, ApiError> {
        let response: DescribeLogStreamsResponse = self
            .call(
                "DescribeLogStreams",
                &DescribeLogStreamsRequest {
                    log_group_name: group,
                    log_stream_name_prefix: stream_prefix,
                },
            )
            .await?;
        Ok(response.log_streams)
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), ApiError> {
        let _: IgnoredAny = self
            .call(
                "CreateLogStream",
                &CreateLogStreamRequest {
                    log_group_name: group,
                    log_stream_name: stream,
                },
            )
            .await?;
        Ok(())
    }

    async fn put_log_events(
        &self,
        request: &PutLogEventsRequest,
    ) -> Result<PutLogEventsResponse, ApiError> {
        self.call("PutLogEvents", request).await
    }
}
