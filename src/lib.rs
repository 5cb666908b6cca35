//! CloudWatch Shipper Library
//!
//! Client-side components for shipping application logs to a single
//! CloudWatch Logs stream with ordered, sequence-token-correct delivery:
//!
//! - **event**: Log events and structured records
//! - **buffer**: Bounded in-memory queue with batch extraction and acknowledgement
//! - **token_store**: Durable sequence token storage
//! - **api**: CloudWatch Logs wire types, errors and the `LogsApi` trait
//! - **sigv4**: AWS Signature Version 4 request signing
//! - **client**: HTTPS client for the CloudWatch Logs JSON API with retry logic
//! - **resolver**: Log group / stream existence checks and stream creation
//! - **breaker**: One-way kill switch for remote delivery
//! - **uploader**: A single upload tick and its sequence token reconciliation
//! - **shipper**: Public client with scheduled uploads
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use cloudwatch_shipper::config::Config;
//! use cloudwatch_shipper::event::LogEvent;
//! use cloudwatch_shipper::shipper::LogShipper;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Create the shipper and start scheduled uploads
//!     let shipper = LogShipper::from_config(&config).expect("Failed to create shipper");
//!     shipper.start();
//!
//!     // Queue events from anywhere
//!     shipper.log(LogEvent::new("user signed in"));
//!     shipper.error("payment declined");
//!
//!     // Flush what is left before exiting
//!     shipper.stop().await.ok();
//! }
//! ```

// Module declarations
pub mod api;
pub mod breaker;
pub mod buffer;
pub mod client;
pub mod config;
pub mod event;
pub mod resolver;
pub mod shipper;
pub mod sigv4;
pub mod token_store;
pub mod uploader;

// Re-export commonly used types at crate root for convenience
pub use api::{ApiError, LogsApi, PutLogEventsRequest, PutLogEventsResponse, RejectedLogEventsInfo};
pub use breaker::CircuitBreaker;
pub use buffer::{BufferConfig, BufferError, BufferStats, LogBuffer, OverflowPolicy};
pub use client::CloudWatchLogsClient;
pub use config::{Config, ConfigError};
pub use event::{Level, LogEvent, LogRecord};
pub use resolver::{TargetResolver, TargetState};
pub use shipper::{LogShipper, ShipperStats};
pub use sigv4::Credentials;
pub use token_store::{FileTokenStore, MemoryTokenStore, SequenceTokens, StoreError, TokenStore};
pub use uploader::{RetryPolicy, TickOutcome, UploadError, Uploader};
