#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Pooled, authenticated HTTP(S) transport for integration senders
//!
//! The crate turns "send this message over HTTP(S)" into one correctly
//! authenticated, pooled, retried and streamed exchange, and hands back a
//! response whose connection is released as soon as the content is consumed.
//!
//! - TLS via rustls: keystore/truststore loading, relaxed verification for
//!   self-signed certificates, expired certificates or hostname mismatches
//! - Basic and `OAuth2` (client credentials / password grant) authentication,
//!   plus proxy authentication with a CONNECT tunnel for https targets
//! - A bounded connection pool with time-to-live, idle eviction and stale
//!   checks
//! - Retries for transport failures, with exponential backoff and jitter
//! - Self-releasing response streams
//! - A message sender with raw, binary, url-encoded, form-data and MTOM bodies
//!
//! # Example
//!
//! ```ignore
//! use http_transport::config::SenderConfig;
//! use http_transport::sender::{HttpSender, MessageContext};
//!
//! let config = SenderConfig::load("sender.yaml")?;
//! let sender = HttpSender::configure(config)?;
//!
//! let mut context = MessageContext::new().with_correlation_id("c-42");
//! let result = sender.send_message("<order/>", &mut context).await?;
//! if !result.success {
//!     tracing::warn!(status = %result.status_code, body = %result.result, "rejected");
//! }
//! ```

pub mod auth;
mod body;
pub mod config;
mod cookies;
pub mod credentials;
mod endpoint;
mod error;
pub mod pool;
mod redirect;
mod response;
mod retry;
mod secret;
pub mod sender;
mod session;
pub mod tls;

pub use body::RequestBody;
pub use endpoint::Endpoint;
pub use error::{AuthError, BoxError, ConfigError, HttpError, InvalidUriKind};
pub use response::{ContentType, FALLBACK_CHARSET, ResponseBody, ResponseEnvelope, ResponseStream, reason_phrase};
pub use retry::{RETRY_ATTEMPT_HEADER, RetryLayer, RetryService, calculate_backoff};
pub use secret::SecretString;
pub use sender::{HttpSender, MessageContext, SenderResult};
pub use session::{HttpSession, HttpSessionBuilder, TransportService};
