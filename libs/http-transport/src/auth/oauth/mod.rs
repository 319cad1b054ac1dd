//! `OAuth2` bearer tokens for the target host.
//!
//! [`TokenEndpointClient`] talks to the token endpoint; [`TokenManager`]
//! caches the result and decides when to refresh it.

mod source;
mod token;

pub use source::{GrantType, TokenEndpointClient, TokenResponse};
pub use token::{AccessToken, TokenManager, TokenSource};
