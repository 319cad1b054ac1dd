use base64::{Engine as _, engine::general_purpose};
use http::HeaderValue;
use zeroize::Zeroizing;

use crate::credentials::Credentials;
use crate::error::HttpError;

/// `Basic <base64(user:password)>` header value, marked sensitive.
///
/// Intermediate plaintext copies are scrubbed on drop. Returns `None` when
/// the credentials carry no principal.
///
/// # Errors
///
/// Returns [`HttpError::InvalidHeaderValue`] if the encoded value is not a
/// valid header (cannot happen for base64 output, kept for the type).
pub fn basic_header_value(credentials: &Credentials) -> Result<Option<HeaderValue>, HttpError> {
    let Some(username) = credentials.username() else {
        return Ok(None);
    };
    let password = credentials.password().map_or("", |p| p.expose());

    let pair = Zeroizing::new(format!("{username}:{password}"));
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(pair.as_bytes()));
    let raw = Zeroizing::new(format!("Basic {}", &*encoded));
    let mut value = HeaderValue::from_str(&raw)?;
    value.set_sensitive(true);
    Ok(Some(value))
}
