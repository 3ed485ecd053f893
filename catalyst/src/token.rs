//! Write-credential extraction and the process-wide token banishment list.

use std::collections::HashSet;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Uri};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use thiserror::Error;

use crate::metrics;

/// Dedicated token headers, in precedence order.
pub const TOKEN_HEADERS: [&str; 3] = ["X-Warp10-Token", "X-Metrics-Token", "X-CityzenData-Token"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("bad basic auth bearer")]
    BadBasic,
    #[error("unauthorized")]
    BasicWithoutSeparator,
    #[error("invalid Authorization header")]
    Missing,
}

/// Extract the write token from request metadata, by precedence: dedicated
/// headers, `Authorization` (Basic password part, then Bearer), then the `p`
/// query parameter. The `p` field of a form body is handled by the caller,
/// which owns the body.
pub fn from_parts(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    for header in TOKEN_HEADERS {
        if let Some(value) = headers.get(header).and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                return Ok(value.to_owned());
            }
        }
    }

    if let Some(authorization) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) {
        if let Some((scheme, rest)) = authorization.split_once(' ') {
            match scheme.to_ascii_lowercase().as_str() {
                "basic" => {
                    let decoded = BASE64.decode(rest.trim()).map_err(|_| AuthError::BadBasic)?;
                    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::BadBasic)?;
                    let (_user, token) = decoded.split_once(':').ok_or(AuthError::BasicWithoutSeparator)?;
                    return Ok(token.to_owned());
                }
                "bearer" => return Ok(rest.to_owned()),
                _ => {}
            }
        }
    }

    if let Some(token) = query_param(uri, "p") {
        if !token.is_empty() {
            return Ok(token);
        }
    }

    Err(AuthError::Missing)
}

/// `p` field of an `application/x-www-form-urlencoded` body.
pub fn from_form_body(body: &[u8]) -> Option<String> {
    serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
        .ok()?
        .into_iter()
        .find_map(|(key, value)| (key == "p" && !value.is_empty()).then_some(value))
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .ok()?
        .into_iter()
        .find_map(|(key, value)| (key == name).then_some(value))
}

lazy_static! {
    static ref BANNISHED: RwLock<HashSet<String>> = RwLock::new(HashSet::new());
}

/// Ban a token for the lifetime of the process.
pub fn bannish(token: &str) {
    let mut banned = BANNISHED.write();
    if banned.insert(token.to_owned()) {
        metrics::BANNISH_CURRENT.inc();
    }
}

pub fn is_banned(token: &str) -> bool {
    BANNISHED.read().contains(token)
}
