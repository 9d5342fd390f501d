//! Caller identity resolved from request headers
//!
//! Identity arrives as a numeric `User` header set by the front proxy.
//! The id is also pushed into the logging MDC so every line emitted while
//! handling the request carries it.

use actix_web::HttpRequest;

use crate::error::{Error, Result};

/// Identity of the calling user for the duration of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
}

impl UserContext {
    /// Resolve the caller from the `User` header
    pub fn from_request(req: &HttpRequest) -> Result<Self> {
        let raw = req
            .headers()
            .get("User")
            .ok_or_else(|| Error::Validation {
                message: "Missing User header".to_string(),
            })?
            .to_str()
            .map_err(|_| Error::Validation {
                message: "Invalid User header value".to_string(),
            })?
            .trim();

        let user_id: i64 = raw.parse().map_err(|_| Error::Validation {
            message: "Invalid User header value".to_string(),
        })?;

        log_mdc::insert("user", raw);
        Ok(Self { user_id })
    }
}
