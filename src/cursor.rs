//! # Cursor Utilities
//!
//! Opaque keyset cursors for paging through execution logs, which are ordered by
//! `(start_time DESC, id DESC)`.

use crate::error::ApiError;
use axum::http::StatusCode;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_ENCODED_LEN: usize = 512;
const MAX_DECODED_LEN: usize = 256;

/// Position of the last row returned by the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCursor {
    pub start_time: DateTime<Utc>,
    pub id: Uuid,
}

pub fn encode_cursor(cursor: &ExecutionCursor) -> String {
    let json = serde_json::json!({
        "start_time": cursor.start_time,
        "id": cursor.id,
    })
    .to_string();
    base64::engine::general_purpose::STANDARD.encode(json.as_bytes())
}

fn invalid(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
}

/// Decode a cursor produced by [`encode_cursor`], rejecting anything malformed.
pub fn decode_cursor(cursor: &str) -> Result<ExecutionCursor, ApiError> {
    if cursor.is_empty() {
        return Err(invalid("cursor cannot be empty"));
    }

    if cursor.len() > MAX_ENCODED_LEN {
        return Err(invalid("cursor is too long"));
    }

    if !cursor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return Err(invalid("cursor contains invalid characters"));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(cursor)
        .map_err(|_| invalid("cursor is not valid base64"))?;

    if decoded.len() > MAX_DECODED_LEN {
        return Err(invalid("decoded cursor is too large"));
    }

    let json =
        String::from_utf8(decoded).map_err(|_| invalid("cursor contains invalid UTF-8 data"))?;

    let data: ExecutionCursor = serde_json::from_str(&json)
        .map_err(|_| invalid("cursor contains invalid JSON structure"))?;

    // Clock skew allowance; anything later was not minted by us
    if data.start_time > Utc::now() + chrono::Duration::days(1) {
        return Err(invalid("cursor timestamp is too far in the future"));
    }

    if data.id.is_nil() {
        return Err(invalid("cursor contains invalid ID"));
    }

    Ok(data)
}
