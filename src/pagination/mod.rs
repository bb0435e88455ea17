//! Cursor pagination shared by every `*/list` operation.
//!
//! Plain list cursors are stringified offsets. Roots cursors additionally
//! embed the snapshot version so they go stale when the client's roots
//! change; those are base64url-encoded JSON so the version cannot be forged
//! by accident.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default page size for all list operations.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Slice `items` according to an opaque cursor, returning the page and the
/// cursor for the next one (absent when the sequence is exhausted).
pub fn paginate<T: Clone>(
    items: &[T],
    cursor: Option<&str>,
    limit: usize,
) -> Result<(Vec<T>, Option<String>)> {
    let offset = match cursor {
        Some(c) => decode_offset(c)?,
        None => 0,
    };

    if offset >= items.len() {
        return Ok((Vec::new(), None));
    }

    let end = (offset + limit).min(items.len());
    let page = items[offset..end].to_vec();
    let next = (end < items.len()).then(|| encode_offset(end));
    Ok((page, next))
}

pub fn encode_offset(offset: usize) -> String {
    offset.to_string()
}

pub fn decode_offset(cursor: &str) -> Result<usize> {
    cursor.parse::<usize>().map_err(|_| {
        Error::invalid_params_data(
            "Malformed cursor",
            serde_json::json!({ "cursor": cursor }),
        )
    })
}

#[derive(Serialize, Deserialize)]
struct VersionedCursor {
    v: u64,
    o: usize,
}

/// Encode a roots cursor binding `offset` to snapshot `version`.
pub fn encode_versioned(version: u64, offset: usize) -> String {
    let payload = serde_json::to_vec(&VersionedCursor { v: version, o: offset })
        .expect("cursor payload is always serializable");
    URL_SAFE_NO_PAD.encode(payload)
}

/// Decode a roots cursor, rejecting malformed input and cursors minted
/// against a different snapshot version.
pub fn decode_versioned(cursor: &str, expected_version: u64) -> Result<usize> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::invalid_params("Invalid cursor for roots/list"))?;
    let parsed: VersionedCursor = serde_json::from_slice(&bytes)
        .map_err(|_| Error::invalid_params("Invalid cursor for roots/list"))?;

    if parsed.v != expected_version {
        return Err(Error::invalid_params_data(
            "Stale cursor for roots/list; restart pagination",
            serde_json::json!({ "expected": expected_version, "received": parsed.v }),
        ));
    }
    Ok(parsed.o)
}
