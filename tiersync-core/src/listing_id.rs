//! Deterministic listing ids derived from source urls.
//!
//! The same listing reached through differently-cased hosts, a trailing
//! slash, tracking query parameters or an anchor must map to one id, so the
//! url is normalized before hashing.

use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    error::{Result, SyncError},
    types::ListingId,
};

pub const DEFAULT_ID_PREFIX: &str = "listing";

const HASH_HEX_LEN: usize = 16;

/// Scheme and host lowercased, path lowercased without trailing slashes,
/// query and fragment dropped.
pub fn normalize_listing_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidListingUrl("empty url".into()));
    }

    let parsed = Url::parse(trimmed).map_err(|e| {
        SyncError::InvalidListingUrl(format!("{trimmed}: {e}"))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        SyncError::InvalidListingUrl(format!("{trimmed}: missing host"))
    })?;

    let mut normalized = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(parsed.path().to_lowercase().trim_end_matches('/'));
    Ok(normalized.to_lowercase())
}

pub fn listing_id_for_url(raw: &str) -> Result<ListingId> {
    listing_id_with_prefix(DEFAULT_ID_PREFIX, raw)
}

pub fn listing_id_with_prefix(prefix: &str, raw: &str) -> Result<ListingId> {
    let normalized = normalize_listing_url(raw)?;
    let digest = Sha256::digest(normalized.as_bytes());
    let hex = hex::encode(digest);
    Ok(ListingId(format!("{prefix}_{}", &hex[..HASH_HEX_LEN])))
}
