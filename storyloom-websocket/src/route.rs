//! Upgrade request routing.

use crate::error::{SyncServerError, SyncServerResult};
use storyloom_collab::{BranchId, ChapterId, DocumentKey};

/// Path prefix every sync connection is opened on.
pub const SYNC_PATH_PREFIX: &str = "/sync";

/// Parse `/sync/{branch_id}/{chapter_id}` (query string and a trailing slash
/// are ignored).
pub fn parse_sync_path(path: &str) -> SyncServerResult<DocumentKey> {
    let invalid = || SyncServerError::InvalidPath(path.to_string());

    let path = path.split('?').next().unwrap_or_default();
    let rest = path.strip_prefix(SYNC_PATH_PREFIX).ok_or_else(invalid)?;
    let mut segments = rest.trim_matches('/').split('/');

    let branch_id: BranchId = segments
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    let chapter_id: ChapterId = segments
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    if segments.next().is_some() {
        return Err(invalid());
    }

    Ok(DocumentKey::new(branch_id, chapter_id))
}

/// Path a client connects to for `key`.
pub fn sync_path(key: &DocumentKey) -> String {
    format!("{}/{}/{}", SYNC_PATH_PREFIX, key.branch_id, key.chapter_id)
}
