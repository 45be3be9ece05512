use crate::error::{Error, Result};

/// Validate that an identifier is safe for use in etcd key paths.
///
/// Cluster, pool and rebalance names are interpolated into keys. Without
/// validation a name like `../../pools/other/a` could write anywhere.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} must be 1-128 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} contains invalid characters (only alphanumeric, dash, underscore allowed)"
        )));
    }
    Ok(())
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Split a comma separated setting into trimmed, non-empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
