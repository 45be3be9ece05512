use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::types::MemberId;

/// Most IDs a single directive may name, counting every ID a range covers.
pub const MAX_DIRECTIVE_IDS: usize = 10_000;

/// Parse a member-ID directive such as `"[0, 3, 20-21]"`.
///
/// Entries are literals or inclusive ascending ranges, separated by commas.
/// The surrounding brackets are optional. IDs are returned in the order they
/// are listed, with duplicates dropped. A directive naming more than
/// [`MAX_DIRECTIVE_IDS`] IDs is rejected before any range is expanded.
pub fn parse_member_ids(input: &str) -> Result<Vec<MemberId>> {
    let invalid = |reason: String| Error::InvalidIdRange {
        input: input.to_string(),
        reason,
    };

    let trimmed = input.trim();
    let body = match (trimmed.strip_prefix('['), trimmed.ends_with(']')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => trimmed,
        _ => return Err(invalid("unbalanced brackets".to_string())),
    };

    let mut ids = Vec::new();
    let mut seen = BTreeSet::new();
    let mut named: usize = 0;
    if body.trim().is_empty() {
        return Ok(ids);
    }

    for entry in body.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(invalid("empty entry".to_string()));
        }

        let (start, end) = match entry.split_once('-') {
            Some((lo, hi)) => (parse_id(lo).map_err(&invalid)?, parse_id(hi).map_err(&invalid)?),
            None => {
                let id = parse_id(entry).map_err(&invalid)?;
                (id, id)
            }
        };

        if start > end {
            return Err(invalid(format!("range {start}-{end} is descending")));
        }

        // Both ends are non-negative i32, so the width fits in usize.
        named = named.saturating_add((end - start) as usize + 1);
        if named > MAX_DIRECTIVE_IDS {
            return Err(invalid(format!(
                "names more than {MAX_DIRECTIVE_IDS} member ids"
            )));
        }

        for id in start..=end {
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }

    Ok(ids)
}

fn parse_id(raw: &str) -> std::result::Result<MemberId, String> {
    let raw = raw.trim();
    raw.parse::<MemberId>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| format!("{raw:?} is not a non-negative integer"))
}
