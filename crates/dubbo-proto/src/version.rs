//! Dubbo protocol version handling.

/// Protocol version written into every request body.
pub const DEFAULT_DUBBO_PROTOCOL_VERSION: &str = "2.0.2";

/// Lowest version (2.0.2) whose peers understand response attachments.
pub const LOWEST_VERSION_FOR_RESPONSE_ATTACHMENT: i64 = 2_000_200;

/// Releases 2.0.10 through 2.6.2 report versions above the minimum but
/// choke on response attachments.
const LEGACY_EXCLUDED: std::ops::RangeInclusive<i64> = 2_001_000..=2_060_200;

/// Whether a peer that declared `version` can read response attachments.
#[must_use]
pub fn is_support_response_attachment(version: &str) -> bool {
    if version.is_empty() {
        return false;
    }
    let Some(v) = version_to_int(version) else {
        return false;
    };
    if LEGACY_EXCLUDED.contains(&v) {
        return false;
    }
    v >= LOWEST_VERSION_FOR_RESPONSE_ATTACHMENT
}

/// Numeric encoding of a dotted version.
///
/// Each segment occupies two decimal digits; three-segment versions are
/// shifted so they line up with four-segment ones (`2.0.2` is `2000200`,
/// `2.7.1.1` is `2070101`). Returns `None` for non-numeric segments.
#[must_use]
pub fn version_to_int(version: &str) -> Option<i64> {
    let segments: Vec<&str> = version.split('.').collect();
    let len = segments.len();
    let mut v: i64 = 0;
    for (idx, segment) in segments.iter().enumerate() {
        let n: i64 = segment.parse().ok()?;
        let exp = u32::try_from((len - idx - 1) * 2).ok()?;
        v = v.checked_add(n.checked_mul(10_i64.checked_pow(exp)?)?)?;
    }
    if len == 3 {
        return v.checked_mul(100);
    }
    Some(v)
}
