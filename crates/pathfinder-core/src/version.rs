//! Firmware version comparison.

use std::cmp::Ordering;

/// Returns true when `reported` is older than `latest`.
///
/// Versions are compared as semver when both parse (a leading `v` is
/// ignored); otherwise they fall back to a plain lexicographic comparison.
pub fn is_outdated(reported: &str, latest: &str) -> bool {
    compare(reported, latest) == Ordering::Less
}

pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.trim().cmp(b.trim()),
    }
}

fn parse(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    semver::Version::parse(trimmed).ok().or_else(|| {
        // Accept short forms like "1.2" or "2"
        let parts = trimmed.split('.').count();
        match parts {
            1 => semver::Version::parse(&format!("{trimmed}.0.0")).ok(),
            2 => semver::Version::parse(&format!("{trimmed}.0")).ok(),
            _ => None,
        }
    })
}
