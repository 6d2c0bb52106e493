//! Dotted-integer version comparison.
//!
//! Versions are split on `.` and compared component by component as
//! integers; missing components count as zero, so `"1.2"` equals `"1.2.0"`.
//! A leading `v`/`V` is ignored. Pre-release suffixes on a component
//! (`"3-beta"`) compare by their leading digits only.

use std::cmp::Ordering;

/// Strip a leading `v` or `V` from a tag such as `"v2.0.0"`.
pub fn normalize(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
}

fn components(version: &str) -> Vec<u64> {
    normalize(version)
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Compare two versions numerically, component by component.
pub fn compare(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// How a remote version relates to the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionChange {
    /// Same version; nothing to do.
    Same,
    /// Remote is newer.
    Upgrade,
    /// Remote is older. Still offered, flagged for the host to confirm.
    Downgrade,
}

impl VersionChange {
    /// Classify `remote` relative to `current`.
    pub fn between(current: &str, remote: &str) -> Self {
        match compare(remote, current) {
            Ordering::Equal => Self::Same,
            Ordering::Greater => Self::Upgrade,
            Ordering::Less => Self::Downgrade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_zero_components_are_equal() {
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare("1.2.0.0", "1.2"), Ordering::Equal);
        assert_eq!(compare("v2.0.0", "2"), Ordering::Equal);
    }

    #[test]
    fn numeric_not_lexicographic() {
        assert_eq!(compare("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare("0.9", "0.10"), Ordering::Less);
    }

    #[test]
    fn leading_v_is_ignored() {
        assert_eq!(normalize("v1.4.2"), "1.4.2");
        assert_eq!(normalize(" V3 "), "3");
        assert_eq!(normalize("1.0"), "1.0");
    }

    #[test]
    fn prerelease_suffix_uses_leading_digits() {
        assert_eq!(compare("2.0.1-beta", "2.0.1"), Ordering::Equal);
        assert_eq!(compare("2.0.2-rc1", "2.0.1"), Ordering::Greater);
    }

    #[test]
    fn change_classification() {
        assert_eq!(VersionChange::between("1.9.9", "2.0.0"), VersionChange::Upgrade);
        assert_eq!(VersionChange::between("2.0.0", "2.0.0"), VersionChange::Same);
        assert_eq!(VersionChange::between("3.0.0", "2.0.0"), VersionChange::Downgrade);
        assert_eq!(VersionChange::between("2.0", "v2.0.0"), VersionChange::Same);
    }
}
