//! Version marks.

use std::fmt;
use std::str::FromStr;

use super::error::MeshError;
use crate::cluster::{random_suffix, sanitize_label_value};

/// Key used when a mark has no explicit key.
pub const DEFAULT_MARK_KEY: &str = "version";

/// Header (and pod label) that selects traffic for the local endpoint.
///
/// Written as `key:value`, or just `value` for key `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMark {
    /// Header name and label key.
    pub key: String,
    /// Header and label value.
    pub value: String,
}

impl VersionMark {
    /// A fresh `version:<5 hex>` mark.
    pub fn generate() -> Self {
        Self {
            key: DEFAULT_MARK_KEY.to_string(),
            value: random_suffix(),
        }
    }

    /// The value reduced to something usable in object names.
    pub fn name_suffix(&self) -> String {
        sanitize_label_value(&self.value).to_ascii_lowercase().replace(['_', '.'], "-")
    }
}

impl FromStr for VersionMark {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| MeshError::InvalidVersionMark {
            mark: s.to_string(),
            reason: reason.to_string(),
        };
        let (key, value) = match s.split_once(':') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (DEFAULT_MARK_KEY, s.trim()),
        };
        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if value.is_empty() {
            return Err(invalid("value is empty"));
        }
        if value.contains(':') {
            return Err(invalid("expected 'value' or 'key:value'"));
        }
        if sanitize_label_value(key) != key || sanitize_label_value(value) != value {
            return Err(invalid("only letters, digits, '-', '_' and '.' are allowed"));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

impl fmt::Display for VersionMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        let mark: VersionMark = "mark:local".parse().unwrap();
        assert_eq!(mark.key, "mark");
        assert_eq!(mark.value, "local");
        assert_eq!(mark.to_string(), "mark:local");
    }

    #[test]
    fn test_parse_bare_value() {
        let mark: VersionMark = "0.0.1".parse().unwrap();
        assert_eq!(mark.key, DEFAULT_MARK_KEY);
        assert_eq!(mark.value, "0.0.1");
        assert_eq!(mark.name_suffix(), "0-0-1");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", ":x", "k:", "a:b:c", "my mark"] {
            assert!(bad.parse::<VersionMark>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_generate() {
        let mark = VersionMark::generate();
        assert_eq!(mark.key, DEFAULT_MARK_KEY);
        assert_eq!(mark.value.len(), 5);
    }
}
