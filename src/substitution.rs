// src/substitution.rs
//
// Path substitution rules: data registered under one URL prefix that now lives
// under another (renamed bucket, different mount point per machine).

use std::path::MAIN_SEPARATOR;
use tracing::warn;

use crate::config::PathSubstitutionRecord;
use crate::error::{Result, StorageError};

/// A single prefix rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSubstitutionRule {
    pub registered_prefix: String,
    pub local_prefix: String,
    /// Translate `\` in the remainder of the URL to the native separator
    pub replace_windows_sep: bool,
    /// Translate `/` in the remainder of the URL to the native separator
    pub replace_linux_sep: bool,
}

impl PathSubstitutionRule {
    /// Validated constructor. Both prefixes must be non-empty and at most one
    /// separator flag may be set.
    pub fn new(
        registered_prefix: impl Into<String>,
        local_prefix: impl Into<String>,
        replace_windows_sep: bool,
        replace_linux_sep: bool,
    ) -> Result<Self> {
        let registered_prefix = registered_prefix.into();
        let local_prefix = local_prefix.into();
        if registered_prefix.is_empty() || local_prefix.is_empty() {
            return Err(StorageError::Usage(
                "Path substitution prefixes must be non empty strings".into(),
            ));
        }
        if replace_windows_sep && replace_linux_sep {
            return Err(StorageError::Usage(
                "Only one of replace_windows_sep and replace_linux_sep may be set".into(),
            ));
        }
        Ok(Self {
            registered_prefix,
            local_prefix,
            replace_windows_sep,
            replace_linux_sep,
        })
    }

    /// Rewrite `url` if it starts with the registered prefix. Separator
    /// translation only touches the part after the new prefix.
    pub fn apply(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.registered_prefix)?;
        let rest = if self.replace_windows_sep {
            rest.replace('\\', &MAIN_SEPARATOR.to_string())
        } else if self.replace_linux_sep {
            rest.replace('/', &MAIN_SEPARATOR.to_string())
        } else {
            rest.to_string()
        };
        Some(format!("{}{}", self.local_prefix, rest))
    }
}

/// Ordered rule list. The first matching rule wins and is applied once.
#[derive(Debug, Clone, Default)]
pub struct PathSubstitutions {
    rules: Vec<PathSubstitutionRule>,
}

impl PathSubstitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from settings records; invalid records are logged and skipped.
    pub fn from_records(records: &[PathSubstitutionRecord]) -> Self {
        let mut rules = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let (Some(registered), Some(local)) =
                (record.registered_prefix.as_deref(), record.local_prefix.as_deref())
            else {
                warn!("Illegal substitution rule configuration 'path_substitution[{}]': {:?}", index, record);
                continue;
            };
            match PathSubstitutionRule::new(
                registered,
                local,
                record.replace_windows_sep,
                record.replace_linux_sep,
            ) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping substitution rule 'path_substitution[{}]': {}", index, e),
            }
        }
        Self { rules }
    }

    /// Append a rule after validating it.
    pub fn add_rule(
        &mut self,
        registered_prefix: &str,
        local_prefix: &str,
        replace_windows_sep: bool,
        replace_linux_sep: bool,
    ) -> Result<()> {
        let rule = PathSubstitutionRule::new(
            registered_prefix,
            local_prefix,
            replace_windows_sep,
            replace_linux_sep,
        )?;
        self.rules.push(rule);
        Ok(())
    }

    /// Drop every rule, including the ones loaded from settings.
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[PathSubstitutionRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the first matching rule. The output is never fed back through
    /// the rule list.
    pub fn apply(&self, url: &str) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(url))
            .unwrap_or_else(|| url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        assert!(matches!(
            PathSubstitutionRule::new("", "s3://new", false, false),
            Err(StorageError::Usage(_))
        ));
        assert!(matches!(
            PathSubstitutionRule::new("s3://old", "", false, false),
            Err(StorageError::Usage(_))
        ));
        assert!(matches!(
            PathSubstitutionRule::new("s3://old", "s3://new", true, true),
            Err(StorageError::Usage(_))
        ));
        assert!(PathSubstitutionRule::new("s3://old", "s3://new", true, false).is_ok());
    }

    #[test]
    fn test_bucket_rename() {
        let mut subs = PathSubstitutions::new();
        subs.add_rule("s3://old-bucket", "s3://new-bucket", false, false).unwrap();
        assert_eq!(subs.apply("s3://old-bucket/dir/file.txt"), "s3://new-bucket/dir/file.txt");
        assert_eq!(subs.apply("s3://other/dir/file.txt"), "s3://other/dir/file.txt");
    }

    #[test]
    fn test_first_match_wins_and_no_recursion() {
        let mut subs = PathSubstitutions::new();
        subs.add_rule("s3://a", "s3://b", false, false).unwrap();
        subs.add_rule("s3://b", "s3://c", false, false).unwrap();
        subs.add_rule("s3://a", "s3://z", false, false).unwrap();
        assert_eq!(subs.apply("s3://a/x"), "s3://b/x");
        assert_eq!(subs.apply("s3://b/x"), "s3://c/x");
    }

    #[test]
    fn test_separator_translation_skips_prefix() {
        let rule = PathSubstitutionRule::new("\\\\share\\data", "/mnt/data", true, false).unwrap();
        let out = rule.apply("\\\\share\\data\\sub\\file.bin").unwrap();
        let sep = MAIN_SEPARATOR;
        assert_eq!(out, format!("/mnt/data{sep}sub{sep}file.bin"));

        let rule = PathSubstitutionRule::new("file:///a/b", "C:\\data", false, true).unwrap();
        let out = rule.apply("file:///a/b/c/d.txt").unwrap();
        assert_eq!(out, format!("C:\\data{sep}c{sep}d.txt"));
    }

    #[test]
    fn test_clear() {
        let mut subs = PathSubstitutions::new();
        subs.add_rule("s3://a", "s3://b", false, false).unwrap();
        subs.clear();
        assert!(subs.is_empty());
        assert_eq!(subs.apply("s3://a/x"), "s3://a/x");
    }

    #[test]
    fn test_from_records_skips_invalid() {
        let records = vec![
            PathSubstitutionRecord {
                registered_prefix: Some("s3://old".into()),
                local_prefix: Some("s3://new".into()),
                ..Default::default()
            },
            PathSubstitutionRecord {
                registered_prefix: Some("s3://x".into()),
                local_prefix: None,
                ..Default::default()
            },
            PathSubstitutionRecord {
                registered_prefix: Some("s3://y".into()),
                local_prefix: Some("s3://z".into()),
                replace_windows_sep: true,
                replace_linux_sep: true,
            },
        ];
        let subs = PathSubstitutions::from_records(&records);
        assert_eq!(subs.rules().len(), 1);
        assert_eq!(subs.rules()[0].local_prefix, "s3://new");
    }
}
