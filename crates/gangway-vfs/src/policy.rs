//! Per-user access policy: three regex lists matched against virtual
//! paths. A path matches a list when any expression in it matches.

use regex::Regex;

/// Compiled read/write/hide policy.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    can_read: Vec<Regex>,
    can_write: Vec<Regex>,
    should_hide: Vec<Regex>,
}

impl AccessPolicy {
    /// Compile the three pattern lists.
    pub fn new(
        can_read: &[String],
        can_write: &[String],
        should_hide: &[String],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            can_read: compile(can_read)?,
            can_write: compile(can_write)?,
            should_hide: compile(should_hide)?,
        })
    }

    /// True when every list is empty, i.e. no wrapper is needed at all.
    pub fn is_empty(&self) -> bool {
        self.can_read.is_empty() && self.can_write.is_empty() && self.should_hide.is_empty()
    }

    /// True when there are no hide rules, which lets listings pass
    /// through unfiltered.
    pub fn hide_rules_empty(&self) -> bool {
        self.should_hide.is_empty()
    }

    pub fn can_read(&self, path: &str) -> bool {
        self.can_read.iter().any(|r| r.is_match(path))
    }

    pub fn can_write(&self, path: &str) -> bool {
        self.can_write.iter().any(|r| r.is_match(path))
    }

    /// Hiding wins over both read and write permission.
    pub fn should_hide(&self, path: &str) -> bool {
        self.should_hide.iter().any(|r| r.is_match(path))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}
