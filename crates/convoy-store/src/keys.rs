//! Key prefix helpers

use std::fmt::{Display, Formatter};

/// Key prefix, always terminated by `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prefix(String);

impl Prefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self(prefix)
    }

    /// Nested prefix `<self><segment>/`.
    pub fn add(&self, segment: &str) -> Prefix {
        Prefix::new(format!("{}{}", self.0, segment.trim_matches('/')))
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.0, name)
    }

    /// Part of `key` after the prefix, `None` for keys outside of it.
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
