//! Identifiers shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(7) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A repository, as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse GitHub's `full_name` (`owner/name`).
    ///
    /// Returns None unless there is exactly one slash with non-empty parts.
    pub fn parse_full_name(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A pull request within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrId {
    pub repo: RepoId,
    pub number: u64,
}

impl PrId {
    pub fn new(repo: RepoId, number: u64) -> Self {
        Self { repo, number }
    }
}

impl fmt::Display for PrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_sha_truncates() {
        assert_eq!(CommitSha::from("0123456789abcdef").short(), "0123456");
        assert_eq!(CommitSha::from("abc").short(), "abc");
    }

    #[test]
    fn test_short_sha_respects_char_boundaries() {
        assert_eq!(CommitSha::from("ééééééééé").short(), "ééééééé");
        assert_eq!(CommitSha::from("日本").short(), "日本");
    }

    #[test]
    fn test_parse_full_name() {
        assert_eq!(
            RepoId::parse_full_name("octo/widgets"),
            Some(RepoId::new("octo", "widgets"))
        );
        assert_eq!(RepoId::parse_full_name("octo"), None);
        assert_eq!(RepoId::parse_full_name("/widgets"), None);
        assert_eq!(RepoId::parse_full_name("octo/"), None);
        assert_eq!(RepoId::parse_full_name("a/b/c"), None);
    }

    #[test]
    fn test_pr_id_display() {
        let pr = PrId::new(RepoId::new("octo", "widgets"), 42);
        assert_eq!(pr.to_string(), "octo/widgets#42");
    }
}
