//! Per-dataset policy selected by filename/path glob matching (spec §4.H).
//!
//! Grounded on the teacher's `FsService::resolve_path` (`src/fs.rs`):
//! that method guards path access by canonicalization; this module
//! generalizes the same "does this path match a configured rule" shape
//! to glob patterns instead of prefix containment, since the spec calls
//! for `*`/`?` wildcard matching rather than sandboxing.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Passthru,
    Memory,
    ZeroCopy,
    Keep,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GlobRule {
    pub filename: String,
    pub path: String,
}

impl GlobRule {
    pub fn new(filename: impl Into<String>, path: impl Into<String>) -> Self {
        GlobRule { filename: filename.into(), path: path.into() }
    }

    fn matches(&self, filename: &str, path: &str) -> bool {
        glob_match(&self.filename, filename) && glob_match(&self.path, path)
    }
}

/// Shell-style `*`/`?` glob match (not a regular expression, per spec §4.H).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            Some(b'?') => !t.is_empty() && rec(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && rec(&p[1..], &t[1..]),
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobPolicy {
    #[serde(default)]
    pub passthru: Vec<GlobRule>,
    #[serde(default)]
    pub memory: Vec<GlobRule>,
    #[serde(default)]
    pub zerocopy: Vec<GlobRule>,
    #[serde(default)]
    pub keep: Vec<GlobRule>,
}

impl GlobPolicy {
    fn list(&self, kind: PolicyKind) -> &[GlobRule] {
        match kind {
            PolicyKind::Passthru => &self.passthru,
            PolicyKind::Memory => &self.memory,
            PolicyKind::ZeroCopy => &self.zerocopy,
            PolicyKind::Keep => &self.keep,
        }
    }

    fn list_mut(&mut self, kind: PolicyKind) -> &mut Vec<GlobRule> {
        match kind {
            PolicyKind::Passthru => &mut self.passthru,
            PolicyKind::Memory => &mut self.memory,
            PolicyKind::ZeroCopy => &mut self.zerocopy,
            PolicyKind::Keep => &mut self.keep,
        }
    }

    pub fn add(&mut self, kind: PolicyKind, filename: impl Into<String>, path: impl Into<String>) {
        self.list_mut(kind).push(GlobRule::new(filename, path));
    }

    /// True iff any rule of `kind` matches `(filename, path)`; an empty
    /// list yields `default` (spec §4.H).
    pub fn match_any(&self, filename: &str, path: &str, kind: PolicyKind, default: bool) -> bool {
        let list = self.list(kind);
        if list.is_empty() {
            return default;
        }
        list.iter().any(|r| r.matches(filename, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(glob_match("*.h5", "data.h5"));
        assert!(glob_match("/g/?", "/g/d"));
        assert!(!glob_match("/g/?", "/g/dd"));
        assert!(glob_match("*", "anything/at/all"));
    }

    #[test]
    fn empty_list_uses_default() {
        let policy = GlobPolicy::default();
        assert!(!policy.match_any("a.h5", "/x", PolicyKind::Passthru, false));
        assert!(policy.match_any("a.h5", "/x", PolicyKind::Passthru, true));
    }

    #[test]
    fn non_empty_list_requires_match() {
        let mut policy = GlobPolicy::default();
        policy.add(PolicyKind::Memory, "*.h5", "/data/*");
        assert!(policy.match_any("run.h5", "/data/x", PolicyKind::Memory, false));
        assert!(!policy.match_any("run.h5", "/other/x", PolicyKind::Memory, true));
    }
}
