use std::time::Duration;

/// A single `PathPrefix(/…)` token from a rule's match expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefix(String);

impl PathPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Prefix union from the match expression; a rule matches a path if any
    /// prefix matches.
    pub matchers: Vec<PathPrefix>,
    pub priority: i32,
    pub bypass: bool,
    pub bypass_when_cookies: Vec<String>,
    /// Zero means entries under this rule never go stale.
    pub expiration: Duration,
    pub warmup: Option<WarmupRule>,
}

#[derive(Debug, Clone)]
pub struct WarmupRule {
    pub run_every: Duration,
    pub max_in_flight: usize,
}

impl Rule {
    pub fn matches(&self, path: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(path))
    }
}
