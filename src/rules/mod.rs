pub mod compile;
pub mod model;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use compile::parse_match;
pub use model::{PathPrefix, Rule, WarmupRule};

/// The configured rules, sorted by ascending priority (lower value wins).
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|rule| rule.priority);
        Self { rules }
    }

    /// Returns the first rule whose prefix union matches `path`, if any.
    pub fn pick(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// An entry is stale once it has sat longer than `expiration` since being
/// stored. A zero expiration means the rule's entries never go stale.
pub fn is_stale(stored_at: u64, expiration: Duration) -> bool {
    if expiration.is_zero() {
        return false;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_sub(stored_at) > expiration.as_secs()
}
