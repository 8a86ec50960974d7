use anyhow::{Result, bail};

use super::model::PathPrefix;

/// Parses a rule match expression: a `|`-separated union of
/// `PathPrefix(/some/path)` tokens. At least one valid token is required and
/// every prefix must start with `/`.
pub fn parse_match(expr: &str) -> Result<Vec<PathPrefix>> {
    let expr = expr.trim();
    if expr.is_empty() {
        bail!("empty match expression");
    }

    let mut matchers = Vec::new();
    for part in expr.split('|') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some(inside) = part
            .strip_prefix("PathPrefix(")
            .and_then(|rest| rest.strip_suffix(')'))
        else {
            bail!("only PathPrefix(...) is supported, got '{part}'");
        };
        let inside = inside.trim();
        if inside.is_empty() || !inside.starts_with('/') {
            bail!("invalid prefix '{inside}'");
        }
        matchers.push(PathPrefix::new(inside));
    }

    if matchers.is_empty() {
        bail!("no valid matchers in '{expr}'");
    }
    Ok(matchers)
}
