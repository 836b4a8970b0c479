use crate::types::{AgentId, AgentProfile};
use conductor_core::{ConductorError, ConductorResult};
use regex::Regex;
use tracing::debug;

const MENTION_PATTERN: &str = r"@agent-([\w-]+)";

/// Extracts explicit `@agent-<name>` mentions from request text.
///
/// A mention resolves to the profile whose id equals `<name>`, or to the only
/// profile whose id starts with `<name>-` (so `@agent-backend` names
/// `backend-services`). Ambiguous and unknown mentions are ignored.
#[derive(Debug, Clone)]
pub struct MentionParser {
    pattern: Regex,
}

impl MentionParser {
    /// Create a new parser.
    pub fn new() -> ConductorResult<Self> {
        let pattern = Regex::new(MENTION_PATTERN)
            .map_err(|e| ConductorError::Config(format!("invalid mention pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Mentioned names, lower-cased, first occurrence order, without duplicates.
    pub fn parse(&self, text: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.pattern.captures_iter(text) {
            let Some(name) = caps.get(1) else {
                continue;
            };
            let name = name.as_str().trim_end_matches('-').to_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Ids of the mentioned agents found in `profiles`, in mention order.
    pub fn resolve(&self, text: &str, profiles: &[&AgentProfile]) -> Vec<AgentId> {
        let mut resolved: Vec<AgentId> = Vec::new();
        for name in self.parse(text) {
            let id = match profiles.iter().find(|p| p.id.eq_ignore_ascii_case(&name)) {
                Some(profile) => Some(profile.id.clone()),
                None => {
                    let prefix = format!("{name}-");
                    let mut candidates = profiles
                        .iter()
                        .filter(|p| p.id.to_lowercase().starts_with(&prefix));
                    match (candidates.next(), candidates.next()) {
                        (Some(profile), None) => Some(profile.id.clone()),
                        _ => None,
                    }
                }
            };
            match id {
                Some(id) if !resolved.contains(&id) => resolved.push(id),
                Some(_) => {}
                None => debug!(mention = %name, "Mention does not name a single known agent"),
            }
        }
        resolved
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::profiles::default_profiles;

    #[test]
    fn test_parse_mentions_in_order_without_duplicates() {
        let parser = MentionParser::new().unwrap();
        let names = parser.parse("@agent-Security, then @agent-deployment. Ping @agent-security again");
        assert_eq!(names, vec!["security", "deployment"]);
        assert!(parser.parse("mail me at dev@example.com").is_empty());
    }

    #[test]
    fn test_trailing_dash_is_dropped() {
        let parser = MentionParser::new().unwrap();
        assert_eq!(parser.parse("ask @agent-testing- now"), vec!["testing"]);
    }

    #[test]
    fn test_resolve_exact_and_prefix() {
        let parser = MentionParser::new().unwrap();
        let profiles = default_profiles();
        let refs: Vec<&AgentProfile> = profiles.iter().collect();

        let ids = parser.resolve(
            "@agent-backend and @agent-deployment, also @agent-frontend and @agent-ghost",
            &refs,
        );
        // "frontend" matches two profiles and "ghost" none.
        assert_eq!(ids, vec!["backend-services", "deployment"]);
    }
}
