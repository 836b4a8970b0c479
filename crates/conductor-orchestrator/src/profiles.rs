use crate::types::{AgentId, AgentProfile};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Read-only lookup of agent capability profiles.
pub trait CapabilityRegistry: Send + Sync {
    /// Profile for `agent_id`, if registered.
    fn lookup(&self, agent_id: &str) -> Option<&AgentProfile>;

    /// All registered profiles, ordered by id.
    fn profiles(&self) -> Vec<&AgentProfile>;
}

/// In-memory registry built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<AgentId, AgentProfile>,
}

impl ProfileRegistry {
    /// Create a new registry. A later duplicate id replaces the earlier one.
    pub fn new(profiles: impl IntoIterator<Item = AgentProfile>) -> Self {
        let mut map = BTreeMap::new();
        for profile in profiles {
            if map.contains_key(&profile.id) {
                warn!(agent = %profile.id, "Duplicate agent profile, keeping the last one");
            }
            debug!(agent = %profile.id, tags = profile.capability_tags.len(), "Registered profile");
            map.insert(profile.id.clone(), profile);
        }
        Self { profiles: map }
    }

    /// Registry holding [`default_profiles`].
    pub fn with_defaults() -> Self {
        Self::new(default_profiles())
    }

    /// Number of registered profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// True when no profile is registered.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl CapabilityRegistry for ProfileRegistry {
    fn lookup(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.profiles.get(agent_id)
    }

    fn profiles(&self) -> Vec<&AgentProfile> {
        self.profiles.values().collect()
    }
}

/// Declared dependencies between agents, used to turn a selection into tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyRules {
    rules: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

impl DependencyRules {
    /// Create a new empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `agent = [dependencies]` entries.
    pub fn from_map(map: &BTreeMap<String, Vec<String>>) -> Self {
        let rules = map
            .iter()
            .map(|(agent, deps)| (agent.clone(), deps.iter().cloned().collect()))
            .collect();
        Self { rules }
    }

    /// Declare that `agent` runs after `depends_on`.
    pub fn add(&mut self, agent: impl Into<String>, depends_on: impl Into<String>) {
        self.rules
            .entry(agent.into())
            .or_default()
            .insert(depends_on.into());
    }

    /// Agents `agent` runs after.
    pub fn dependencies_of(&self, agent: &str) -> impl Iterator<Item = &AgentId> {
        self.rules.get(agent).into_iter().flatten()
    }

    /// True when no rule is declared.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Built-in dependency rules of the development pipeline.
pub fn default_dependency_rules() -> DependencyRules {
    let mut rules = DependencyRules::new();
    rules.add("business-analyst", "prompt-engineer");
    rules.add("technical-cto", "business-analyst");
    rules.add("technical-specifications", "technical-cto");
    rules.add("frontend-architecture", "technical-specifications");
    rules.add("database-architecture", "technical-specifications");
    rules.add("backend-services", "technical-specifications");
    rules.add("backend-services", "database-architecture");
    rules.add("frontend-mockup", "frontend-architecture");
    rules.add("production-frontend", "frontend-architecture");
    rules.add("production-frontend", "frontend-mockup");
    rules.add("testing-automation", "backend-services");
    rules.add("testing-automation", "production-frontend");
    rules.add("deployment", "testing-automation");
    rules.add("deployment", "security-architecture");
    rules
}

/// Default capability profiles for the development pipeline.
pub fn default_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile::new(
            "master-orchestrator",
            ["orchestration", "coordination", "planning", "workflow"],
        )
        .with_description("Coordinates multi-agent work and owns the overall plan")
        .with_cost(5.0, 256)
        .with_max_input_tokens(32_000),
        AgentProfile::new(
            "prompt-engineer",
            ["prompt", "requirements", "clarify", "planning"],
        )
        .with_description("Refines vague requests into precise instructions")
        .with_cost(5.0, 128)
        .with_max_input_tokens(16_000),
        AgentProfile::new(
            "business-analyst",
            ["business", "requirements", "market", "stakeholder", "planning"],
        )
        .with_description("Analyzes business requirements and value")
        .with_cost(10.0, 256),
        AgentProfile::new(
            "technical-cto",
            ["architecture", "technology", "feasibility", "stack", "design"],
        )
        .with_description("Evaluates technical feasibility and technology choices")
        .with_cost(10.0, 256)
        .with_max_input_tokens(16_000),
        AgentProfile::new(
            "technical-specifications",
            ["specification", "spec", "interface", "contract", "design"],
        )
        .with_description("Writes technical specifications and interface contracts")
        .with_cost(10.0, 256)
        .with_max_input_tokens(16_000),
        AgentProfile::new(
            "database-architecture",
            ["database", "schema", "sql", "migration", "design"],
        )
        .with_description("Designs schemas, indexes and migrations")
        .with_cost(15.0, 512),
        AgentProfile::new(
            "frontend-architecture",
            ["frontend", "ui", "component", "react", "design"],
        )
        .with_description("Plans frontend structure and component boundaries")
        .with_cost(15.0, 512),
        AgentProfile::new("frontend-mockup", ["mockup", "ui", "html", "css", "prototype"])
            .with_description("Produces clickable prototypes")
            .with_cost(10.0, 256),
        AgentProfile::new(
            "backend-services",
            ["api", "backend", "service", "rust", "server", "implementation"],
        )
        .with_description("Implements backend services and APIs")
        .with_cost(20.0, 768)
        .with_max_input_tokens(24_000),
        AgentProfile::new(
            "production-frontend",
            ["frontend", "react", "typescript", "ui", "implementation"],
        )
        .with_description("Implements production frontend code")
        .with_cost(20.0, 768)
        .with_max_input_tokens(24_000),
        AgentProfile::new(
            "security-architecture",
            ["security", "auth", "threat", "vulnerability", "audit"],
        )
        .with_description("Threat models and reviews security posture")
        .with_cost(10.0, 256),
        AgentProfile::new(
            "testing-automation",
            ["test", "testing", "qa", "coverage", "integration"],
        )
        .with_description("Writes and runs automated tests")
        .with_cost(25.0, 1_024),
        AgentProfile::new(
            "deployment",
            ["deploy", "deployment", "docker", "ci", "kubernetes", "release"],
        )
        .with_description("Ships builds to target environments")
        .with_cost(15.0, 512),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_unique_ids() {
        let profiles = default_profiles();
        let ids: BTreeSet<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), profiles.len());
    }

    #[test]
    fn test_profiles_have_tags_and_budget() {
        for profile in default_profiles() {
            assert!(!profile.capability_tags.is_empty(), "{} has no tags", profile.id);
            assert!(profile.max_input_tokens > 0);
            assert!(!profile.description.is_empty());
        }
    }

    #[test]
    fn test_default_rules_reference_known_agents() {
        let registry = ProfileRegistry::with_defaults();
        let rules = default_dependency_rules();
        for profile in registry.profiles() {
            for dep in rules.dependencies_of(&profile.id) {
                assert!(registry.lookup(dep).is_some(), "unknown dependency {dep}");
            }
        }
    }

    #[test]
    fn test_registry_lookup_and_order() {
        let registry = ProfileRegistry::new(vec![
            AgentProfile::new("zeta", ["z"]),
            AgentProfile::new("alpha", ["a"]),
        ]);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("alpha").is_some());
        assert!(registry.lookup("beta").is_none());
        let ids: Vec<&str> = registry.profiles().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_rules_from_map() {
        let mut map = BTreeMap::new();
        map.insert("c".to_string(), vec!["a".to_string(), "b".to_string()]);
        let rules = DependencyRules::from_map(&map);
        let deps: Vec<&String> = rules.dependencies_of("c").collect();
        assert_eq!(deps.len(), 2);
        assert_eq!(rules.dependencies_of("a").count(), 0);
    }
}
