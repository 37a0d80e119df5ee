//! Merge rule registry.
//!
//! Maps `(entity type, field path prefix)` to a [`MergeStrategy`]. Lookups
//! resolve by the longest matching prefix and fall back to the default
//! strategy (last-write-wins). The registry is validated when it is built
//! and read-only afterwards.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use shiftsync_protocol::{EntityType, FieldPath, MergeStrategy};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRule {
    /// Entity type the rule applies to.
    pub entity_type: EntityType,
    /// Field or subtree the rule covers.
    pub prefix: FieldPath,
    /// Strategy for fields under the prefix.
    pub strategy: MergeStrategy,
    /// Whether contention here is a safety matter. Only affects scoring.
    pub safety_critical: bool,
}

/// Allowed status moves for one entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl TransitionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the edge `from → to`.
    #[must_use]
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let to = to.into();
        self.edges.entry(to.clone()).or_default();
        self.edges.entry(from.into()).or_default().insert(to);
        self
    }

    /// Returns true if `from → to` is an edge.
    #[must_use]
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|next| next.contains(to))
    }

    /// Returns true if `state` appears in the graph.
    #[must_use]
    pub fn has_state(&self, state: &str) -> bool {
        self.edges.contains_key(state)
    }

    /// Iterates over all states.
    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }
}

/// Sign-off behavior for an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    /// Status field the sign-off transitions.
    pub status_path: FieldPath,
    /// Terminal state written by a sign-off.
    pub closed_state: String,
    /// Field stamped with the sign-off time.
    pub end_time_path: FieldPath,
}

/// Fixed ordinal table for the priority domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityScale {
    ranks: Vec<String>,
}

impl PriorityScale {
    /// Builds a scale from lowest to highest.
    pub fn new<I, S>(ranks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ranks: ranks.into_iter().map(Into::into).collect(),
        }
    }

    /// Rank of `label`, 1-based. Unknown labels rank 0.
    #[must_use]
    pub fn rank(&self, label: &str) -> usize {
        self.ranks
            .iter()
            .position(|r| r == label)
            .map_or(0, |i| i + 1)
    }
}

impl Default for PriorityScale {
    fn default() -> Self {
        Self::new(["LOW", "MEDIUM", "HIGH", "CRITICAL"])
    }
}

/// Validated, read-only rule table.
#[derive(Debug, Clone)]
pub struct MergeRuleRegistry {
    rules: HashMap<EntityType, Vec<MergeRule>>,
    default_strategy: MergeStrategy,
    transitions: HashMap<EntityType, TransitionGraph>,
    lifecycles: HashMap<EntityType, Lifecycle>,
    priority: PriorityScale,
}

impl MergeRuleRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry with no rules: everything is last-write-wins.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            default_strategy: MergeStrategy::LastWriteWins,
            transitions: HashMap::new(),
            lifecycles: HashMap::new(),
            priority: PriorityScale::default(),
        }
    }

    /// Strategy for `path`, by longest matching prefix.
    #[must_use]
    pub fn lookup(&self, entity_type: EntityType, path: &FieldPath) -> MergeStrategy {
        self.rule_for(entity_type, path)
            .map_or(self.default_strategy, |r| r.strategy)
    }

    /// The rule matching `path`, if any rule does.
    #[must_use]
    pub fn rule_for(&self, entity_type: EntityType, path: &FieldPath) -> Option<&MergeRule> {
        // Rules are kept deepest-first, so the first hit is the longest prefix.
        self.rules
            .get(&entity_type)?
            .iter()
            .find(|rule| rule.prefix.covers(path))
    }

    /// Strategy used when no rule matches.
    #[must_use]
    pub fn default_strategy(&self) -> MergeStrategy {
        self.default_strategy
    }

    /// Returns true if the rule covering `path` is marked safety-critical.
    #[must_use]
    pub fn is_safety_critical(&self, entity_type: EntityType, path: &FieldPath) -> bool {
        self.rule_for(entity_type, path)
            .is_some_and(|r| r.safety_critical)
    }

    /// Transition graph of an entity type.
    #[must_use]
    pub fn transitions(&self, entity_type: EntityType) -> Option<&TransitionGraph> {
        self.transitions.get(&entity_type)
    }

    /// Sign-off behavior of an entity type.
    #[must_use]
    pub fn lifecycle(&self, entity_type: EntityType) -> Option<&Lifecycle> {
        self.lifecycles.get(&entity_type)
    }

    /// The priority ordinal table.
    #[must_use]
    pub fn priority(&self) -> &PriorityScale {
        &self.priority
    }

    /// All rules of an entity type, deepest prefix first.
    #[must_use]
    pub fn rules(&self, entity_type: EntityType) -> &[MergeRule] {
        self.rules.get(&entity_type).map_or(&[][..], Vec::as_slice)
    }

    /// Builds a registry from deserialized configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRegistry`] if the configuration fails
    /// validation.
    pub fn from_config(config: RegistryConfig) -> CoreResult<Self> {
        let mut builder = Self::builder().default_strategy(config.default_strategy);
        for rule in config.rules {
            builder = if rule.safety_critical {
                builder.safety_rule(rule.entity_type, &rule.path, rule.strategy)
            } else {
                builder.rule(rule.entity_type, &rule.path, rule.strategy)
            };
        }
        for graph in config.transitions {
            let mut g = TransitionGraph::new();
            for (from, to) in graph.edges {
                g = g.edge(from, to);
            }
            builder = builder.transitions(graph.entity_type, g);
        }
        for lc in config.lifecycles {
            builder = builder.lifecycle(lc.entity_type, &lc.status_path, lc.closed_state, &lc.end_time_path);
        }
        if !config.priority_ranks.is_empty() {
            builder = builder.priority(PriorityScale::new(config.priority_ranks));
        }
        builder.build()
    }

    /// Parses a JSON [`RegistryConfig`] and builds it.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON or invalid rules.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: RegistryConfig = serde_json::from_str(json)
            .map_err(|e| CoreError::invalid_registry(format!("bad rule file: {e}")))?;
        Self::from_config(config)
    }

    /// The mining shift-handover rule set.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in table itself is inconsistent.
    pub fn standard() -> CoreResult<Self> {
        use EntityType::{Action, Asset, Shift};
        use MergeStrategy::*;

        let shift_status = TransitionGraph::new()
            .edge("OPEN", "IN_PROGRESS")
            .edge("IN_PROGRESS", "CLOSED");
        let action_status = TransitionGraph::new()
            .edge("OPEN", "IN_PROGRESS")
            .edge("OPEN", "CANCELLED")
            .edge("IN_PROGRESS", "CLOSED")
            .edge("IN_PROGRESS", "CANCELLED");

        Self::builder()
            .transitions(Shift, shift_status)
            .transitions(Action, action_status)
            .lifecycle(Shift, "status", "CLOSED", "endTime")
            .lifecycle(Action, "status", "CLOSED", "completedAt")
            // shift
            .rule(Shift, "status", Monotonic)
            .rule(Shift, "startTime", MinValue)
            .rule(Shift, "endTime", MaxValue)
            .safety_rule(Shift, "safety.incidents", AppendOnly)
            .safety_rule(Shift, "safety.hazards", SetUnion)
            .rule(Shift, "safety.toolboxTalks", AppendOnly)
            .rule(Shift, "safety.ppeIssues", SetUnion)
            .safety_rule(Shift, "safety.safetyMetrics.totalIncidents", MaxValue)
            .rule(Shift, "safety.safetyMetrics.nearMisses", MaxValue)
            .rule(Shift, "safety.safetyMetrics.complianceScore", MinValue)
            .safety_rule(Shift, "safety.safetyMetrics.daysWithoutIncident", MinValue)
            .rule(Shift, "production.tonnes.mined", MaxValue)
            .rule(Shift, "production.tonnes.hauled", MaxValue)
            .rule(Shift, "production.tonnes.processed", MaxValue)
            .rule(Shift, "production.tonnes.target", LastWriteWins)
            .rule(Shift, "production.grade.actual", LastWriteWins)
            .rule(Shift, "production.grade.samples", MaxValue)
            .rule(Shift, "production.romLevels", LastWriteWins)
            .rule(Shift, "production.delays", AppendOnly)
            .rule(Shift, "equipment.assets", LastWriteWins)
            .rule(Shift, "equipment.breakdowns", SetUnion)
            .rule(Shift, "equipment.maintenance", SetUnion)
            .rule(Shift, "equipment.inspections", AppendOnly)
            .rule(Shift, "issues.openIssues", SetUnion)
            .rule(Shift, "issues.newIssues", AppendOnly)
            .rule(Shift, "issues.escalations", AppendOnly)
            .rule(Shift, "issues.communications", AppendOnly)
            // action
            .rule(Action, "status", Monotonic)
            .rule(Action, "priority", MaxValue)
            .rule(Action, "assignedTo", LastWriteWins)
            .rule(Action, "dueTime", MinValue)
            .rule(Action, "evidence", AppendOnly)
            .rule(Action, "description", LastWriteWins)
            // asset
            .rule(Asset, "status", LastWriteWins)
            .rule(Asset, "metrics.operatingHours", MaxValue)
            .rule(Asset, "metrics.fuelConsumption", Additive)
            .rule(Asset, "lastMaint", MaxValue)
            .rule(Asset, "nextMaint", MinValue)
            .build()
    }
}

/// Builder for [`MergeRuleRegistry`]. Errors surface at [`build`](Self::build).
#[derive(Debug)]
pub struct RegistryBuilder {
    rules: Vec<MergeRule>,
    default_strategy: MergeStrategy,
    transitions: HashMap<EntityType, TransitionGraph>,
    lifecycles: HashMap<EntityType, Lifecycle>,
    priority: PriorityScale,
    errors: Vec<String>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_strategy: MergeStrategy::LastWriteWins,
            transitions: HashMap::new(),
            lifecycles: HashMap::new(),
            priority: PriorityScale::default(),
            errors: Vec::new(),
        }
    }
}

impl RegistryBuilder {
    fn push_rule(mut self, entity_type: EntityType, prefix: &str, strategy: MergeStrategy, safety_critical: bool) -> Self {
        match FieldPath::parse(prefix) {
            Ok(prefix) => self.rules.push(MergeRule {
                entity_type,
                prefix,
                strategy,
                safety_critical,
            }),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Adds a rule.
    #[must_use]
    pub fn rule(self, entity_type: EntityType, prefix: &str, strategy: MergeStrategy) -> Self {
        self.push_rule(entity_type, prefix, strategy, false)
    }

    /// Adds a rule marked safety-critical.
    #[must_use]
    pub fn safety_rule(self, entity_type: EntityType, prefix: &str, strategy: MergeStrategy) -> Self {
        self.push_rule(entity_type, prefix, strategy, true)
    }

    /// Sets the fallback strategy.
    #[must_use]
    pub fn default_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Sets the transition graph of an entity type.
    #[must_use]
    pub fn transitions(mut self, entity_type: EntityType, graph: TransitionGraph) -> Self {
        self.transitions.insert(entity_type, graph);
        self
    }

    /// Sets the sign-off behavior of an entity type.
    #[must_use]
    pub fn lifecycle(
        mut self,
        entity_type: EntityType,
        status_path: &str,
        closed_state: impl Into<String>,
        end_time_path: &str,
    ) -> Self {
        match (FieldPath::parse(status_path), FieldPath::parse(end_time_path)) {
            (Ok(status_path), Ok(end_time_path)) => {
                self.lifecycles.insert(
                    entity_type,
                    Lifecycle {
                        status_path,
                        closed_state: closed_state.into(),
                        end_time_path,
                    },
                );
            }
            (Err(e), _) | (_, Err(e)) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Replaces the priority ordinal table.
    #[must_use]
    pub fn priority(mut self, scale: PriorityScale) -> Self {
        self.priority = scale;
        self
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRegistry`] for malformed paths, duplicate
    /// rules, monotonic rules without a transition graph, or a sign-off
    /// state missing from its graph.
    pub fn build(self) -> CoreResult<MergeRuleRegistry> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(CoreError::invalid_registry(first));
        }

        let mut seen = BTreeSet::new();
        let mut rules: HashMap<EntityType, Vec<MergeRule>> = HashMap::new();
        for rule in self.rules {
            if !seen.insert((rule.entity_type, rule.prefix.clone())) {
                return Err(CoreError::invalid_registry(format!(
                    "duplicate rule for {}/{}",
                    rule.entity_type, rule.prefix
                )));
            }
            if rule.strategy == MergeStrategy::Monotonic && !self.transitions.contains_key(&rule.entity_type) {
                return Err(CoreError::invalid_registry(format!(
                    "monotonic rule {}/{} has no transition graph",
                    rule.entity_type, rule.prefix
                )));
            }
            rules.entry(rule.entity_type).or_default().push(rule);
        }
        for list in rules.values_mut() {
            list.sort_by(|a, b| {
                b.prefix
                    .depth()
                    .cmp(&a.prefix.depth())
                    .then_with(|| a.prefix.cmp(&b.prefix))
            });
        }

        for (entity_type, lc) in &self.lifecycles {
            if let Some(graph) = self.transitions.get(entity_type) {
                if !graph.has_state(&lc.closed_state) {
                    return Err(CoreError::invalid_registry(format!(
                        "sign-off state {} is not in the {entity_type} transition graph",
                        lc.closed_state
                    )));
                }
            }
        }

        Ok(MergeRuleRegistry {
            rules,
            default_strategy: self.default_strategy,
            transitions: self.transitions,
            lifecycles: self.lifecycles,
            priority: self.priority,
        })
    }
}

/// Serializable rule table, e.g. loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Fallback strategy.
    #[serde(default = "default_strategy")]
    pub default_strategy: MergeStrategy,
    /// Rules.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Transition graphs.
    #[serde(default)]
    pub transitions: Vec<TransitionConfig>,
    /// Sign-off behaviors.
    #[serde(default)]
    pub lifecycles: Vec<LifecycleConfig>,
    /// Priority labels, lowest first. Empty keeps the default scale.
    #[serde(default)]
    pub priority_ranks: Vec<String>,
}

fn default_strategy() -> MergeStrategy {
    MergeStrategy::LastWriteWins
}

/// One rule in a [`RegistryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Entity type.
    pub entity_type: EntityType,
    /// Path prefix.
    pub path: String,
    /// Strategy.
    pub strategy: MergeStrategy,
    /// Safety-critical marker.
    #[serde(default)]
    pub safety_critical: bool,
}

/// A transition graph in a [`RegistryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Entity type.
    pub entity_type: EntityType,
    /// `[from, to]` pairs.
    pub edges: Vec<(String, String)>,
}

/// A sign-off behavior in a [`RegistryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Entity type.
    pub entity_type: EntityType,
    /// Status field.
    pub status_path: String,
    /// Terminal state.
    pub closed_state: String,
    /// End-time field.
    pub end_time_path: String,
}
