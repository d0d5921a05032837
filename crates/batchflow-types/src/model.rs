//! Job model: the resolved job definition the engine navigates.
//!
//! Descriptor parsing and property substitution happen before the engine sees
//! a job; what arrives here is a fully resolved tree of execution elements
//! (steps, decisions, flows, splits) with their transition rules. The model
//! is serde-serializable so that a job instance can store its definition and
//! re-resolve it on restart.

use serde::{Deserialize, Serialize};

use crate::execution::Properties;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A resolved job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Job name; also the name of the job instances created from it.
    pub id: String,
    /// Whether a failed or stopped execution may be restarted.
    #[serde(default = "default_true")]
    pub restartable: bool,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub listeners: Vec<ArtifactRef>,
    /// Top-level execution elements; the first one is the entry point.
    pub elements: Vec<ExecutionElement>,
}

impl JobDefinition {
    /// Serialize for storage on the job instance.
    pub fn to_descriptor(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rebuild a definition stored with [`JobDefinition::to_descriptor`].
    pub fn from_descriptor(descriptor: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(descriptor)
    }

    /// Check structural rules that do not need a running engine.
    ///
    /// Element ids must be unique across the whole tree, every scope must
    /// contain at least one element, and `next`/transition targets must name
    /// an element of the same scope.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.elements.is_empty() {
            return Err(ModelError::EmptyScope(self.id.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        validate_scope(&self.id, &self.elements, &mut seen)
    }
}

fn validate_scope(
    scope: &str,
    elements: &[ExecutionElement],
    seen: &mut std::collections::HashSet<String>,
) -> Result<(), ModelError> {
    if elements.is_empty() {
        return Err(ModelError::EmptyScope(scope.to_string()));
    }
    for element in elements {
        if !seen.insert(element.id().to_string()) {
            return Err(ModelError::DuplicateId(element.id().to_string()));
        }
        let targets = element
            .next()
            .into_iter()
            .chain(element.transitions().iter().filter_map(|t| match t {
                Transition::Next { to, .. } => Some(to.as_str()),
                _ => None,
            }));
        for target in targets {
            if find_element(elements, target).is_none() {
                return Err(ModelError::UnknownTarget {
                    from: element.id().to_string(),
                    to: target.to_string(),
                });
            }
        }
        match element {
            ExecutionElement::Flow(flow) => validate_scope(&flow.id, &flow.elements, seen)?,
            ExecutionElement::Split(split) => {
                if split.flows.is_empty() {
                    return Err(ModelError::EmptyScope(split.id.clone()));
                }
                for flow in &split.flows {
                    if !seen.insert(flow.id.clone()) {
                        return Err(ModelError::DuplicateId(flow.id.clone()));
                    }
                    validate_scope(&flow.id, &flow.elements, seen)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Look up an element of one scope by id.
pub fn find_element<'a>(elements: &'a [ExecutionElement], id: &str) -> Option<&'a ExecutionElement> {
    elements.iter().find(|e| e.id() == id)
}

/// Structural errors in a job definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("scope '{0}' has no execution elements")]
    EmptyScope(String),

    #[error("duplicate element id '{0}'")]
    DuplicateId(String),

    #[error("element '{from}' transitions to unknown element '{to}'")]
    UnknownTarget { from: String, to: String },
}

// ---------------------------------------------------------------------------
// Execution elements
// ---------------------------------------------------------------------------

/// One node of the job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionElement {
    Step(StepDefinition),
    Decision(DecisionDefinition),
    Flow(FlowDefinition),
    Split(SplitDefinition),
}

impl ExecutionElement {
    pub fn id(&self) -> &str {
        match self {
            ExecutionElement::Step(s) => &s.id,
            ExecutionElement::Decision(d) => &d.id,
            ExecutionElement::Flow(f) => &f.id,
            ExecutionElement::Split(s) => &s.id,
        }
    }

    /// Transition rules in descriptor order.
    pub fn transitions(&self) -> &[Transition] {
        match self {
            ExecutionElement::Step(s) => &s.transitions,
            ExecutionElement::Decision(d) => &d.transitions,
            ExecutionElement::Flow(f) => &f.transitions,
            ExecutionElement::Split(_) => &[],
        }
    }

    /// The `next` attribute, consulted when no transition rule matches.
    pub fn next(&self) -> Option<&str> {
        match self {
            ExecutionElement::Step(s) => s.next.as_deref(),
            ExecutionElement::Decision(_) => None,
            ExecutionElement::Flow(f) => f.next.as_deref(),
            ExecutionElement::Split(s) => s.next.as_deref(),
        }
    }

    pub fn is_decision(&self) -> bool {
        matches!(self, ExecutionElement::Decision(_))
    }
}

/// A reference to a pluggable artifact plus its injected properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A step: chunk-oriented or task-oriented, optionally partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Maximum number of starts; 0 means unlimited. Negative values are a
    /// configuration error detected when the step is restarted.
    #[serde(default)]
    pub start_limit: i32,
    #[serde(default)]
    pub allow_start_if_complete: bool,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub listeners: Vec<ArtifactRef>,
    pub body: StepBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionDefinition>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl StepDefinition {
    /// The step as run by each partition: same body, no partition block.
    pub fn without_partition(&self) -> StepDefinition {
        StepDefinition {
            partition: None,
            next: None,
            transitions: Vec::new(),
            ..self.clone()
        }
    }
}

/// Body of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepBody {
    Chunk(ChunkDefinition),
    Batchlet(ArtifactRef),
}

/// Chunk-oriented processing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDefinition {
    pub reader: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<ArtifactRef>,
    pub writer: ArtifactRef,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    /// Items per chunk; engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    /// Seconds per chunk; engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u32>,
    /// Total skippable errors tolerated; `None` means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_limit: Option<u32>,
    #[serde(default)]
    pub skippable: ErrorClassifier,
}

/// How chunk boundaries are decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    Item,
    Custom { algorithm: ArtifactRef },
}

/// Include/exclude lists of error kinds.
///
/// A kind matches when it is included (or `"*"` is included) and not
/// explicitly excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassifier {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ErrorClassifier {
    pub fn matches(&self, kind: &str) -> bool {
        if self.exclude.iter().any(|k| k == kind) {
            return false;
        }
        self.include.iter().any(|k| k == kind || k == "*")
    }
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

/// Partitioning of a step into independently executed units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDefinition {
    pub plan: PartitionPlanSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<ArtifactRef>,
}

/// Where the partition plan comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionPlanSource {
    Static(PartitionPlan),
    Mapper { mapper: ArtifactRef },
}

/// Number of partitions, concurrency, and per-partition properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partitions: u32,
    /// Partitions run at once; defaults to `partitions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default)]
    pub partition_properties: Vec<Properties>,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            threads: None,
            partition_properties: Vec::new(),
        }
    }

    pub fn effective_threads(&self) -> u32 {
        self.threads
            .filter(|t| *t > 0)
            .unwrap_or(self.partitions)
            .min(self.partitions)
            .max(1)
    }

    pub fn properties_for(&self, partition: u32) -> Properties {
        self.partition_properties
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Decision / Flow / Split
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionDefinition {
    pub id: String,
    pub decider: ArtifactRef,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub elements: Vec<ExecutionElement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitDefinition {
    pub id: String,
    pub flows: Vec<FlowDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A transition rule, matched against an element's exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Next {
        on: String,
        to: String,
    },
    End {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    Fail {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    Stop {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<String>,
    },
}

impl Transition {
    /// The `on` pattern (`*` and `?` wildcards).
    pub fn on(&self) -> &str {
        match self {
            Transition::Next { on, .. }
            | Transition::End { on, .. }
            | Transition::Fail { on, .. }
            | Transition::Stop { on, .. } => on,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
