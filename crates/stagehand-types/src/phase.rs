//! Phase definitions, skip predicates, and phase execution records.
//!
//! A workflow is a static set of [`PhaseDefinition`]s declared up front. Each
//! phase either runs once per job (global) or once per unit (per-unit), may be
//! marked critical, may be skipped based on a closed [`SkipCondition`] over the
//! job options, and may be tied to the activation slot ceiling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FieldMap;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A workflow type: its designated root (validation) phase plus the phase graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow type name (e.g. "site-rollout").
    pub name: String,
    /// Global phase with no dependencies that populates the unit map.
    pub root_phase: String,
    /// Every phase of the workflow, including the root phase.
    pub phases: Vec<PhaseDefinition>,
}

// ---------------------------------------------------------------------------
// Phase definition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Unique phase id, also the key into the phase registry.
    pub id: String,
    /// Phase ids this phase depends on (graph edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-unit phases run once per unit; global phases run once per job.
    #[serde(default = "default_per_unit")]
    pub per_unit: bool,
    /// A failed critical phase aborts the owning unit's remaining phases.
    #[serde(default)]
    pub critical: bool,
    /// Skip this phase when the condition holds over the job options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<SkipCondition>,
    /// Relationship to the activation slot ceiling.
    #[serde(default)]
    pub activation_slot: ActivationSlot,
    /// Per-phase hard timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_per_unit() -> bool {
    true
}

impl PhaseDefinition {
    /// A per-unit phase with no dependencies.
    pub fn per_unit(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            per_unit: true,
            critical: false,
            skip_if: None,
            activation_slot: ActivationSlot::None,
            timeout_secs: None,
        }
    }

    /// A global phase with no dependencies.
    pub fn global(id: impl Into<String>) -> Self {
        Self {
            per_unit: false,
            ..Self::per_unit(id)
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn skip_if(mut self, condition: SkipCondition) -> Self {
        self.skip_if = Some(condition);
        self
    }

    pub fn activation_slot(mut self, slot: ActivationSlot) -> Self {
        self.activation_slot = slot;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// How a phase interacts with the scarce activation slot ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSlot {
    #[default]
    None,
    /// Starting this phase requires the unit to hold (or obtain) a slot.
    Acquire,
    /// Finishing this phase gives the unit's slot back.
    Release,
}

// ---------------------------------------------------------------------------
// Skip conditions
// ---------------------------------------------------------------------------

/// Closed predicate over job options deciding whether a phase is skipped.
///
/// Option names may be dotted paths into nested objects (`"network.mode"`).
/// A missing option is treated as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SkipCondition {
    Equals { option: String, value: Value },
    NotEquals { option: String, value: Value },
    Truthy { option: String },
    Falsy { option: String },
    Present { option: String },
    Absent { option: String },
    /// Option value is one of the listed values.
    OneOf { option: String, values: Vec<Value> },
    All { conditions: Vec<SkipCondition> },
    Any { conditions: Vec<SkipCondition> },
    Not { condition: Box<SkipCondition> },
}

impl SkipCondition {
    /// Evaluate the predicate against the job options.
    pub fn matches(&self, options: &FieldMap) -> bool {
        match self {
            Self::Equals { option, value } => lookup(options, option) == Some(value),
            Self::NotEquals { option, value } => lookup(options, option) != Some(value),
            Self::Truthy { option } => lookup(options, option).is_some_and(is_truthy),
            Self::Falsy { option } => !lookup(options, option).is_some_and(is_truthy),
            Self::Present { option } => lookup(options, option).is_some_and(|v| !v.is_null()),
            Self::Absent { option } => lookup(options, option).is_none_or(Value::is_null),
            Self::OneOf { option, values } => {
                lookup(options, option).is_some_and(|v| values.contains(v))
            }
            Self::All { conditions } => conditions.iter().all(|c| c.matches(options)),
            Self::Any { conditions } => conditions.iter().any(|c| c.matches(options)),
            Self::Not { condition } => !condition.matches(options),
        }
    }
}

fn lookup<'a>(options: &'a FieldMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = options.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Phase status and results
// ---------------------------------------------------------------------------

/// Status of a global phase within a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Can never run: a dependency failed or became unreachable.
    Blocked,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Blocked
        )
    }

    /// Whether dependents may treat this phase as done.
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Atomic transition applied to one (unit, phase) pair through the state contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitPhaseUpdate {
    /// The phase was dispatched and is now the unit's current phase.
    Started,
    Completed,
    /// Recorded as completed without running.
    Skipped,
    Failed { error: String, critical: bool },
    /// A dispatch found in the store with no live execution behind it.
    Interrupted,
}

/// Outcome of one phase execution, used to update unit and job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    /// Set for per-unit executions, `None` for global phases.
    pub unit_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub outputs: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl PhaseResult {
    pub fn succeeded(
        phase_id: impl Into<String>,
        unit_id: Option<String>,
        outputs: FieldMap,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            unit_id,
            success: true,
            outputs,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(
        phase_id: impl Into<String>,
        unit_id: Option<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            unit_id,
            success: false,
            outputs: FieldMap::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Output field names that describe an execution rather than the unit.
const METADATA_FIELDS: &[&str] = &[
    "success",
    "error",
    "status",
    "message",
    "duration_ms",
    "phase_id",
    "unit_id",
    "job_id",
];

/// Whether an output field is execution metadata and must not be merged into
/// a unit's resolved values. Fields prefixed with `_` are always metadata.
pub fn is_metadata_field(name: &str) -> bool {
    name.starts_with('_') || METADATA_FIELDS.contains(&name)
}
