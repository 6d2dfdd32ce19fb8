//! Phase executor trait and its type-erased wrapper.
//!
//! A phase implementation declares the input and output field names it deals
//! in and turns one input map into one output map. The brain only ever calls
//! through [`BoxPhaseExecutor`]; it never sees the concrete type and never
//! inspects field semantics, only names and coarse kinds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_types::error::PhaseError;
use stagehand_types::FieldMap;

use super::context::PhaseContext;

// ---------------------------------------------------------------------------
// Field declarations
// ---------------------------------------------------------------------------

/// Coarse JSON shape a declared field must have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Any,
    Number,
    Text,
    Bool,
    List,
    Map,
}

impl FieldKind {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Number => value.is_number(),
            Self::Text => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Number => "number",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

/// One declared input or output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseExecutor
// ---------------------------------------------------------------------------

/// Business logic for one phase.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for `execute`. Use
/// [`BoxPhaseExecutor`] where the concrete type must be erased.
pub trait PhaseExecutor: Send + Sync {
    /// Fields assembled from unit/job state before `execute` is called.
    fn inputs(&self) -> &[FieldSpec];

    /// Fields this phase may produce. Informational; undeclared outputs are
    /// still merged into the unit's resolved values.
    fn outputs(&self) -> &[FieldSpec] {
        &[]
    }

    fn execute(
        &self,
        ctx: &PhaseContext,
        inputs: FieldMap,
    ) -> impl Future<Output = Result<FieldMap, PhaseError>> + Send;
}

/// Object-safe version of [`PhaseExecutor`] with a boxed future.
pub trait PhaseExecutorDyn: Send + Sync {
    fn inputs_dyn(&self) -> &[FieldSpec];
    fn outputs_dyn(&self) -> &[FieldSpec];
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a PhaseContext,
        inputs: FieldMap,
    ) -> Pin<Box<dyn Future<Output = Result<FieldMap, PhaseError>> + Send + 'a>>;
}

impl<T: PhaseExecutor> PhaseExecutorDyn for T {
    fn inputs_dyn(&self) -> &[FieldSpec] {
        self.inputs()
    }

    fn outputs_dyn(&self) -> &[FieldSpec] {
        self.outputs()
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a PhaseContext,
        inputs: FieldMap,
    ) -> Pin<Box<dyn Future<Output = Result<FieldMap, PhaseError>> + Send + 'a>> {
        Box::pin(self.execute(ctx, inputs))
    }
}

/// Type-erased phase executor.
#[derive(Clone)]
pub struct BoxPhaseExecutor {
    inner: Arc<dyn PhaseExecutorDyn>,
}

impl BoxPhaseExecutor {
    pub fn new<T: PhaseExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub fn inputs(&self) -> &[FieldSpec] {
        self.inner.inputs_dyn()
    }

    pub fn outputs(&self) -> &[FieldSpec] {
        self.inner.outputs_dyn()
    }

    pub async fn execute(&self, ctx: &PhaseContext, inputs: FieldMap) -> Result<FieldMap, PhaseError> {
        self.inner.execute_boxed(ctx, inputs).await
    }
}

impl std::fmt::Debug for BoxPhaseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxPhaseExecutor")
            .field("inputs", &self.inputs())
            .finish_non_exhaustive()
    }
}
