//! The workflow brain: validates jobs and drives them to completion.
//!
//! [`WorkflowBrain`] owns the scheduling loop. Phase input wiring and the
//! cross-unit aggregation live in [`wiring`]; the activation slot ceiling in
//! [`slots`].

pub mod engine;
pub mod report;
pub mod slots;
pub mod wiring;

pub use engine::{EngineError, WorkflowBrain, final_status};
pub use report::{JobReport, PhaseFailure};
pub use slots::{ActivationSlots, SlotGuard};
pub use wiring::{aggregate_unit_fields, assemble_global_inputs, assemble_unit_inputs};
