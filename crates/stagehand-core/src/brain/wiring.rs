//! Input/output wiring between phases.
//!
//! Phases never talk to each other directly. A phase's declared inputs are
//! looked up by name in the unit and job state, and its outputs are merged
//! back into the unit's `resolved` bag where later phases find them.
//!
//! # Lookup order
//!
//! For a per-unit phase, each declared input is taken from the first place
//! that has a non-null value:
//!
//! 1. the unit's `resolved` values
//! 2. the unit's `plan`
//! 3. the unit's `input_config`
//! 4. unit identity (`unit_id`, `unit_number`)
//! 5. outputs of completed global phases
//! 6. job options
//! 7. the free-form `extra` maps on `plan`, then `resolved`
//!
//! A global phase sees the aggregate of its inputs across units first, then
//! global outputs and job options.

use serde_json::{Number, Value};
use stagehand_types::error::PhaseError;
use stagehand_types::job::Job;
use stagehand_types::unit::{Unit, UnitStatus};
use stagehand_types::FieldMap;

use crate::phase::FieldSpec;

/// Key of the free-form map consulted last.
pub const EXTRA_FIELD: &str = "extra";

/// Assemble the declared inputs of a per-unit phase.
pub fn assemble_unit_inputs(specs: &[FieldSpec], unit: &Unit, job: &Job) -> Result<FieldMap, PhaseError> {
    collect(specs, |name| {
        non_null(unit.resolved.get(name))
            .or_else(|| non_null(unit.plan.get(name)))
            .or_else(|| non_null(unit.input_config.get(name)))
            .or_else(|| identity(unit, name))
            .or_else(|| global_output(job, name))
            .or_else(|| non_null(job.options.get(name)))
            .or_else(|| extra(&unit.plan, name))
            .or_else(|| extra(&unit.resolved, name))
    })
}

/// Assemble the declared inputs of a global phase. `aggregated` holds the
/// cross-unit aggregate of the same fields.
pub fn assemble_global_inputs(
    specs: &[FieldSpec],
    job: &Job,
    aggregated: &FieldMap,
) -> Result<FieldMap, PhaseError> {
    collect(specs, |name| {
        non_null(aggregated.get(name))
            .or_else(|| global_output(job, name))
            .or_else(|| non_null(job.options.get(name)))
    })
}

fn collect(specs: &[FieldSpec], lookup: impl Fn(&str) -> Option<Value>) -> Result<FieldMap, PhaseError> {
    let mut inputs = FieldMap::new();
    for spec in specs {
        match lookup(&spec.name) {
            Some(value) if !spec.kind.accepts(&value) => {
                return Err(PhaseError::InvalidInput {
                    field: spec.name.clone(),
                    expected: spec.kind.as_str().to_string(),
                });
            }
            Some(value) => {
                inputs.insert(spec.name.clone(), value);
            }
            None if spec.required => return Err(PhaseError::MissingInput(spec.name.clone())),
            None => {}
        }
    }
    Ok(inputs)
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

fn identity(unit: &Unit, name: &str) -> Option<Value> {
    match name {
        "unit_id" => Some(Value::String(unit.unit_id.clone())),
        "unit_number" => Some(Value::from(unit.unit_number)),
        _ => None,
    }
}

/// First completed global phase, in declaration order, that output `name`.
fn global_output(job: &Job, name: &str) -> Option<Value> {
    job.phase_definitions
        .iter()
        .filter(|p| !p.per_unit && job.global_status(&p.id).is_satisfied())
        .filter_map(|p| job.global_phase_results.get(&p.id))
        .find_map(|outputs| non_null(outputs.get(name)))
}

fn extra(bag: &FieldMap, name: &str) -> Option<Value> {
    bag.get(EXTRA_FIELD)
        .and_then(Value::as_object)
        .and_then(|extra| non_null(extra.get(name)))
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Combine `fields` from every non-failed unit's resolved values, in unit
/// order.
///
/// Numbers sum, maps merge with later units winning on key collision, lists
/// concatenate, and anything else takes the last non-null value. Mismatched
/// shapes also take the last non-null value.
pub fn aggregate_unit_fields<'a>(
    units: impl IntoIterator<Item = &'a Unit>,
    fields: &[&str],
) -> FieldMap {
    let mut units: Vec<&Unit> = units
        .into_iter()
        .filter(|u| u.status != UnitStatus::Failed)
        .collect();
    units.sort_by(|a, b| {
        a.unit_number
            .cmp(&b.unit_number)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });

    let mut aggregated = FieldMap::new();
    for field in fields {
        let mut acc: Option<Value> = None;
        for unit in &units {
            let Some(value) = non_null(unit.resolved.get(*field)) else {
                continue;
            };
            acc = Some(match acc {
                Some(prev) => combine(prev, value),
                None => value,
            });
        }
        if let Some(value) = acc {
            aggregated.insert((*field).to_string(), value);
        }
    }
    aggregated
}

fn combine(acc: Value, next: Value) -> Value {
    match (acc, next) {
        (Value::Number(a), Value::Number(b)) => Value::Number(add_numbers(&a, &b)),
        (Value::Object(mut a), Value::Object(b)) => {
            a.extend(b);
            Value::Object(a)
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (_, next) => next,
    }
}

/// Sum two numbers, keeping `a` when the sum is not representable.
fn add_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| {
        tracing::warn!(%a, %b, "numeric aggregate overflowed, keeping previous total");
        a.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::FieldKind;
    use serde_json::json;
    use stagehand_types::job::JobScope;
    use stagehand_types::phase::{PhaseDefinition, PhaseStatus, WorkflowDefinition};

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn job() -> Job {
        let workflow = WorkflowDefinition {
            name: "rollout".to_string(),
            root_phase: "validate".to_string(),
            phases: vec![
                PhaseDefinition::global("validate"),
                PhaseDefinition::per_unit("create").depends_on(["validate"]),
                PhaseDefinition::global("summarize").depends_on(["create"]),
            ],
        };
        Job::new(
            &workflow,
            JobScope::account("acct-1"),
            fields(json!({ "region": "eu", "vlan": 10 })),
        )
    }

    fn unit(id: &str, number: u32, resolved: Value) -> Unit {
        let mut unit = Unit::new(id, number);
        unit.resolved = fields(resolved);
        unit
    }

    #[test]
    fn lookup_prefers_resolved_then_plan_then_config() {
        let mut unit = unit("site-1", 1, json!({ "network_id": "N_1" }));
        unit.plan = fields(json!({ "network_id": "planned", "name": "Site 1" }));
        unit.input_config = fields(json!({ "name": "cfg", "address": "1 Main St" }));

        let specs = vec![
            FieldSpec::required("network_id", FieldKind::Text),
            FieldSpec::required("name", FieldKind::Text),
            FieldSpec::required("address", FieldKind::Text),
        ];
        let inputs = assemble_unit_inputs(&specs, &unit, &job()).unwrap();
        assert_eq!(inputs["network_id"], "N_1");
        assert_eq!(inputs["name"], "Site 1");
        assert_eq!(inputs["address"], "1 Main St");
    }

    #[test]
    fn lookup_falls_through_identity_globals_options_and_extra() {
        let mut job = job();
        job.global_phase_status
            .insert("validate".to_string(), PhaseStatus::Completed);
        job.global_phase_results
            .insert("validate".to_string(), fields(json!({ "org_id": "O_9", "region": "us" })));
        let mut unit = unit("site-2", 2, json!({ "extra": { "tag": "from-resolved" } }));
        unit.plan = fields(json!({ "extra": { "tag": "from-plan", "owner": "ops" } }));

        let specs = vec![
            FieldSpec::required("unit_number", FieldKind::Number),
            FieldSpec::required("org_id", FieldKind::Text),
            FieldSpec::required("region", FieldKind::Text),
            FieldSpec::required("vlan", FieldKind::Number),
            FieldSpec::required("tag", FieldKind::Text),
            FieldSpec::required("owner", FieldKind::Text),
        ];
        let inputs = assemble_unit_inputs(&specs, &unit, &job).unwrap();
        assert_eq!(inputs["unit_number"], 2);
        assert_eq!(inputs["org_id"], "O_9");
        // Global outputs come before job options.
        assert_eq!(inputs["region"], "us");
        assert_eq!(inputs["vlan"], 10);
        assert_eq!(inputs["tag"], "from-plan");
        assert_eq!(inputs["owner"], "ops");
    }

    #[test]
    fn outputs_of_incomplete_globals_are_ignored() {
        let mut job = job();
        job.global_phase_status
            .insert("validate".to_string(), PhaseStatus::Failed);
        job.global_phase_results
            .insert("validate".to_string(), fields(json!({ "org_id": "O_9" })));
        let specs = vec![FieldSpec::optional("org_id", FieldKind::Text)];
        let inputs = assemble_unit_inputs(&specs, &unit("s", 1, json!({})), &job).unwrap();
        assert!(inputs.is_empty());
    }

    #[test]
    fn missing_required_and_wrong_kind_are_errors() {
        let unit = unit("site-1", 1, json!({ "count": "three", "gone": null }));
        let err = assemble_unit_inputs(&[FieldSpec::required("gone", FieldKind::Any)], &unit, &job())
            .unwrap_err();
        assert_eq!(err, PhaseError::MissingInput("gone".to_string()));

        let err = assemble_unit_inputs(&[FieldSpec::required("count", FieldKind::Number)], &unit, &job())
            .unwrap_err();
        assert!(matches!(err, PhaseError::InvalidInput { ref field, .. } if field == "count"));

        let ok = assemble_unit_inputs(&[FieldSpec::optional("absent", FieldKind::Any)], &unit, &job())
            .unwrap();
        assert!(ok.is_empty());
    }

    #[test]
    fn aggregation_sums_numbers() {
        let units = vec![
            unit("a", 1, json!({ "devices": 3 })),
            unit("b", 2, json!({ "devices": 4 })),
            unit("c", 3, json!({ "devices": 5 })),
        ];
        let agg = aggregate_unit_fields(&units, &["devices"]);
        assert_eq!(agg["devices"], 12);

        let units = vec![unit("a", 1, json!({ "load": 0.5 })), unit("b", 2, json!({ "load": 2 }))];
        assert_eq!(aggregate_unit_fields(&units, &["load"])["load"], 2.5);
    }

    #[test]
    fn aggregation_overflow_keeps_running_total() {
        let units = vec![
            unit("a", 1, json!({ "bytes": 1.5e308 })),
            unit("b", 2, json!({ "bytes": 1.5e308 })),
            unit("c", 3, json!({ "bytes": 1 })),
        ];
        let agg = aggregate_unit_fields(&units, &["bytes"]);
        assert_eq!(agg["bytes"], 1.5e308);
        assert_ne!(agg["bytes"], 0);
    }

    #[test]
    fn aggregation_concatenates_lists_in_unit_order() {
        let units = vec![
            unit("c", 3, json!({ "serials": ["S5"] })),
            unit("a", 1, json!({ "serials": ["S1", "S2"] })),
            unit("b", 2, json!({ "serials": ["S3"] })),
        ];
        let agg = aggregate_unit_fields(&units, &["serials"]);
        assert_eq!(agg["serials"], json!(["S1", "S2", "S3", "S5"]));
    }

    #[test]
    fn aggregation_merges_maps_with_later_units_winning() {
        let units = vec![
            unit("a", 1, json!({ "ids": { "x": 1, "y": 1 } })),
            unit("b", 2, json!({ "ids": { "y": 2, "z": 2 } })),
        ];
        let agg = aggregate_unit_fields(&units, &["ids"]);
        assert_eq!(agg["ids"], json!({ "x": 1, "y": 2, "z": 2 }));
    }

    #[test]
    fn aggregation_takes_last_non_null_scalar_and_skips_failed_units() {
        let mut failed = unit("c", 3, json!({ "name": "failed-unit", "devices": 100 }));
        failed.status = UnitStatus::Failed;
        let units = vec![
            unit("a", 1, json!({ "name": "first", "devices": 1 })),
            unit("b", 2, json!({ "name": null, "devices": 2 })),
            failed,
        ];
        let agg = aggregate_unit_fields(&units, &["name", "devices", "missing"]);
        assert_eq!(agg["name"], "first");
        assert_eq!(agg["devices"], 3);
        assert!(!agg.contains_key("missing"));
    }

    #[test]
    fn global_inputs_prefer_aggregate() {
        let specs = vec![
            FieldSpec::required("devices", FieldKind::Number),
            FieldSpec::required("region", FieldKind::Text),
        ];
        let inputs = assemble_global_inputs(&specs, &job(), &fields(json!({ "devices": 7 }))).unwrap();
        assert_eq!(inputs["devices"], 7);
        assert_eq!(inputs["region"], "eu");
    }
}
