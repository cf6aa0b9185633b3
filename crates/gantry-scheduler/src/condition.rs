//! Condition evaluation against upstream outputs and static parameters.

use crate::outputs::{OutputKey, OutputStore};
use gantry_core::condition::{Condition, Operand, OutputValue, VariableRef};
use gantry_core::error::ConditionResolutionError;
use gantry_core::pipeline::{JobDefinition, PipelineDefinition, StageDefinition};
use gantry_core::run::StageStatus;
use std::collections::{BTreeMap, HashMap};

/// Everything a condition may read. Borrowed, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationEnv<'a> {
    /// Stage whose condition is being evaluated.
    pub consumer: &'a StageDefinition,
    pub pipeline: &'a PipelineDefinition,
    pub statuses: &'a HashMap<String, StageStatus>,
    pub outputs: &'a OutputStore,
    pub parameters: &'a BTreeMap<String, OutputValue>,
}

/// Evaluates condition trees.
///
/// Every operand is resolved even when the result is already decided, so an
/// unresolvable reference is reported regardless of operand order.
pub struct ConditionEvaluator;

type EvalResult<T> = Result<T, ConditionResolutionError>;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, condition: &Condition, env: &EvaluationEnv<'_>) -> EvalResult<bool> {
        match condition {
            Condition::Literal(b) => Ok(*b),
            Condition::And(items) => {
                let values = self.evaluate_all(items, env)?;
                Ok(values.into_iter().all(|v| v))
            }
            Condition::Or(items) => {
                let values = self.evaluate_all(items, env)?;
                Ok(values.into_iter().any(|v| v))
            }
            Condition::Eq(left, right) => {
                let left = self.resolve_operand(left, env)?;
                let right = self.resolve_operand(right, env)?;
                Ok(values_equal(&left, &right))
            }
            Condition::Var(var) => {
                let value = self.resolve_var(var, env)?;
                require_bool(&var.to_string(), &value)
            }
            Condition::Param(name) => {
                let value = self.resolve_param(name, env)?;
                require_bool(&format!("parameters.{name}"), &value)
            }
        }
    }

    fn evaluate_all(&self, items: &[Condition], env: &EvaluationEnv<'_>) -> EvalResult<Vec<bool>> {
        items.iter().map(|item| self.evaluate(item, env)).collect()
    }

    fn resolve_operand(&self, operand: &Operand, env: &EvaluationEnv<'_>) -> EvalResult<OutputValue> {
        match operand {
            Operand::Var { var } => self.resolve_var(var, env),
            Operand::Param { param } => self.resolve_param(param, env),
            Operand::Literal(value) => Ok(value.clone()),
        }
    }

    fn resolve_param(&self, name: &str, env: &EvaluationEnv<'_>) -> EvalResult<OutputValue> {
        env.parameters.get(name).cloned().ok_or_else(|| {
            ConditionResolutionError::new(format!("parameters.{name}"), "unknown parameter")
        })
    }

    fn resolve_var(&self, var: &VariableRef, env: &EvaluationEnv<'_>) -> EvalResult<OutputValue> {
        let reference = var.to_string();

        if !env.consumer.depends_on.contains(&var.stage) {
            return Err(ConditionResolutionError::new(
                reference,
                format!(
                    "stage '{}' is not a declared dependency of '{}'",
                    var.stage, env.consumer.name
                ),
            ));
        }

        match env.statuses.get(&var.stage) {
            Some(StageStatus::Skipped) => {
                let declared = env
                    .pipeline
                    .stage(&var.stage)
                    .and_then(|stage| job_for_key(stage, &var.job))
                    .and_then(|job| job.output(&var.task, &var.name));
                match declared {
                    Some(declaration) => Ok(declaration.skipped_default.clone()),
                    None => Err(ConditionResolutionError::new(
                        reference,
                        "producer stage was skipped and the output is not declared",
                    )),
                }
            }
            Some(StageStatus::Succeeded | StageStatus::Failed) => env
                .outputs
                .get(&OutputKey::from(var))
                .cloned()
                .ok_or_else(|| ConditionResolutionError::new(reference, "output was not published")),
            Some(_) => Err(ConditionResolutionError::new(
                reference,
                "producer stage has not finished",
            )),
            None => Err(ConditionResolutionError::new(reference, "unknown stage")),
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the job definition that materializes `key` (`job` or `job_instance`).
pub fn job_for_key<'a>(stage: &'a StageDefinition, key: &str) -> Option<&'a JobDefinition> {
    stage.jobs.iter().find(|job| match &job.matrix {
        None => job.name == key,
        Some(matrix) => matrix
            .instances
            .iter()
            .any(|instance| format!("{}_{}", job.name, instance.name) == key),
    })
}

fn require_bool(reference: &str, value: &OutputValue) -> EvalResult<bool> {
    value.as_bool().ok_or_else(|| {
        ConditionResolutionError::new(reference, format!("value '{value}' is not a boolean"))
    })
}

fn values_equal(left: &OutputValue, right: &OutputValue) -> bool {
    match (left, right) {
        (OutputValue::Bool(a), OutputValue::Bool(b)) => a == b,
        (OutputValue::String(a), OutputValue::String(b)) => a == b,
        (OutputValue::Bool(b), s @ OutputValue::String(_))
        | (s @ OutputValue::String(_), OutputValue::Bool(b)) => s.as_bool() == Some(*b),
    }
}
