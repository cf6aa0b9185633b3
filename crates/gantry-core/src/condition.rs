//! Condition expressions gating stage execution.
//!
//! Conditions are a small tagged expression tree rather than interpolated
//! text. In YAML they read as:
//!
//! ```yaml
//! condition:
//!   and:
//!     - eq: [{ param: e2e }, true]
//!     - var: CheckBuildImages.check_source_change_runtime.check_files.RUNTIMEBUILD
//! ```
//!
//! A bare `true` or `false` is a literal condition.

use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject, StringValidation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A typed value published by a stage or declared as a static parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OutputValue {
    Bool(bool),
    String(String),
}

impl OutputValue {
    /// Interpret the value as a boolean.
    ///
    /// Strings are accepted only when they spell `true` or `false`
    /// (case-insensitive).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OutputValue::Bool(b) => Some(*b),
            OutputValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            OutputValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            OutputValue::String(_) => None,
        }
    }

    /// Parse a raw string coming from a command line or a collaborator.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim() {
            "true" => OutputValue::Bool(true),
            "false" => OutputValue::Bool(false),
            other => OutputValue::String(other.to_string()),
        }
    }
}

impl Default for OutputValue {
    fn default() -> Self {
        OutputValue::Bool(false)
    }
}

impl From<bool> for OutputValue {
    fn from(value: bool) -> Self {
        OutputValue::Bool(value)
    }
}

impl From<&str> for OutputValue {
    fn from(value: &str) -> Self {
        OutputValue::String(value.to_string())
    }
}

impl fmt::Display for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputValue::Bool(b) => write!(f, "{b}"),
            OutputValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// Reference to an output published by an upstream stage:
/// `stage.job.task.output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariableRef {
    pub stage: String,
    pub job: String,
    pub task: String,
    pub name: String,
}

impl VariableRef {
    pub fn new(
        stage: impl Into<String>,
        job: impl Into<String>,
        task: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            job: job.into(),
            task: task.into(),
            name: name.into(),
        }
    }
}

impl FromStr for VariableRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [stage, job, task, name] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(Self::new(*stage, *job, *task, *name))
            }
            _ => Err(format!(
                "invalid variable reference '{s}', expected stage.job.task.output"
            )),
        }
    }
}

impl TryFrom<String> for VariableRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariableRef> for String {
    fn from(value: VariableRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.stage, self.job, self.task, self.name)
    }
}

impl JsonSchema for VariableRef {
    fn schema_name() -> String {
        "VariableRef".to_string()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            string: Some(Box::new(StringValidation {
                pattern: Some(r"^[^.]+\.[^.]+\.[^.]+\.[^.]+$".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        }
        .into()
    }
}

/// One side of an `eq` comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Operand {
    Var { var: VariableRef },
    Param { param: String },
    Literal(OutputValue),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var { var } => write!(f, "{var}"),
            Operand::Param { param } => write!(f, "parameters.{param}"),
            Operand::Literal(OutputValue::String(s)) => write!(f, "'{s}'"),
            Operand::Literal(value) => write!(f, "{value}"),
        }
    }
}

/// Boolean expression over upstream outputs and static parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConditionRepr", into = "ConditionRepr")]
pub enum Condition {
    Literal(bool),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Eq(Operand, Operand),
    Var(VariableRef),
    Param(String),
}

impl Condition {
    pub fn var(reference: &str) -> Result<Self, String> {
        Ok(Condition::Var(reference.parse()?))
    }

    pub fn param(name: impl Into<String>) -> Self {
        Condition::Param(name.into())
    }

    /// All upstream outputs this condition reads, in expression order.
    pub fn references(&self) -> Vec<&VariableRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a VariableRef>) {
        match self {
            Condition::And(items) | Condition::Or(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Condition::Eq(left, right) => {
                for operand in [left, right] {
                    if let Operand::Var { var } = operand {
                        refs.push(var);
                    }
                }
            }
            Condition::Var(var) => refs.push(var),
            Condition::Literal(_) | Condition::Param(_) => {}
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, op: &str, items: &[Condition]) -> fmt::Result {
            write!(f, "{op}(")?;
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }

        match self {
            Condition::Literal(b) => write!(f, "{b}"),
            Condition::And(items) => join(f, "and", items),
            Condition::Or(items) => join(f, "or", items),
            Condition::Eq(left, right) => write!(f, "eq({left}, {right})"),
            Condition::Var(var) => write!(f, "{var}"),
            Condition::Param(name) => write!(f, "parameters.{name}"),
        }
    }
}

impl JsonSchema for Condition {
    fn schema_name() -> String {
        "Condition".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        ConditionRepr::json_schema(generator)
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
enum ConditionRepr {
    Literal(bool),
    Node(ConditionNode),
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum ConditionNode {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Eq(Operand, Operand),
    Var(VariableRef),
    Param(String),
}

impl From<ConditionRepr> for Condition {
    fn from(repr: ConditionRepr) -> Self {
        match repr {
            ConditionRepr::Literal(b) => Condition::Literal(b),
            ConditionRepr::Node(ConditionNode::And(items)) => Condition::And(items),
            ConditionRepr::Node(ConditionNode::Or(items)) => Condition::Or(items),
            ConditionRepr::Node(ConditionNode::Eq(l, r)) => Condition::Eq(l, r),
            ConditionRepr::Node(ConditionNode::Var(v)) => Condition::Var(v),
            ConditionRepr::Node(ConditionNode::Param(p)) => Condition::Param(p),
        }
    }
}

impl From<Condition> for ConditionRepr {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Literal(b) => ConditionRepr::Literal(b),
            Condition::And(items) => ConditionRepr::Node(ConditionNode::And(items)),
            Condition::Or(items) => ConditionRepr::Node(ConditionNode::Or(items)),
            Condition::Eq(l, r) => ConditionRepr::Node(ConditionNode::Eq(l, r)),
            Condition::Var(v) => ConditionRepr::Node(ConditionNode::Var(v)),
            Condition::Param(p) => ConditionRepr::Node(ConditionNode::Param(p)),
        }
    }
}
