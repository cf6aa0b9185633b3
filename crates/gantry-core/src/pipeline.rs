//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML configuration.

use crate::condition::{Condition, OutputValue};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDefinition {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Static parameters, overridable per run.
    #[serde(default)]
    pub parameters: BTreeMap<String, OutputValue>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub stages: Vec<StageDefinition>,
    /// Default job timeout when neither the job nor its stage sets one.
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u32,
}

fn default_timeout() -> u32 {
    60
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Logical artifact names consolidated when the stage starts.
    #[serde(default)]
    pub consumes: Vec<String>,
    pub jobs: Vec<JobDefinition>,
}

impl StageDefinition {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixDefinition>,
    /// Cap on concurrently running matrix instances.
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDeclaration>,
}

impl JobDefinition {
    /// The declared output for `task.name`, if any.
    pub fn output(&self, task: &str, name: &str) -> Option<&OutputDeclaration> {
        self.outputs.iter().find(|o| o.task == task && o.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub detect_changes: Option<ChangeDetectorConfig>,
    #[serde(default)]
    pub condition: StepCondition,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// Run only while every previous step succeeded.
    #[default]
    Succeeded,
    /// Run even after an earlier step failed or the job timed out.
    Always,
}

/// Path-based change detection published as a boolean output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChangeDetectorConfig {
    /// Name of the published boolean.
    pub output: String,
    /// Anchored regexes matched against the leading path segments.
    pub patterns: Vec<String>,
    /// `false`: changes outside the patterns are relevant.
    /// `true`: only changes inside the patterns are relevant.
    #[serde(default)]
    pub invert: bool,
}

/// An output a job promises to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputDeclaration {
    pub task: String,
    pub name: String,
    /// Value seen by consumers when the producing stage was skipped.
    #[serde(default)]
    pub skipped_default: OutputValue,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactDeclaration {
    /// Logical name shared by every contributor.
    pub name: String,
    /// Working-directory relative prefix captured into the artifact.
    pub path: String,
    /// Publish even when the job failed.
    #[serde(default)]
    pub always: bool,
}

/// A named set of variable bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MatrixInstance {
    pub name: String,
    #[serde(deserialize_with = "deserialize_scalar_map")]
    #[schemars(with = "BTreeMap<String, String>")]
    pub variables: BTreeMap<String, String>,
}

impl MatrixInstance {
    pub fn new<K, V>(name: impl Into<String>, variables: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            variables: variables
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Hand-curated list of matrix instances, in declaration order.
///
/// Written in YAML as a mapping from instance name to bindings. Duplicate
/// names survive parsing so the expander can report them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixDefinition {
    pub instances: Vec<MatrixInstance>,
}

impl MatrixDefinition {
    pub fn new(instances: Vec<MatrixInstance>) -> Self {
        Self { instances }
    }
}

impl Serialize for MatrixDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.instances.len()))?;
        for instance in &self.instances {
            map.serialize_entry(&instance.name, &instance.variables)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixDefinition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = MatrixDefinition;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of instance name to variables, or a list of instances")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut instances = Vec::new();
                while let Some((name, variables)) =
                    access.next_entry::<String, ScalarMap>()?
                {
                    instances.push(MatrixInstance {
                        name,
                        variables: variables.0,
                    });
                }
                Ok(MatrixDefinition { instances })
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut instances = Vec::new();
                while let Some(instance) = access.next_element::<MatrixInstance>()? {
                    instances.push(instance);
                }
                Ok(MatrixDefinition { instances })
            }
        }

        deserializer.deserialize_any(MatrixVisitor)
    }
}

impl JsonSchema for MatrixDefinition {
    fn schema_name() -> String {
        "MatrixDefinition".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        <BTreeMap<String, BTreeMap<String, String>>>::json_schema(generator)
    }
}

/// Matrix values are strings in the pipeline model, but YAML authors write
/// `version: 11` as often as `version: "11"`.
///
/// Decimal numbers are refused: YAML reads `20.10` as the float `20.1`, so
/// the text the author wrote cannot be recovered.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    fn into_binding<E: serde::de::Error>(self, key: &str) -> Result<String, E> {
        match self {
            Scalar::Bool(b) => Ok(b.to_string()),
            Scalar::Int(i) => Ok(i.to_string()),
            Scalar::Float(_) => Err(E::custom(format!(
                "matrix value for '{key}' is a decimal number; quote it to keep its exact text"
            ))),
            Scalar::String(s) => Ok(s),
        }
    }
}

struct ScalarMap(BTreeMap<String, String>);

impl<'de> Deserialize<'de> for ScalarMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_scalar_map(deserializer).map(ScalarMap)
    }
}

fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let binding = value.into_binding::<D::Error>(&key)?;
            Ok((key, binding))
        })
        .collect()
}

impl StepDefinition {
    pub fn validate_action(&self) -> Result<(), String> {
        match (&self.run, &self.detect_changes) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => Err(format!(
                "step '{}' needs either `run` or `detect_changes`",
                self.name
            )),
            (Some(_), Some(_)) => Err(format!(
                "step '{}' declares both `run` and `detect_changes`",
                self.name
            )),
        }
    }
}
