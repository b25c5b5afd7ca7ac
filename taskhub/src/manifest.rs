//! Task manifests and message validation
//!
//! A manifest declares a task's actions and each action's parameters. The
//! engine validates request parameters against the declaration before a
//! request is created; every violation is reported at once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Custom per-parameter check; `Err` carries the reason.
pub type ParameterValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(skip)]
    pub validator: Option<ParameterValidator>,
}

impl fmt::Debug for ParameterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDefinition")
            .field("name", &self.name)
            .field("param_type", &self.param_type)
            .field("required", &self.required)
            .field("default_value", &self.default_value)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub task_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl TaskManifest {
    pub fn from_toml_str(raw: &str) -> Result<Self, ManifestError> {
        toml::from_str(raw).map_err(|e| ManifestError::Parse(e.to_string()))
    }

    /// Attach a custom validator to `action_id.parameter`; unknown names are ignored.
    pub fn with_validator<F>(mut self, action_id: &str, parameter: &str, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        let target = self
            .actions
            .iter_mut()
            .filter(|a| a.id == action_id)
            .flat_map(|a| a.parameters.iter_mut())
            .find(|p| p.name == parameter);
        if let Some(definition) = target {
            definition.validator = Some(Arc::new(validator));
        }
        self
    }

    pub fn action(&self, action_id: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.id == action_id)
    }

    /// The action used when a request names none: one named like the task, or the only one.
    pub fn default_action(&self) -> Option<&ActionDefinition> {
        self.action(&self.task_id).or(match self.actions.as_slice() {
            [only] => Some(only),
            _ => None,
        })
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest already registered for task {0}")]
    DuplicateTask(String),
    #[error("duplicate action {action_id} in task {task_id}")]
    DuplicateAction { task_id: String, action_id: String },
    #[error("failed to read manifest {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid manifest: {0}")]
    Parse(String),
}

/// A single validation violation
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("unknown task {task_id}")]
    UnknownTask { task_id: String },
    #[error("unknown action {action_id} for task {task_id}")]
    UnknownAction { task_id: String, action_id: String },
    #[error("parameters must be an object")]
    NotAnObject,
    #[error("missing required parameter {name}")]
    MissingParameter { name: String },
    #[error("parameter {name} must be {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("parameter {name} rejected: {reason}")]
    Rejected { name: String, reason: String },
    #[error("unexpected parameter {name}")]
    UnexpectedParameter { name: String },
}

/// Every violation found in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationErrors(pub Vec<ValidationIssue>);

impl std::error::Error for ValidationErrors {}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed: ")?;
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl ValidationErrors {
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.0
    }
}

/// A validated action invocation with defaults filled in
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMessage {
    pub task_id: String,
    pub action_id: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct ManifestRegistry {
    manifests: Vec<TaskManifest>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manifest: TaskManifest) -> Result<(), ManifestError> {
        if self.get(&manifest.task_id).is_some() {
            return Err(ManifestError::DuplicateTask(manifest.task_id));
        }
        for (i, action) in manifest.actions.iter().enumerate() {
            if manifest.actions[..i].iter().any(|a| a.id == action.id) {
                return Err(ManifestError::DuplicateAction {
                    task_id: manifest.task_id.clone(),
                    action_id: action.id.clone(),
                });
            }
        }
        self.manifests.push(manifest);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskManifest> {
        self.manifests.iter().find(|m| m.task_id == task_id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.manifests.iter().map(|m| m.task_id.as_str())
    }

    /// Validate `parameters` against the action and build the normalized payload.
    pub fn create_message(
        &self,
        task_id: &str,
        action_id: Option<&str>,
        parameters: &Value,
    ) -> Result<ActionMessage, ValidationErrors> {
        let manifest = self.get(task_id).ok_or_else(|| {
            ValidationErrors(vec![ValidationIssue::UnknownTask {
                task_id: task_id.to_string(),
            }])
        })?;

        let action = match action_id {
            Some(id) => manifest.action(id),
            None => manifest.default_action(),
        }
        .ok_or_else(|| {
            ValidationErrors(vec![ValidationIssue::UnknownAction {
                task_id: task_id.to_string(),
                action_id: action_id.unwrap_or(task_id).to_string(),
            }])
        })?;

        let payload = validate_parameters(action, parameters)?;
        Ok(ActionMessage {
            task_id: task_id.to_string(),
            action_id: action.id.clone(),
            payload,
        })
    }
}

fn validate_parameters(
    action: &ActionDefinition,
    parameters: &Value,
) -> Result<Value, ValidationErrors> {
    let empty = Map::new();
    let input = match parameters {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(ValidationErrors(vec![ValidationIssue::NotAnObject])),
    };

    let mut issues = Vec::new();
    let mut payload = Map::new();

    for definition in &action.parameters {
        let Some(value) = input.get(&definition.name) else {
            if definition.required {
                issues.push(ValidationIssue::MissingParameter {
                    name: definition.name.clone(),
                });
            } else if let Some(default) = &definition.default_value {
                payload.insert(definition.name.clone(), default.clone());
            }
            continue;
        };

        if !definition.param_type.accepts(value) {
            issues.push(ValidationIssue::TypeMismatch {
                name: definition.name.clone(),
                expected: definition.param_type.to_string(),
                actual: json_type(value).to_string(),
            });
            continue;
        }
        if let Some(validator) = &definition.validator {
            if let Err(reason) = validator(value) {
                issues.push(ValidationIssue::Rejected {
                    name: definition.name.clone(),
                    reason,
                });
                continue;
            }
        }
        payload.insert(definition.name.clone(), value.clone());
    }

    for name in input.keys() {
        if !action.parameters.iter().any(|p| p.name == *name) {
            issues.push(ValidationIssue::UnexpectedParameter { name: name.clone() });
        }
    }

    if issues.is_empty() {
        Ok(Value::Object(payload))
    } else {
        Err(ValidationErrors(issues))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse every `*.toml` in `dir`, in file-name order
pub fn load_dir(dir: &Path) -> Result<Vec<TaskManifest>, ManifestError> {
    let io_error = |path: &Path, e: std::io::Error| ManifestError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
        let path = entry.map_err(|e| io_error(dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let raw = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
            TaskManifest::from_toml_str(&raw).map_err(|e| match e {
                ManifestError::Parse(message) => {
                    ManifestError::Parse(format!("{}: {message}", path.display()))
                }
                other => other,
            })
        })
        .collect()
}
