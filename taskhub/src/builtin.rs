//! Built-in `add-numbers` task, wired up by the binary and used in tests

use serde_json::{json, Value};
use shared_types::ErrorCategory;
use std::sync::Arc;

use crate::handler::{handler_fn, HandlerError, TaskHandler};
use crate::manifest::{ActionDefinition, ParameterDefinition, ParameterType, TaskManifest};

pub const ADD_NUMBERS: &str = "add-numbers";

/// `{a, b}` → `{result: a + b, operation: "addition"}`
pub fn add_numbers_handler() -> Arc<dyn TaskHandler> {
    handler_fn(|_task_id, payload| {
        let a = operand(&payload, "a")?;
        let b = operand(&payload, "b")?;

        // Integers stay integers so `5 + 3` answers `8`, not `8.0`.
        let sum = match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => match a.checked_add(b) {
                Some(sum) => json!(sum),
                None => json!(a as f64 + b as f64),
            },
            _ => json!(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()),
        };
        Ok(json!({ "result": sum, "operation": "addition" }))
    })
}

fn operand<'a>(payload: &'a Value, name: &str) -> Result<&'a serde_json::Number, HandlerError> {
    match payload.get(name) {
        Some(Value::Number(n)) => Ok(n),
        Some(other) => Err(HandlerError::new(
            ErrorCategory::Validation,
            format!("'{name}' must be a number, got {other}"),
        )),
        None => Err(HandlerError::new(
            ErrorCategory::Validation,
            format!("missing operand '{name}'"),
        )),
    }
}

pub fn add_numbers_manifest() -> TaskManifest {
    let number = |name: &str| ParameterDefinition {
        name: name.to_string(),
        param_type: ParameterType::Number,
        required: true,
        default_value: None,
        validator: None,
    };
    TaskManifest {
        task_id: ADD_NUMBERS.to_string(),
        name: Some("Add numbers".to_string()),
        description: Some("Adds two numbers".to_string()),
        actions: vec![ActionDefinition {
            id: ADD_NUMBERS.to_string(),
            name: None,
            description: None,
            parameters: vec![number("a"), number("b")],
        }],
    }
}
