//! Elicitation capability service (server -> client).
//!
//! Proxies `elicitation/create`, which asks the client to collect user input
//! matching a flat JSON Schema. The schema is validated before the request
//! goes out: a root object with non-empty scalar-typed properties, no
//! nesting, no composition keywords.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::methods;
use crate::protocol::types::{ElicitAction, ElicitParams, ElicitResult};
use crate::session::{Session, SessionId};

const ALLOWED_PROPERTY_TYPES: &[&str] = &["string", "number", "integer", "boolean"];
const FORBIDDEN_KEYWORDS: &[&str] = &["allOf", "anyOf", "oneOf", "not", "$ref"];

/// Elicitation service with per-session failure accounting.
pub struct ElicitationService {
    timeout: Duration,
    failures: Mutex<HashMap<SessionId, u32>>,
}

impl ElicitationService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the client to collect user input. On `accept`, the returned
    /// content is checked for minimum validity against the requested schema.
    pub async fn create(&self, session: &Arc<Session>, params: ElicitParams) -> Result<ElicitResult> {
        if !session.supports_elicitation().await {
            return Err(Error::MethodNotFound(
                "Client does not advertise the elicitation capability".to_string(),
            ));
        }

        validate_flat_schema(&params.requested_schema)?;

        let payload = serde_json::to_value(&params)?;
        let outcome = tokio::time::timeout(
            self.timeout,
            session.send_request(methods::ELICITATION_CREATE, Some(payload)),
        )
        .await;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                self.record_failure(session.id()).await;
                return Err(e);
            }
            Err(_) => {
                self.record_failure(session.id()).await;
                return Err(Error::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let result: ElicitResult = serde_json::from_value(value)
            .map_err(|e| Error::Internal(format!("malformed elicitation result: {e}")))?;

        if result.action == ElicitAction::Accept {
            let content = result
                .content
                .as_ref()
                .ok_or_else(|| Error::Internal("accepted elicitation carries no content".into()))?;
            check_content(&params.requested_schema, content)?;
        }

        *self
            .failures
            .lock()
            .await
            .entry(session.id().clone())
            .or_insert(0) = 0;
        Ok(result)
    }

    async fn record_failure(&self, id: &SessionId) {
        *self.failures.lock().await.entry(id.clone()).or_insert(0) += 1;
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.failures.lock().await.remove(id);
    }
}

/// Reject any schema that is not a flat object of scalar properties.
pub fn validate_flat_schema(schema: &Value) -> Result<()> {
    let obj = schema
        .as_object()
        .ok_or_else(|| Error::invalid_params("requestedSchema must be an object"))?;

    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return Err(Error::invalid_params(
            "requestedSchema.type must be 'object'",
        ));
    }

    for keyword in FORBIDDEN_KEYWORDS {
        if obj.contains_key(*keyword) {
            return Err(Error::invalid_params(format!(
                "requestedSchema must not use '{keyword}'"
            )));
        }
    }

    let properties = obj
        .get("properties")
        .and_then(Value::as_object)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            Error::invalid_params("requestedSchema.properties must be a non-empty object")
        })?;

    for (name, prop) in properties {
        let prop_obj = prop.as_object().ok_or_else(|| {
            Error::invalid_params(format!("Schema for property '{name}' must be an object"))
        })?;

        for keyword in FORBIDDEN_KEYWORDS {
            if prop_obj.contains_key(*keyword) {
                return Err(Error::invalid_params(format!(
                    "Property '{name}' must not use '{keyword}'"
                )));
            }
        }

        let prop_type = prop_obj.get("type").and_then(Value::as_str);
        match prop_type {
            Some(t) if ALLOWED_PROPERTY_TYPES.contains(&t) => {}
            other => {
                return Err(Error::invalid_params_data(
                    format!(
                        "Unsupported schema type '{}' for property '{name}'",
                        other.unwrap_or("<missing>")
                    ),
                    serde_json::json!({ "property": name }),
                ));
            }
        }
    }

    Ok(())
}

/// Minimum validity of accepted content: required keys present, declared
/// types compatible.
fn check_content(schema: &Value, content: &Value) -> Result<()> {
    let content_obj = content
        .as_object()
        .ok_or_else(|| Error::Internal("elicitation content must be an object".into()))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !content_obj.contains_key(name) {
                return Err(Error::Internal(format!(
                    "elicitation content missing required property '{name}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in content_obj {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")).and_then(Value::as_str)
            else {
                continue;
            };
            let compatible = match declared {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                _ => true,
            };
            if !compatible {
                return Err(Error::Internal(format!(
                    "elicitation content property '{name}' is not a {declared}"
                )));
            }
        }
    }

    Ok(())
}
