//! ToolContract trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act: run a SQL query,
//! describe a table, build a chart. The registry resolves a requested tool
//! by name and validates its arguments against the tool's declared
//! [`ArgumentSchema`] before anything is dispatched. The registry itself
//! holds no tool-specific logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Classify, FailureClass, ResolutionError, ToolError, ValidationError};

// ── Argument schema ───────────────────────────────────────────────────────

/// The JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn json_type(self) -> Option<&'static str> {
        match self {
            Self::String => Some("string"),
            Self::Integer => Some("integer"),
            Self::Number => Some("number"),
            Self::Boolean => Some("boolean"),
            Self::Object => Some("object"),
            Self::Array => Some("array"),
            Self::Any => None,
        }
    }
}

/// Declaration of a single argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Enumerated values the field may take. Empty = unconstrained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// The argument contract a tool declares.
///
/// Built with a small builder:
///
/// ```
/// use metricchat_core::tool::{ArgumentSchema, FieldKind};
///
/// let schema = ArgumentSchema::new()
///     .required("sql", FieldKind::String, "The SELECT statement to run")
///     .optional("limit", FieldKind::Integer, "Row cap")
///     .one_of("format", ["table", "csv"], "Result format");
/// assert_eq!(schema.fields().len(), 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentSchema {
    #[serde(default)]
    fields: Vec<FieldSpec>,
    /// Whether fields not declared here are accepted.
    #[serde(default)]
    allow_unknown: bool,
}

impl ArgumentSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.field(FieldSpec {
            name: name.into(),
            kind,
            required: true,
            allowed: vec![],
            description: description.into(),
        })
    }

    pub fn optional(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.field(FieldSpec {
            name: name.into(),
            kind,
            required: false,
            allowed: vec![],
            description: description.into(),
        })
    }

    /// An optional string field restricted to the given values.
    pub fn one_of<const N: usize>(self, name: &str, values: [&str; N], description: &str) -> Self {
        self.field(FieldSpec {
            name: name.into(),
            kind: FieldKind::String,
            required: false,
            allowed: values.iter().map(|v| Value::String((*v).into())).collect(),
            description: description.into(),
        })
    }

    /// Add (or replace) a field declaration.
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.retain(|f| f.name != spec.name);
        self.fields.push(spec);
        self
    }

    pub fn allow_unknown_fields(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Check `arguments` against the declared fields.
    ///
    /// Checks run in declaration order, so the first violation reported is
    /// stable for a given schema and input.
    pub fn validate(&self, arguments: &Value) -> Result<ValidatedArguments, ValidationError> {
        let Value::Object(map) = arguments else {
            return Err(ValidationError::NotAnObject {
                found: type_name(arguments).into(),
            });
        };

        for spec in &self.fields {
            match map.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ValidationError::MissingField(spec.name.clone()));
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(ValidationError::WrongType {
                            field: spec.name.clone(),
                            expected: spec.kind.json_type().unwrap_or("any").into(),
                            found: type_name(value).into(),
                        });
                    }
                    if !spec.allowed.is_empty() && !spec.allowed.contains(value) {
                        return Err(ValidationError::NotAllowed {
                            field: spec.name.clone(),
                            value: value.to_string(),
                            allowed: spec.allowed.iter().map(|v| v.to_string()).collect(),
                        });
                    }
                }
            }
        }

        if !self.allow_unknown {
            // Map iteration order is sorted, which keeps the reported field stable.
            if let Some(unknown) = map.keys().find(|k| !self.fields.iter().any(|f| &f.name == *k)) {
                return Err(ValidationError::UnknownField(unknown.clone()));
            }
        }

        Ok(ValidatedArguments(map.clone()))
    }

    /// Render as a JSON Schema object (sent to the model and listed in the
    /// tool catalog).
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.fields {
            let mut prop = Map::new();
            if let Some(t) = spec.kind.json_type() {
                prop.insert("type".into(), Value::String(t.into()));
            }
            if !spec.description.is_empty() {
                prop.insert("description".into(), Value::String(spec.description.clone()));
            }
            if !spec.allowed.is_empty() {
                prop.insert("enum".into(), Value::Array(spec.allowed.clone()));
            }
            properties.insert(spec.name.clone(), Value::Object(prop));
        }
        let required: Vec<Value> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| Value::String(f.name.clone()))
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_unknown,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Arguments that passed a tool's [`ArgumentSchema`].
///
/// Only [`ArgumentSchema::validate`] produces these at runtime; the serde
/// impls exist so persisted iterations can be read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatedArguments(Map<String, Value>);

impl ValidatedArguments {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

// ── Contract ──────────────────────────────────────────────────────────────

/// A tool definition sent to the model and listed in the tool catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments.
    pub input_schema: Value,
}

/// The capability every pluggable tool implements.
///
/// `execute` receives arguments that already passed `argument_schema()`.
/// Returning `Err` hands the failure to the runner, which consults
/// [`ToolContract::classify`] to decide whether another attempt is allowed.
#[async_trait]
pub trait ToolContract: Send + Sync {
    /// The unique name the model uses to request this tool.
    fn name(&self) -> &str;

    /// What the tool does (sent to the model).
    fn description(&self) -> &str;

    /// Declared argument contract.
    fn argument_schema(&self) -> &ArgumentSchema;

    /// Run the capability. The payload is opaque to the agent loop.
    async fn execute(&self, arguments: ValidatedArguments) -> Result<Value, ToolError>;

    /// Retry classification for this tool's failures.
    fn classify(&self, error: &ToolError) -> FailureClass {
        error.failure_class()
    }

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.argument_schema().to_json_schema(),
        }
    }
}

/// A validated request to execute a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the session (`call_<iteration>`).
    pub id: String,
    pub name: String,
    pub arguments: ValidatedArguments,
}

// ── Registry ──────────────────────────────────────────────────────────────

/// Name → tool lookup plus argument validation.
///
/// Populated at startup, then shared read-only (`Arc<ToolRegistry>`) by every
/// session.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolContract>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolContract>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ToolContract>, ResolutionError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::UnknownTool {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// Validate arguments against a resolved tool's schema. Never executes it.
    pub fn validate(
        &self,
        tool: &dyn ToolContract,
        arguments: &Value,
    ) -> Result<ValidatedArguments, ResolutionError> {
        tool.argument_schema()
            .validate(arguments)
            .map_err(|source| ResolutionError::InvalidArguments {
                tool_name: tool.name().to_string(),
                source,
            })
    }

    /// Resolve and validate in one step, producing a dispatchable call.
    pub fn prepare(
        &self,
        call_id: impl Into<String>,
        name: &str,
        arguments: &Value,
    ) -> Result<(Arc<dyn ToolContract>, ToolCall), ResolutionError> {
        let tool = self.resolve(name)?;
        let arguments = self.validate(tool.as_ref(), arguments)?;
        let call = ToolCall {
            id: call_id.into(),
            name: name.to_string(),
            arguments,
        };
        Ok((tool, call))
    }

    /// The tool catalog, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
