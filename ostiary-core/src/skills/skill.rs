//! Skill definition
//!
//! A skill is an ordered list of steps: tool calls whose results land in a
//! shared output bag, and assertions over that bag. Rollback steps are tool
//! calls run in reverse order when the skill halts.

use crate::fingerprint::{canonical_json_of, sha256_hex};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Declarative skill definition, loadable from YAML or JSON manifests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDefinition {
    /// Skill name
    pub name: String,

    /// Semantic version
    pub version: Version,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tools that must be registered before the skill can run
    #[serde(default)]
    pub required_tools: Vec<String>,

    /// Steps, run in order
    pub steps: Vec<SkillStep>,

    /// Compensating tool calls, run in reverse order when the skill halts
    #[serde(default)]
    pub rollback: Vec<ToolStep>,
}

impl SkillDefinition {
    /// Create an empty skill
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            required_tools: Vec::new(),
            steps: Vec::new(),
            rollback: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a required tool
    pub fn requires_tool(mut self, tool: impl Into<String>) -> Self {
        self.required_tools.push(tool.into());
        self
    }

    /// Append a step
    pub fn step(mut self, step: impl Into<SkillStep>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Append a rollback step
    pub fn with_rollback(mut self, step: ToolStep) -> Self {
        self.rollback.push(step);
        self
    }

    /// Parse a YAML manifest (JSON is valid YAML)
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Parse a JSON manifest
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Content digest over the canonicalized definition
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        Ok(sha256_hex(canonical_json_of(self)?))
    }

    /// Check structural rules: a name, at least one step, unique step IDs
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("skill name is empty".to_string());
        }
        if self.steps.is_empty() {
            return Err(format!("skill '{}' has no steps", self.name));
        }
        let mut seen = HashSet::new();
        let ids = self
            .steps
            .iter()
            .map(SkillStep::id)
            .chain(self.rollback.iter().map(|s| s.id.as_str()));
        for id in ids {
            if !seen.insert(id) {
                return Err(format!("duplicate step id '{}' in skill '{}'", id, self.name));
            }
        }
        Ok(())
    }
}

/// One step of a skill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillStep {
    /// Invoke a tool through the governed pipeline
    Tool(ToolStep),
    /// Check a predicate over the output bag
    Assert(AssertStep),
}

impl SkillStep {
    /// Step ID
    pub fn id(&self) -> &str {
        match self {
            SkillStep::Tool(step) => &step.id,
            SkillStep::Assert(step) => &step.id,
        }
    }
}

impl From<ToolStep> for SkillStep {
    fn from(step: ToolStep) -> Self {
        SkillStep::Tool(step)
    }
}

impl From<AssertStep> for SkillStep {
    fn from(step: AssertStep) -> Self {
        SkillStep::Assert(step)
    }
}

/// Tool invocation step.
///
/// String leaves of `input` of the form `{{key}}` or `{{key.path}}` are
/// replaced from the output bag before the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub id: String,
    pub tool: String,

    /// Exact version; the highest registered version when absent
    #[serde(default)]
    pub version: Option<Version>,

    #[serde(default = "empty_object")]
    pub input: Value,

    /// Bag key for the result (defaults to the step ID)
    #[serde(default)]
    pub output_key: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl ToolStep {
    /// Create a step calling `tool` with `input`
    pub fn new(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            version: None,
            input,
            output_key: None,
        }
    }

    /// Pin a version
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Store the result under `key`
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Bag key the result is stored under
    pub fn output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.id)
    }
}

/// When an assertion is meant to hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertPhase {
    /// Precondition for the steps that follow
    Pre,
    /// Postcondition of the steps before
    #[default]
    Post,
}

/// Assertion step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertStep {
    pub id: String,
    #[serde(default)]
    pub phase: AssertPhase,
    pub predicate: Predicate,
    #[serde(default)]
    pub message: Option<String>,
}

impl AssertStep {
    /// Precondition
    pub fn pre(id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            phase: AssertPhase::Pre,
            predicate,
            message: None,
        }
    }

    /// Postcondition
    pub fn post(id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            phase: AssertPhase::Post,
            predicate,
            message: None,
        }
    }

    /// Message reported when the assertion fails
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Closure predicate over the output bag
#[derive(Clone)]
pub struct PredicateFn(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl PredicateFn {
    /// Wrap a closure
    pub fn new(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn call(&self, bag: &Value) -> bool {
        (self.0)(bag)
    }
}

impl std::fmt::Debug for PredicateFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PredicateFn(..)")
    }
}

impl PartialEq for PredicateFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Predicate over the output bag.
///
/// Paths are dotted: `step.field.0` walks into objects and arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// The path resolves to a non-null value
    Exists { path: String },
    /// The path resolves to exactly `value`
    Equals { path: String, value: Value },
    /// The path is missing or resolves to something other than `value`
    NotEquals { path: String, value: Value },
    /// The path resolves to a truthy value (not null, false, 0, "", [] or {})
    Truthy { path: String },
    /// Constant
    Always { value: bool },
    /// In-process closure; manifests can name one but never carry it, and a
    /// custom predicate without a closure fails
    Custom {
        name: String,
        #[serde(skip)]
        check: Option<PredicateFn>,
    },
}

impl Predicate {
    /// Closure predicate
    pub fn custom(
        name: impl Into<String>,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Predicate::Custom {
            name: name.into(),
            check: Some(PredicateFn::new(f)),
        }
    }

    /// Evaluate against the bag
    pub fn evaluate(&self, bag: &Value) -> bool {
        match self {
            Predicate::Exists { path } => resolve_path(bag, path).is_some_and(|v| !v.is_null()),
            Predicate::Equals { path, value } => resolve_path(bag, path) == Some(value),
            Predicate::NotEquals { path, value } => resolve_path(bag, path) != Some(value),
            Predicate::Truthy { path } => resolve_path(bag, path).is_some_and(is_truthy),
            Predicate::Always { value } => *value,
            Predicate::Custom { name, check } => match check {
                Some(check) => check.call(bag),
                None => {
                    tracing::warn!(predicate = %name, "Custom predicate has no closure");
                    false
                }
            },
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Walk a dotted path through objects and arrays
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Substitute `{{path}}` references in a JSON template.
///
/// A string that is exactly one reference takes the referenced value with
/// its JSON type; references embedded in longer strings are interpolated
/// as text. An unresolvable reference is an error naming the path.
pub fn render_template(template: &Value, bag: &Value) -> Result<Value, String> {
    match template {
        Value::String(s) => render_string(s, bag),
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, bag))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| render_template(v, bag).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, bag: &Value) -> Result<Value, String> {
    let trimmed = s.trim();
    if let Some(path) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        && !path.contains("{{")
        && !path.contains("}}")
    {
        let path = path.trim();
        return resolve_path(bag, path)
            .cloned()
            .ok_or_else(|| format!("unresolved reference '{}'", path));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        let value =
            resolve_path(bag, path).ok_or_else(|| format!("unresolved reference '{}'", path))?;
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}
