//! The Case value object: a parameterized evaluation request plus its future
//! outputs and status.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CaseError, OutputReadError};
use crate::flatten::flatten;

/// Structured counterpart to `Case::msg`: carries a message and, where
/// available, a trace of what produced it. Populated when the model raises
/// during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredError {
    pub message: String,
    pub trace: Option<String>,
}

impl StructuredError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Some(trace.into()),
        }
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// An output entry as supplied to `add_outputs`: either a bare name (outputs
/// start at the sentinel value) or a `(name, value)` pair.
pub enum OutputSpec {
    Name(String),
    NameValue(String, Value),
}

impl From<&str> for OutputSpec {
    fn from(name: &str) -> Self {
        OutputSpec::Name(name.to_string())
    }
}

impl From<String> for OutputSpec {
    fn from(name: String) -> Self {
        OutputSpec::Name(name)
    }
}

impl From<(String, Value)> for OutputSpec {
    fn from((name, value): (String, Value)) -> Self {
        OutputSpec::NameValue(name, value)
    }
}

/// Which half of a case's items to return from `items`/`get_inputs`/etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    In,
    Out,
}

impl IoType {
    fn parse(s: &str) -> Result<Option<Self>, CaseError> {
        match s {
            "in" => Ok(Some(IoType::In)),
            "out" => Ok(Some(IoType::Out)),
            _ => Err(CaseError::InvalidIoType),
        }
    }
}

/// The abstract handle a case applies its inputs to and reads its outputs
/// from. In the running driver this is backed by a worker's loaded model
/// (local or remote, both of which are asynchronous); in tests it can be a
/// plain in-memory map.
#[async_trait]
pub trait CaseScope: Send + Sync {
    /// Stamp the scope with the uuid of the case currently driving it.
    async fn set_case_id(&mut self, id: Uuid);
    async fn set(&mut self, name: &str, value: &Value) -> Result<(), String>;
    async fn get(&self, name: &str) -> Result<Value, String>;
}

/// The (out-of-scope) expression evaluator used for input/output names that
/// are not legal assignment targets.
#[async_trait]
pub trait ExprEvaluator: Send + Sync {
    async fn set(&self, value: &Value, scope: &mut dyn CaseScope) -> Result<(), String>;
    async fn evaluate(&self, scope: &dyn CaseScope) -> Result<Value, String>;
}

/// Resolves an expression string to an `ExprEvaluator`. Real expression
/// parsing lives in the (external, out-of-scope) expression evaluator
/// collaborator; this trait is the seam the driver calls through.
pub trait ExprRegistry: Send + Sync {
    fn resolve(&self, expr: &str) -> Arc<dyn ExprEvaluator>;
}

/// Stand-in registry used when no real expression evaluator has been wired
/// in: treats the expression string itself as a literal scope name. Good
/// enough for names that happen to fail the legal-assignment-target check
/// only because of a registry quirk, and for tests.
pub struct IdentityExprRegistry;

impl ExprRegistry for IdentityExprRegistry {
    fn resolve(&self, expr: &str) -> Arc<dyn ExprEvaluator> {
        Arc::new(IdentityExpr(expr.to_string()))
    }
}

struct IdentityExpr(String);

#[async_trait]
impl ExprEvaluator for IdentityExpr {
    async fn set(&self, value: &Value, scope: &mut dyn CaseScope) -> Result<(), String> {
        scope.set(&self.0, value).await
    }

    async fn evaluate(&self, scope: &dyn CaseScope) -> Result<Value, String> {
        scope.get(&self.0).await
    }
}

/// A parameterized evaluation request plus its future outputs and status.
#[derive(Clone)]
pub struct Case {
    inputs: IndexMap<String, Value>,
    outputs: IndexMap<String, Value>,
    exprs: IndexMap<String, Arc<dyn ExprEvaluator>>,
    expr_registry: Arc<dyn ExprRegistry>,
    pub max_retries: u32,
    pub retries: u32,
    pub label: String,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub msg: Option<String>,
    pub exc: Option<StructuredError>,
}

impl Default for Case {
    fn default() -> Self {
        Self::new()
    }
}

impl Case {
    pub fn new() -> Self {
        Self::with_expr_registry(Arc::new(IdentityExprRegistry))
    }

    pub fn with_expr_registry(expr_registry: Arc<dyn ExprRegistry>) -> Self {
        Self {
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            exprs: IndexMap::new(),
            expr_registry,
            max_retries: 0,
            retries: 0,
            label: String::new(),
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            timestamp: Utc::now(),
            msg: None,
            exc: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = (String, Value)>) -> Self {
        for (name, value) in inputs {
            self.add_input(name, value);
        }
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = OutputSpec>) -> Self {
        for spec in outputs {
            match spec {
                OutputSpec::Name(name) => self.add_output(name, None),
                OutputSpec::NameValue(name, value) => self.add_output(name, Some(value)),
            }
        }
        self
    }

    /// Whether `name` is legal as the left-hand side of a plain assignment
    /// (an identifier, optionally followed by `.attr` or `[index]` segments).
    /// Anything else is routed through the expression evaluator.
    pub fn is_legal_assignment_target(name: &str) -> bool {
        let mut chars = name.chars().peekable();
        if !parse_ident(&mut chars) {
            return false;
        }
        loop {
            match chars.peek() {
                None => return true,
                Some('.') => {
                    chars.next();
                    if !parse_ident(&mut chars) {
                        return false;
                    }
                }
                Some('[') => {
                    chars.next();
                    let mut saw_digit = false;
                    while let Some(c) = chars.peek().copied() {
                        if c.is_ascii_digit() {
                            saw_digit = true;
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if !saw_digit || chars.next() != Some(']') {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    fn register_expr_if_needed(&mut self, name: &str) {
        if !Self::is_legal_assignment_target(name) {
            let evaluator = self.expr_registry.resolve(name);
            self.exprs.insert(name.to_string(), evaluator);
        }
    }

    pub fn add_input(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.register_expr_if_needed(&name);
        self.inputs.insert(name, value);
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: Option<Value>) {
        let name = name.into();
        self.register_expr_if_needed(&name);
        self.outputs.insert(name, value.unwrap_or(Value::Null));
    }

    pub fn get_inputs(&self, flatten_values: bool) -> Vec<(String, Value)> {
        if flatten_values {
            self.inputs
                .iter()
                .flat_map(|(k, v)| flatten(k, v))
                .collect()
        } else {
            self.inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
    }

    pub fn get_outputs(&self, flatten_values: bool) -> Vec<(String, Value)> {
        if flatten_values {
            self.outputs
                .iter()
                .flat_map(|(k, v)| flatten(k, v))
                .collect()
        } else {
            self.outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }
    }

    /// `iotype` is `"in"`, `"out"`, or `None`; any other string fails with
    /// `CaseError::InvalidIoType`. Preserves inputs-before-outputs order.
    pub fn items(
        &self,
        iotype: Option<&str>,
        flatten_values: bool,
    ) -> Result<Vec<(String, Value)>, CaseError> {
        let iotype = match iotype {
            Some(s) => IoType::parse(s)?,
            None => None,
        };
        Ok(match iotype {
            Some(IoType::In) => self.get_inputs(flatten_values),
            Some(IoType::Out) => self.get_outputs(flatten_values),
            None => {
                let mut all = self.get_inputs(flatten_values);
                all.extend(self.get_outputs(flatten_values));
                all
            }
        })
    }

    pub fn keys(&self, iotype: Option<&str>) -> Result<Vec<String>, CaseError> {
        Ok(self
            .items(iotype, false)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    /// Build a new case containing only the named entries, carrying over
    /// `parent_uuid`, `max_retries`, and `timestamp`. Unknown names fail with
    /// `CaseError::KeyNotFound`.
    pub fn subcase(&self, names: &[String]) -> Result<Case, CaseError> {
        let mut sub = Case::with_expr_registry(self.expr_registry.clone());
        for name in names {
            if let Some(value) = self.inputs.get(name) {
                sub.add_input(name.clone(), value.clone());
            } else if let Some(value) = self.outputs.get(name) {
                sub.add_output(name.clone(), Some(value.clone()));
            } else {
                return Err(CaseError::KeyNotFound(name.clone()));
            }
        }
        sub.parent_uuid = self.parent_uuid;
        sub.max_retries = self.max_retries;
        sub.timestamp = self.timestamp;
        Ok(sub)
    }

    /// Apply every input to `scope`, stamping the scope's case-id with this
    /// case's uuid first. Stops and returns on the first failure, naming the
    /// offending input.
    pub async fn apply_inputs(&self, scope: &mut dyn CaseScope) -> Result<(), (String, String)> {
        scope.set_case_id(self.uuid).await;
        for (name, value) in self.inputs.iter() {
            let result = match self.exprs.get(name) {
                Some(expr) => expr.set(value, scope).await,
                None => scope.set(name, value).await,
            };
            result.map_err(|reason| (name.clone(), reason))?;
        }
        Ok(())
    }

    /// Evaluate every output against `scope`, setting `msg`. Per-output
    /// failures store the sentinel (`Value::Null`) and append to `msg`; all
    /// outputs are processed even if earlier ones failed, and the last
    /// failure is surfaced as this call's error. `timestamp` is always
    /// updated.
    pub async fn update_outputs(
        &mut self,
        scope: &dyn CaseScope,
        msg: Option<String>,
    ) -> Result<(), OutputReadError> {
        self.msg = msg;
        let mut last_err = None;
        let names: Vec<String> = self.outputs.keys().cloned().collect();
        for name in names {
            let result = match self.exprs.get(&name) {
                Some(expr) => expr.evaluate(scope).await,
                None => scope.get(&name).await,
            };
            match result {
                Ok(value) => {
                    self.outputs.insert(name, value);
                }
                Err(reason) => {
                    self.outputs.insert(name.clone(), Value::Null);
                    self.msg = Some(match &self.msg {
                        Some(m) if !m.is_empty() => format!("{m} {reason}"),
                        _ => reason.clone(),
                    });
                    last_err = Some(OutputReadError {
                        name,
                        reason,
                    });
                }
            }
        }
        self.timestamp = Utc::now();
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Clear outputs to the sentinel, reset retries, assign a fresh uuid, and
    /// clear `parent_uuid`. Inputs and outputs' keys are left untouched.
    pub fn reset(&mut self) {
        self.parent_uuid = None;
        self.uuid = Uuid::new_v4();
        self.retries = 0;
        for value in self.outputs.values_mut() {
            *value = Value::Null;
        }
    }
}

impl PartialEq for Case {
    /// Equal iff `msg` and `label` match and the flattened item sequences are
    /// equal element-wise. Any failure during comparison (e.g. a panic-free
    /// mismatch while flattening) is treated as not-equal rather than
    /// propagated.
    fn eq(&self, other: &Self) -> bool {
        if self.msg != other.msg || self.label != other.label {
            return false;
        }
        let (Ok(a), Ok(b)) = (self.items(None, true), other.items(None, true)) else {
            return false;
        };
        a == b
    }
}

fn parse_ident(chars: &mut Peekable<Chars<'_>>) -> bool {
    match chars.peek().copied() {
        Some(c) if c.is_alphabetic() || c == '_' => {
            chars.next();
        }
        _ => return false,
    }
    while let Some(c) = chars.peek().copied() {
        if c.is_alphanumeric() || c == '_' {
            chars.next();
        } else {
            break;
        }
    }
    true
}
