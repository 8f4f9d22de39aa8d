//! Argument and result shapes used to materialize decoded payloads.
//!
//! A payload serializer produces an untyped value tree. The binder tells the
//! codec which shape each argument of a target, and each result of an
//! outstanding invocation, must have.

use crate::error::BindingError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Expected shape of a payload value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentShape {
    Any,
    Bool,
    Integer,
    Number,
    String,
    Array,
    Object,
    Optional(Box<ArgumentShape>),
}

/// A value did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, got {actual}")]
pub struct ShapeMismatch {
    pub expected: String,
    pub actual: &'static str,
}

impl ArgumentShape {
    pub fn optional(inner: ArgumentShape) -> Self {
        ArgumentShape::Optional(Box::new(inner))
    }

    /// Materializes `value` into this shape.
    ///
    /// Integral floats are accepted for `Integer` since binary encodings may
    /// widen them.
    pub fn bind(&self, value: Value) -> Result<Value, ShapeMismatch> {
        match (self, value) {
            (ArgumentShape::Any, value) => Ok(value),
            (ArgumentShape::Optional(_), Value::Null) => Ok(Value::Null),
            (ArgumentShape::Optional(inner), value) => inner.bind(value),
            (ArgumentShape::Bool, value @ Value::Bool(_)) => Ok(value),
            (ArgumentShape::Number, value @ Value::Number(_)) => Ok(value),
            (ArgumentShape::String, value @ Value::String(_)) => Ok(value),
            (ArgumentShape::Array, value @ Value::Array(_)) => Ok(value),
            (ArgumentShape::Object, value @ Value::Object(_)) => Ok(value),
            (ArgumentShape::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    return Ok(Value::Number(n));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(self.mismatch("fractional number")),
                }
            }
            (_, value) => Err(self.mismatch(value_kind(&value))),
        }
    }

    fn mismatch(&self, actual: &'static str) -> ShapeMismatch {
        ShapeMismatch {
            expected: self.to_string(),
            actual,
        }
    }
}

impl fmt::Display for ArgumentShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgumentShape::Any => write!(f, "any"),
            ArgumentShape::Bool => write!(f, "bool"),
            ArgumentShape::Integer => write!(f, "integer"),
            ArgumentShape::Number => write!(f, "number"),
            ArgumentShape::String => write!(f, "string"),
            ArgumentShape::Array => write!(f, "array"),
            ArgumentShape::Object => write!(f, "object"),
            ArgumentShape::Optional(inner) => write!(f, "optional {}", inner),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parameter list of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameters {
    /// Exactly these arguments, in order.
    Fixed(Vec<ArgumentShape>),
    /// Any number of arguments of one shape.
    Variadic(ArgumentShape),
}

impl Parameters {
    pub fn none() -> Self {
        Parameters::Fixed(Vec::new())
    }

    pub fn bind(&self, target: &str, arguments: Vec<Value>) -> Result<Vec<Value>, BindingError> {
        match self {
            Parameters::Fixed(shapes) => {
                if shapes.len() != arguments.len() {
                    return Err(BindingError::ArgumentCount {
                        target: target.to_string(),
                        expected: shapes.len(),
                        actual: arguments.len(),
                    });
                }
                shapes
                    .iter()
                    .zip(arguments)
                    .enumerate()
                    .map(|(index, (shape, value))| bind_argument(target, index, shape, value))
                    .collect()
            }
            Parameters::Variadic(shape) => arguments
                .into_iter()
                .enumerate()
                .map(|(index, value)| bind_argument(target, index, shape, value))
                .collect(),
        }
    }
}

fn bind_argument(
    target: &str,
    index: usize,
    shape: &ArgumentShape,
    value: Value,
) -> Result<Value, BindingError> {
    shape.bind(value).map_err(|source| BindingError::Argument {
        target: target.to_string(),
        index,
        source,
    })
}

/// Supplies expected shapes while decoding. Must answer without blocking.
pub trait InvocationBinder: Send + Sync {
    /// Parameters of a target the peer may invoke, or `None` if it is unknown.
    fn parameters(&self, target: &str) -> Option<Parameters>;

    /// Shape of the result (or stream items) of an invocation this side issued.
    fn return_shape(&self, invocation_id: &str) -> Option<ArgumentShape>;
}

/// Binder that accepts every target and every value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveBinder;

impl InvocationBinder for PermissiveBinder {
    fn parameters(&self, _target: &str) -> Option<Parameters> {
        Some(Parameters::Variadic(ArgumentShape::Any))
    }

    fn return_shape(&self, _invocation_id: &str) -> Option<ArgumentShape> {
        Some(ArgumentShape::Any)
    }
}

/// Declared signature of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSignature {
    pub parameters: Parameters,
    pub returns: ArgumentShape,
}

/// Table of targets keyed by name.
///
/// On its own it binds arguments of peer invocations. Result shapes are
/// keyed by invocation id, which only a correlator knows; it maps an id back
/// to its target and asks [`TargetRegistry::returns`].
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, TargetSignature>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(
        mut self,
        name: impl Into<String>,
        parameters: Parameters,
        returns: ArgumentShape,
    ) -> Self {
        self.register(name, parameters, returns);
        self
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        parameters: Parameters,
        returns: ArgumentShape,
    ) {
        self.targets.insert(
            name.into(),
            TargetSignature {
                parameters,
                returns,
            },
        );
    }

    pub fn signature(&self, name: &str) -> Option<&TargetSignature> {
        self.targets.get(name)
    }

    /// Result shape of a target; unknown targets yield `Any`.
    pub fn returns(&self, name: &str) -> ArgumentShape {
        self.targets
            .get(name)
            .map(|s| s.returns.clone())
            .unwrap_or(ArgumentShape::Any)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl InvocationBinder for TargetRegistry {
    fn parameters(&self, target: &str) -> Option<Parameters> {
        self.targets.get(target).map(|s| s.parameters.clone())
    }

    fn return_shape(&self, _invocation_id: &str) -> Option<ArgumentShape> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_scalars() {
        assert_eq!(ArgumentShape::Bool.bind(json!(true)).unwrap(), json!(true));
        assert_eq!(ArgumentShape::String.bind(json!("x")).unwrap(), json!("x"));
        assert_eq!(ArgumentShape::Number.bind(json!(1.5)).unwrap(), json!(1.5));
        assert_eq!(ArgumentShape::Any.bind(json!(null)).unwrap(), json!(null));

        let err = ArgumentShape::String.bind(json!(5)).unwrap_err();
        assert_eq!(err.expected, "string");
        assert_eq!(err.actual, "number");
    }

    #[test]
    fn test_bind_integer_materializes_integral_floats() {
        assert_eq!(ArgumentShape::Integer.bind(json!(42)).unwrap(), json!(42));
        assert_eq!(ArgumentShape::Integer.bind(json!(3.0)).unwrap(), json!(3));
        assert!(ArgumentShape::Integer.bind(json!(3.5)).is_err());
        assert!(ArgumentShape::Integer.bind(json!("3")).is_err());
    }

    #[test]
    fn test_bind_optional() {
        let shape = ArgumentShape::optional(ArgumentShape::Object);
        assert_eq!(shape.bind(json!(null)).unwrap(), json!(null));
        assert_eq!(shape.bind(json!({"a": 1})).unwrap(), json!({"a": 1}));

        let err = shape.bind(json!([1])).unwrap_err();
        assert_eq!(err.expected, "object");
        assert_eq!(err.actual, "array");
    }

    #[test]
    fn test_fixed_parameters() {
        let params = Parameters::Fixed(vec![ArgumentShape::Integer, ArgumentShape::Integer]);
        assert_eq!(
            params.bind("Add", vec![json!(1), json!(2.0)]).unwrap(),
            vec![json!(1), json!(2)]
        );

        let err = params.bind("Add", vec![json!(1)]).unwrap_err();
        assert_eq!(
            err,
            BindingError::ArgumentCount {
                target: "Add".into(),
                expected: 2,
                actual: 1
            }
        );

        let err = params.bind("Add", vec![json!(1), json!("two")]).unwrap_err();
        assert!(matches!(err, BindingError::Argument { index: 1, .. }));
    }

    #[test]
    fn test_variadic_parameters() {
        let params = Parameters::Variadic(ArgumentShape::String);
        assert!(params.bind("Log", vec![]).unwrap().is_empty());
        assert_eq!(params.bind("Log", vec![json!("a"), json!("b")]).unwrap().len(), 2);
        assert!(params.bind("Log", vec![json!("a"), json!(1)]).is_err());
    }

    #[test]
    fn test_registry_binder() {
        let registry = TargetRegistry::new()
            .with_target("Echo", Parameters::Fixed(vec![ArgumentShape::Any]), ArgumentShape::Any)
            .with_target("Count", Parameters::Fixed(vec![ArgumentShape::Integer]), ArgumentShape::Integer);

        assert_eq!(registry.len(), 2);
        assert!(registry.parameters("Echo").is_some());
        assert!(registry.parameters("Missing").is_none());
        assert_eq!(registry.returns("Count"), ArgumentShape::Integer);
        assert_eq!(registry.returns("Missing"), ArgumentShape::Any);
        assert_eq!(registry.return_shape("1"), None);
    }

    #[test]
    fn test_permissive_binder() {
        let binder = PermissiveBinder;
        let params = binder.parameters("Anything").unwrap();
        assert_eq!(params.bind("Anything", vec![json!(1), json!("x")]).unwrap().len(), 2);
        assert_eq!(binder.return_shape("42"), Some(ArgumentShape::Any));
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(ArgumentShape::optional(ArgumentShape::Integer).to_string(), "optional integer");
    }
}
