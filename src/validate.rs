//! Inbound type validation.
//!
//! Validation is a pluggable capability: a [`Validator`] coerces a raw
//! JSON value against a declared [`TypeSpec`], or rejects it with the
//! RFC 6901 path of the offending value. The default [`SchemaValidator`]
//! performs structural JSON checks; adapters around richer schema
//! libraries can be dropped in at unit construction.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Structural type descriptor for a field or parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    /// Unchecked passthrough
    Any,
    Null,
    Bool,
    /// Any integral JSON number
    Int,
    /// Any JSON number
    Float,
    String,
    /// Homogeneous array
    Array(Box<TypeSpec>),
    /// Object with required, typed fields. Undeclared fields pass through.
    Object(BTreeMap<String, TypeSpec>),
    /// `null` or the inner type
    Optional(Box<TypeSpec>),
    /// One of a fixed set of strings
    OneOf(Vec<String>),
}

impl TypeSpec {
    /// Short human-readable name used in error reports.
    pub fn describe(&self) -> String {
        match self {
            TypeSpec::Any => "any".into(),
            TypeSpec::Null => "null".into(),
            TypeSpec::Bool => "bool".into(),
            TypeSpec::Int => "int".into(),
            TypeSpec::Float => "number".into(),
            TypeSpec::String => "string".into(),
            TypeSpec::Array(inner) => format!("array<{}>", inner.describe()),
            TypeSpec::Object(_) => "object".into(),
            TypeSpec::Optional(inner) => format!("optional<{}>", inner.describe()),
            TypeSpec::OneOf(variants) => format!("one of {variants:?}"),
        }
    }
}

/// A value failed validation against its declared type.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("expected {expected} at {path:?}, got {found}")]
pub struct ValidateError {
    /// RFC 6901 pointer to the offending value
    pub path: String,
    pub expected: String,
    pub found: String,
}

/// The validation capability consulted for every typed field and every
/// declared action/task parameter.
pub trait Validator: Send + Sync {
    /// Coerce `value` against `spec`, returning the validated value.
    fn validate(&self, spec: &TypeSpec, value: Value) -> Result<Value, ValidateError>;

    /// Canonicalize an outbound value before it enters a projection.
    /// The default is the identity.
    fn project(&self, value: Value) -> Result<Value, ValidateError> {
        Ok(value)
    }
}

/// Default validator: structural JSON checks, no coercion.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, spec: &TypeSpec, value: Value) -> Result<Value, ValidateError> {
        check(spec, &value, "")?;
        Ok(value)
    }
}

fn check(spec: &TypeSpec, value: &Value, path: &str) -> Result<(), ValidateError> {
    let fail = || ValidateError {
        path: path.to_string(),
        expected: spec.describe(),
        found: type_name(value).to_string(),
    };

    match spec {
        TypeSpec::Any => Ok(()),
        TypeSpec::Null => value.is_null().then_some(()).ok_or_else(fail),
        TypeSpec::Bool => value.is_boolean().then_some(()).ok_or_else(fail),
        TypeSpec::Int => (value.is_i64() || value.is_u64())
            .then_some(())
            .ok_or_else(fail),
        TypeSpec::Float => value.is_number().then_some(()).ok_or_else(fail),
        TypeSpec::String => value.is_string().then_some(()).ok_or_else(fail),
        TypeSpec::Array(inner) => {
            let items = value.as_array().ok_or_else(fail)?;
            for (i, item) in items.iter().enumerate() {
                check(inner, item, &format!("{path}/{i}"))?;
            }
            Ok(())
        }
        TypeSpec::Object(fields) => {
            let map = value.as_object().ok_or_else(fail)?;
            for (field, field_spec) in fields {
                let field_path = format!("{path}/{field}");
                match map.get(field) {
                    Some(v) => check(field_spec, v, &field_path)?,
                    None => {
                        return Err(ValidateError {
                            path: field_path,
                            expected: field_spec.describe(),
                            found: "missing".into(),
                        })
                    }
                }
            }
            Ok(())
        }
        TypeSpec::Optional(inner) => {
            if value.is_null() {
                Ok(())
            } else {
                check(inner, value, path)
            }
        }
        TypeSpec::OneOf(variants) => {
            let s = value.as_str().ok_or_else(fail)?;
            variants
                .iter()
                .any(|v| v == s)
                .then_some(())
                .ok_or_else(fail)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
