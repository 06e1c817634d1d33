//! Host-side model of a settled interpreter value, decoupled from any
//! interpreter handle so results can outlive the sandbox that produced them.

use serde_json::json;

/// Decoding caps: hostile code can return cyclic or enormous structures, so
/// the sandbox decoder stops at these bounds and marks the rest truncated.
pub const MAX_VALUE_DEPTH: usize = 8;
pub const MAX_VALUE_NODES: usize = 1_000;

/// A JavaScript value decoded into host primitives.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(String),
    Array(Vec<EvalValue>),
    Object(Vec<(String, EvalValue)>),
    /// Placeholder for structure beyond the depth/node caps.
    Truncated,
}

impl EvalValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, EvalValue::Undefined)
    }

    /// JSON image of the value, for structured rendering. Undefined maps to
    /// null, non-finite floats map to null (JSON has no representation).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EvalValue::Undefined | EvalValue::Null => serde_json::Value::Null,
            EvalValue::Bool(b) => json!(b),
            EvalValue::Int(n) => json!(n),
            EvalValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            EvalValue::String(s) => json!(s),
            EvalValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(EvalValue::to_json).collect())
            }
            EvalValue::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            EvalValue::Truncated => json!("…"),
        }
    }

    /// Readable form: scalars print bare, structures as multi-line JSON.
    pub fn render(&self) -> String {
        match self {
            EvalValue::Array(_) | EvalValue::Object(_) => {
                serde_json::to_string_pretty(&self.to_json()).unwrap_or_else(|_| "…".to_string())
            }
            other => other.render_scalar(),
        }
    }

    /// Single-line form used by the console buffer.
    pub fn render_inline(&self) -> String {
        match self {
            EvalValue::Array(_) | EvalValue::Object(_) => {
                serde_json::to_string(&self.to_json()).unwrap_or_else(|_| "…".to_string())
            }
            other => other.render_scalar(),
        }
    }

    fn render_scalar(&self) -> String {
        match self {
            EvalValue::Undefined => "undefined".to_string(),
            EvalValue::Null => "null".to_string(),
            EvalValue::Bool(b) => b.to_string(),
            EvalValue::Int(n) => n.to_string(),
            EvalValue::Float(f) => render_float(*f),
            EvalValue::String(s) => s.clone(),
            EvalValue::Truncated => "…".to_string(),
            EvalValue::Array(_) | EvalValue::Object(_) => String::new(),
        }
    }
}

fn render_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{f}")
    }
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub success: bool,
    /// Settled value on success.
    pub result: Option<EvalValue>,
    /// Failure message on error (user code, timeout, resource exhaustion).
    pub error: Option<String>,
    /// Console lines captured during the run, in emission order.
    pub output: Vec<String>,
}

impl EvalOutcome {
    pub fn ok(result: EvalValue, output: Vec<String>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            output,
        }
    }

    pub fn err(message: impl Into<String>, output: Vec<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_render_bare() {
        assert_eq!(EvalValue::Int(4).render(), "4");
        assert_eq!(EvalValue::Float(4.0).render(), "4");
        assert_eq!(EvalValue::Float(0.5).render(), "0.5");
        assert_eq!(EvalValue::Float(f64::NAN).render(), "NaN");
        assert_eq!(EvalValue::String("World".into()).render(), "World");
        assert_eq!(EvalValue::Bool(true).render(), "true");
        assert_eq!(EvalValue::Null.render(), "null");
    }

    #[test]
    fn structures_render_multi_line() {
        let value = EvalValue::Object(vec![
            ("a".to_string(), EvalValue::Int(1)),
            ("b".to_string(), EvalValue::Array(vec![EvalValue::Int(2)])),
        ]);
        let rendered = value.render();
        assert!(rendered.contains('\n'));
        assert!(rendered.contains("\"a\": 1"));

        assert_eq!(value.render_inline(), r#"{"a":1,"b":[2]}"#);
    }

    #[test]
    fn strings_inside_structures_are_quoted() {
        let value = EvalValue::Array(vec![EvalValue::String("x".into())]);
        assert_eq!(value.render_inline(), r#"["x"]"#);
    }
}
