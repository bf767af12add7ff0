//! Expression evaluation.

use hodei_runner_core::Result;
use serde_json::Value as Context;

use super::coerce::coerce_bool;
use super::expression_error;
use super::parser::Expr;

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Structured context values surface as JSON.
    Json(Context),
}

/// Per-evaluation state for the `success`/`failure`/`always` built-ins.
#[derive(Debug, Default)]
pub struct EvalState {
    pub is_success: bool,
    pub eval_failure: bool,
    pub eval_always: bool,
}

pub fn eval(expr: &Expr, inputs: &Context, state: &mut EvalState) -> Result<Value> {
    match expr {
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Float(v) => Ok(Value::Float(*v)),
        Expr::Bool(v) => Ok(Value::Bool(*v)),
        Expr::Path(path) => Ok(lookup(inputs, path)),
        Expr::Call(name) => match name.as_str() {
            "success" => Ok(Value::Bool(state.is_success)),
            "failure" => {
                state.eval_failure = true;
                Ok(Value::Bool(!state.is_success))
            }
            "always" => {
                state.eval_always = true;
                Ok(Value::Bool(true))
            }
            other => Err(expression_error(format!("unknown function: {other}"))),
        },
        Expr::Not(inner) => {
            let v = eval(inner, inputs, state)?;
            Ok(Value::Bool(!coerce_bool(&v)))
        }
        Expr::Eq(a, b) => {
            let a = eval(a, inputs, state)?;
            let b = eval(b, inputs, state)?;
            Ok(Value::Bool(loose_eq(&a, &b)))
        }
        Expr::NotEq(a, b) => {
            let a = eval(a, inputs, state)?;
            let b = eval(b, inputs, state)?;
            Ok(Value::Bool(!loose_eq(&a, &b)))
        }
        Expr::And(a, b) => {
            if !coerce_bool(&eval(a, inputs, state)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(coerce_bool(&eval(b, inputs, state)?)))
        }
        Expr::Or(a, b) => {
            if coerce_bool(&eval(a, inputs, state)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(coerce_bool(&eval(b, inputs, state)?)))
        }
    }
}

/// Resolves a dotted path against the context. Missing segments resolve
/// to null rather than erroring.
fn lookup(inputs: &Context, path: &[String]) -> Value {
    let mut current = inputs;
    for part in path {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    from_json(current)
}

fn from_json(v: &Context) -> Value {
    match v {
        Context::Null => Value::Null,
        Context::Bool(b) => Value::Bool(*b),
        Context::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        Context::String(s) => Value::Str(s.clone()),
        other => Value::Json(other.clone()),
    }
}

/// Equality with the original's loose semantics: numbers compare across
/// int/float, everything else compares after string coercion.
fn loose_eq(a: &Value, b: &Value) -> bool {
    use super::coerce::coerce_string;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => coerce_string(a) == coerce_string(b),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use serde_json::json;

    fn run(code: &str, ctx: &Context) -> Value {
        let program = parse(code).unwrap();
        let mut state = EvalState::default();
        eval(&program, ctx, &mut state).unwrap()
    }

    #[test]
    fn test_loose_equality() {
        let ctx = json!({"n": 5});
        assert_eq!(run("n == 5", &ctx), Value::Bool(true));
        assert_eq!(run("n == '5'", &ctx), Value::Bool(true));
        assert_eq!(run("n == 5.0", &ctx), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_builtin_flags() {
        let program = parse("false && failure()").unwrap();
        let mut state = EvalState {
            is_success: true,
            ..Default::default()
        };
        eval(&program, &json!({}), &mut state).unwrap();
        assert!(!state.eval_failure);
    }
}
