//! Expression evaluation for `${{ … }}` templates and `when` conditions.
//!
//! The language is deliberately small: dotted-path variable lookup over a
//! JSON context, string/number/boolean literals, equality and boolean
//! operators, and the three built-ins `success()`, `failure()` and
//! `always()`. Expressions are pure; undefined variables coerce to empty
//! rather than raising.

mod coerce;
mod eval;
mod lexer;
mod parser;

pub use coerce::{coerce_bool, coerce_string};
pub use eval::Value;

use hodei_runner_core::{DomainError, Result};
use serde_json::Value as Context;

/// Evaluates an expression against the variable context.
pub fn eval(code: &str, inputs: &Context) -> Result<Value> {
    let program = parser::parse(code)?;
    let mut state = eval::EvalState::default();
    eval::eval(&program, inputs, &mut state)
}

/// Evaluates an expression and coerces the result to a string.
pub fn eval_str(code: &str, inputs: &Context) -> Result<String> {
    Ok(coerce_string(&eval(code, inputs)?))
}

/// Evaluates an expression and coerces the result to a boolean.
pub fn eval_bool(code: &str, inputs: &Context) -> Result<bool> {
    Ok(coerce_bool(&eval(code, inputs)?))
}

/// Evaluates a when clause, returning `(on_success, on_failure)`.
///
/// The expression is compiled once and evaluated twice: first assuming
/// the pipeline is passing, then assuming it is failing. The built-ins
/// referenced during evaluation decide how the two outcomes combine.
pub fn eval_when(code: &str, inputs: &Context) -> Result<(bool, bool)> {
    let mut code = code.trim();
    if let Some(inner) = code.strip_prefix("${{") {
        code = inner.strip_suffix("}}").unwrap_or(inner);
    }

    let program = parser::parse(code)?;

    let mut state = eval::EvalState {
        is_success: true,
        ..Default::default()
    };
    let on_success = eval::eval(&program, inputs, &mut state)?;

    state.is_success = false;
    let on_failure = eval::eval(&program, inputs, &mut state)?;

    if state.eval_always {
        return Ok((true, true));
    }

    Ok((
        coerce_bool(&on_success),
        coerce_bool(&on_failure) && state.eval_failure,
    ))
}

/// Replaces every `${{ … }}` segment in the text with its evaluated
/// string value. Text without markers is returned unchanged.
pub fn expand(code: &str, inputs: &Context) -> String {
    if !code.contains("${{") {
        return code.to_string();
    }
    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some(start) = rest.find("${{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        match after.find("}}") {
            Some(end) => {
                let inner = &after[..end];
                out.push_str(&eval_str(inner, inputs).unwrap_or_default());
                rest = &after[end + 2..];
            }
            None => {
                // unterminated marker is emitted verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub(crate) fn expression_error(msg: impl Into<String>) -> DomainError {
    DomainError::Expression(msg.into())
}
