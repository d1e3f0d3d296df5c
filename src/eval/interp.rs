use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::eval::ast::{BinOp, Expr, UnaryOp};
use crate::eval::lexer::tokenize;
use crate::eval::parser::Parser;
use crate::eval::{EVAL_TIMEOUT_MS, MAX_DEPTH, MAX_EXPRESSION_LEN};

/// Root identifiers that may appear anywhere in an expression.
const NAMESPACE_ROOTS: &[&str] = &["user", "session", "project", "global"];

/// Identifiers that may only appear as the callee of a call.
const FUNCTIONS: &[&str] = &["get", "num", "str", "isEmpty", "notEmpty"];

/// Allowed `Math.*` members.
const MATH_FUNCTIONS: &[&str] = &["abs", "min", "max", "floor", "ceil", "round"];

/// Snapshot of the four variable scopes an expression may read.
#[derive(Debug, Default, Clone)]
pub struct EvalScope {
    pub global: HashMap<String, Value>,
    pub project: HashMap<String, Value>,
    pub user: HashMap<String, Value>,
    pub session: HashMap<String, Value>,
}

impl EvalScope {
    fn namespace(&self, root: &str) -> Option<&HashMap<String, Value>> {
        match root {
            "global" => Some(&self.global),
            "project" => Some(&self.project),
            "user" => Some(&self.user),
            "session" => Some(&self.session),
            _ => None,
        }
    }

    /// Scope-exact lookup, used by `get(name, scope)`.
    pub fn scoped(&self, scope: &str, name: &str) -> Option<Value> {
        self.namespace(scope).and_then(|m| m.get(name).cloned())
    }

    /// Ordered lookup for bare `get(name)`: session, user, project,
    /// global. Convenience only; the store API stays scope-exact.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.session
            .get(name)
            .or_else(|| self.user.get(name))
            .or_else(|| self.project.get(name))
            .or_else(|| self.global.get(name))
            .cloned()
    }
}

/// Parse, whitelist-check, and evaluate an expression, coercing the
/// result to a boolean. Expressions are authored by non-trusted project
/// operators: any node outside the restricted grammar or identifier
/// outside the whitelist is a hard error, and both parsing and
/// evaluation share a deadline.
pub fn evaluate_expression(source: &str, scope: &EvalScope) -> Result<bool> {
    let value = evaluate_value(source, scope)?;
    Ok(truthy(&value))
}

/// Like [`evaluate_expression`] but preserves the raw result value.
pub fn evaluate_value(source: &str, scope: &EvalScope) -> Result<Value> {
    if source.len() > MAX_EXPRESSION_LEN {
        return Err(EngineError::Guard(format!(
            "expression exceeds {} characters",
            MAX_EXPRESSION_LEN
        ))
        .into());
    }

    let deadline = Instant::now() + Duration::from_millis(EVAL_TIMEOUT_MS);

    let tokens = tokenize(source)?;
    let expr = Parser::new(tokens).parse()?;
    check_whitelist(&expr)?;
    eval(&expr, scope, deadline, 0)
}

/// Walk the tree before evaluation and reject any identifier outside the
/// whitelist. This is the security boundary, not a style choice.
fn check_whitelist(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Ident(name) => {
            if NAMESPACE_ROOTS.contains(&name.as_str()) {
                Ok(())
            } else {
                Err(EngineError::Security(format!("identifier '{}' is not allowed", name)).into())
            }
        }
        Expr::Member(base, prop) => {
            // `Math` is only reachable through `Math.fn(…)`, which the
            // Call arm handles without recursing here.
            if let Expr::Ident(root) = base.as_ref()
                && root == "Math"
            {
                return Err(EngineError::Security(format!(
                    "'Math.{}' may only be called, not read",
                    prop
                ))
                .into());
            }
            check_whitelist(base)
        }
        Expr::Call(callee, args) => {
            match callee.as_ref() {
                Expr::Ident(name) if FUNCTIONS.contains(&name.as_str()) => {}
                Expr::Member(base, prop) => match base.as_ref() {
                    Expr::Ident(root) if root == "Math" => {
                        if !MATH_FUNCTIONS.contains(&prop.as_str()) {
                            return Err(EngineError::Security(format!(
                                "'Math.{}' is not in the allowed function set",
                                prop
                            ))
                            .into());
                        }
                    }
                    _ => {
                        return Err(EngineError::Security(
                            "only whitelisted functions may be called".to_string(),
                        )
                        .into());
                    }
                },
                Expr::Ident(name) => {
                    return Err(EngineError::Security(format!(
                        "identifier '{}' is not allowed",
                        name
                    ))
                    .into());
                }
                _ => {
                    return Err(EngineError::Security(
                        "only whitelisted functions may be called".to_string(),
                    )
                    .into());
                }
            }
            for arg in args {
                check_whitelist(arg)?;
            }
            Ok(())
        }
        Expr::Unary(_, operand) => check_whitelist(operand),
        Expr::Binary(_, left, right) => {
            check_whitelist(left)?;
            check_whitelist(right)
        }
        Expr::Ternary(cond, then, alt) => {
            check_whitelist(cond)?;
            check_whitelist(then)?;
            check_whitelist(alt)
        }
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(expr: &Expr, scope: &EvalScope, deadline: Instant, depth: usize) -> Result<Value> {
    if Instant::now() > deadline {
        return Err(EngineError::Guard("expression evaluation timed out".to_string()).into());
    }
    if depth >= MAX_DEPTH {
        return Err(EngineError::Guard(format!("evaluation depth exceeds {}", MAX_DEPTH)).into());
    }

    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => {
            let ns = scope.namespace(name).ok_or_else(|| {
                EngineError::Security(format!("identifier '{}' is not allowed", name))
            })?;
            let map: Map<String, Value> =
                ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            Ok(Value::Object(map))
        }
        Expr::Member(base, prop) => {
            let base = eval(base, scope, deadline, depth + 1)?;
            Ok(base.get(prop).cloned().unwrap_or(Value::Null))
        }
        Expr::Call(callee, args) => eval_call(callee, args, scope, deadline, depth),
        Expr::Unary(op, operand) => {
            let v = eval(operand, scope, deadline, depth + 1)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => {
                    let n = as_number(&v).ok_or_else(|| {
                        EngineError::Config("unary '-' applied to non-number".to_string())
                    })?;
                    Ok(number(-n))
                }
            }
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, scope, deadline, depth),
        Expr::Ternary(cond, then, alt) => {
            let c = eval(cond, scope, deadline, depth + 1)?;
            if truthy(&c) {
                eval(then, scope, deadline, depth + 1)
            } else {
                eval(alt, scope, deadline, depth + 1)
            }
        }
    }
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    scope: &EvalScope,
    deadline: Instant,
    depth: usize,
) -> Result<Value> {
    // Short-circuit logic first.
    match op {
        BinOp::And => {
            let l = eval(left, scope, deadline, depth + 1)?;
            if !truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = eval(right, scope, deadline, depth + 1)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        BinOp::Or => {
            let l = eval(left, scope, deadline, depth + 1)?;
            if truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = eval(right, scope, deadline, depth + 1)?;
            return Ok(Value::Bool(truthy(&r)));
        }
        _ => {}
    }

    let l = eval(left, scope, deadline, depth + 1)?;
    let r = eval(right, scope, deadline, depth + 1)?;

    match op {
        BinOp::Add => {
            if let (Some(a), Some(b)) = (as_number(&l), as_number(&r)) {
                Ok(number(a + b))
            } else {
                Ok(Value::String(format!("{}{}", as_text(&l), as_text(&r))))
            }
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let a = as_number(&l).ok_or_else(|| non_numeric(op, &l))?;
            let b = as_number(&r).ok_or_else(|| non_numeric(op, &r))?;
            let result = match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                _ => {
                    if b == 0.0 {
                        return Err(EngineError::Config("division by zero".to_string()).into());
                    }
                    a / b
                }
            };
            Ok(number(result))
        }
        BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
            match (as_number(&l), as_number(&r)) {
                (Some(a), Some(b)) => {
                    let result = match op {
                        BinOp::Gt => a > b,
                        BinOp::Ge => a >= b,
                        BinOp::Lt => a < b,
                        _ => a <= b,
                    };
                    Ok(Value::Bool(result))
                }
                // Fall back to lexicographic string ordering.
                _ => {
                    let a = as_text(&l);
                    let b = as_text(&r);
                    let result = match op {
                        BinOp::Gt => a > b,
                        BinOp::Ge => a >= b,
                        BinOp::Lt => a < b,
                        _ => a <= b,
                    };
                    Ok(Value::Bool(result))
                }
            }
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn eval_call(
    callee: &Expr,
    args: &[Expr],
    scope: &EvalScope,
    deadline: Instant,
    depth: usize,
) -> Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, scope, deadline, depth + 1)?);
    }

    match callee {
        Expr::Ident(name) => match name.as_str() {
            "get" => {
                let var_name = values
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::Config("get() requires a variable name".to_string())
                    })?;
                match values.get(1).and_then(|v| v.as_str()) {
                    Some(scope_name) => {
                        if scope.namespace(scope_name).is_none() {
                            return Err(EngineError::Security(format!(
                                "unknown scope '{}' in get()",
                                scope_name
                            ))
                            .into());
                        }
                        Ok(scope.scoped(scope_name, var_name).unwrap_or(Value::Null))
                    }
                    None => Ok(scope.lookup(var_name).unwrap_or(Value::Null)),
                }
            }
            "num" => {
                let v = values.first().unwrap_or(&Value::Null);
                Ok(as_number(v).map(number).unwrap_or(Value::Null))
            }
            "str" => {
                let v = values.first().unwrap_or(&Value::Null);
                Ok(Value::String(as_text(v)))
            }
            "isEmpty" => {
                let v = values.first().unwrap_or(&Value::Null);
                Ok(Value::Bool(crate::eval::simple::is_empty(v)))
            }
            "notEmpty" => {
                let v = values.first().unwrap_or(&Value::Null);
                Ok(Value::Bool(!crate::eval::simple::is_empty(v)))
            }
            other => {
                Err(EngineError::Security(format!("identifier '{}' is not allowed", other)).into())
            }
        },
        Expr::Member(base, fname) if matches!(base.as_ref(), Expr::Ident(r) if r == "Math") => {
            let nums: Vec<f64> = values.iter().filter_map(as_number).collect();
            if nums.len() != values.len() {
                return Err(EngineError::Config(format!(
                    "Math.{} requires numeric arguments",
                    fname
                ))
                .into());
            }
            let result = match (fname.as_str(), nums.as_slice()) {
                ("abs", [x]) => x.abs(),
                ("floor", [x]) => x.floor(),
                ("ceil", [x]) => x.ceil(),
                ("round", [x]) => x.round(),
                ("min", xs) if !xs.is_empty() => xs.iter().cloned().fold(f64::MAX, f64::min),
                ("max", xs) if !xs.is_empty() => xs.iter().cloned().fold(f64::MIN, f64::max),
                _ => {
                    return Err(EngineError::Config(format!(
                        "Math.{} called with wrong arity",
                        fname
                    ))
                    .into());
                }
            };
            Ok(number(result))
        }
        _ => Err(EngineError::Security("only whitelisted functions may be called".to_string())
            .into()),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return (a - b).abs() < f64::EPSILON;
    }
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => as_text(l) == as_text(r),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn non_numeric(op: BinOp, v: &Value) -> EngineError {
    EngineError::Config(format!("operator {:?} applied to non-number {}", op, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with_session(vars: Vec<(&str, Value)>) -> EvalScope {
        let mut scope = EvalScope::default();
        for (k, v) in vars {
            scope.session.insert(k.to_string(), v);
        }
        scope
    }

    #[test]
    fn get_with_ordered_lookup() {
        let scope = scope_with_session(vec![("balance", json!(150))]);
        assert!(evaluate_expression("get('balance') > 100", &scope).unwrap());
        assert!(!evaluate_expression("get('balance') > 200", &scope).unwrap());
    }

    #[test]
    fn get_with_explicit_scope_is_exact() {
        let mut scope = EvalScope::default();
        scope.user.insert("vip".to_string(), json!(true));
        assert!(evaluate_expression("get('vip', 'user')", &scope).unwrap());
        assert!(!evaluate_expression("get('vip', 'session')", &scope).unwrap());
    }

    #[test]
    fn namespace_member_access() {
        let mut scope = EvalScope::default();
        scope.user.insert("name".to_string(), json!("Alice"));
        assert!(evaluate_expression("user.name == 'Alice'", &scope).unwrap());
        assert!(!evaluate_expression("session.name == 'Alice'", &scope).unwrap());
    }

    #[test]
    fn disallowed_identifier_is_security_error() {
        let scope = EvalScope::default();
        let err = evaluate_expression("require('fs')", &scope).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine_err, EngineError::Security(_)));
    }

    #[test]
    fn disallowed_math_member_rejected() {
        let scope = EvalScope::default();
        assert!(evaluate_expression("Math.random() > 0", &scope).is_err());
        assert!(evaluate_expression("Math.abs(-5) == 5", &scope).unwrap());
    }

    #[test]
    fn ternary_and_logic() {
        let scope = scope_with_session(vec![("tier", json!("gold"))]);
        assert!(
            evaluate_expression("get('tier') == 'gold' ? true : false", &scope).unwrap()
        );
        assert!(
            evaluate_expression("get('tier') == 'silver' || notEmpty(get('tier'))", &scope)
                .unwrap()
        );
    }

    #[test]
    fn helpers_and_conversions() {
        let scope = scope_with_session(vec![("n", json!("12"))]);
        assert!(evaluate_expression("num(get('n')) + 1 == 13", &scope).unwrap());
        assert!(evaluate_expression("str(get('n')) == '12'", &scope).unwrap());
        assert!(evaluate_expression("isEmpty(get('missing'))", &scope).unwrap());
    }

    #[test]
    fn length_cap_enforced() {
        let scope = EvalScope::default();
        let long = format!("1 + {}", "1 + ".repeat(400));
        let err = evaluate_expression(&format!("{}1", long), &scope).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert!(matches!(engine_err, EngineError::Guard(_)));
    }

    #[test]
    fn division_by_zero_is_config_error() {
        let scope = EvalScope::default();
        assert!(evaluate_expression("1 / 0 > 0", &scope).is_err());
    }

    #[test]
    fn result_coerced_to_boolean() {
        let scope = EvalScope::default();
        assert!(evaluate_expression("1 + 1", &scope).unwrap());
        assert!(!evaluate_expression("''", &scope).unwrap());
        assert!(!evaluate_expression("0", &scope).unwrap());
    }
}
