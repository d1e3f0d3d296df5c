use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operators of the simple comparator mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    IsEmpty,
    IsNotEmpty,
}

/// Compare `actual` against `expected` with the given operator.
///
/// Ordering operators coerce both sides to numbers and are false when
/// either side is not numeric. String comparison is case-insensitive
/// unless `case_sensitive` is set.
pub fn evaluate_simple(
    actual: &Value,
    op: CompareOp,
    expected: &Value,
    case_sensitive: bool,
) -> bool {
    match op {
        CompareOp::Equals => eval_equals(actual, expected, case_sensitive),
        CompareOp::NotEquals => !eval_equals(actual, expected, case_sensitive),
        CompareOp::Contains => eval_contains(actual, expected, case_sensitive),
        CompareOp::NotContains => !eval_contains(actual, expected, case_sensitive),
        CompareOp::Greater => eval_ordering(actual, expected, |a, b| a > b),
        CompareOp::Less => eval_ordering(actual, expected, |a, b| a < b),
        CompareOp::GreaterEqual => eval_ordering(actual, expected, |a, b| a >= b),
        CompareOp::LessEqual => eval_ordering(actual, expected, |a, b| a <= b),
        CompareOp::IsEmpty => is_empty(actual),
        CompareOp::IsNotEmpty => !is_empty(actual),
    }
}

pub(crate) fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn eval_equals(actual: &Value, expected: &Value, case_sensitive: bool) -> bool {
    // Numeric equality wins when both sides coerce.
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return (a - b).abs() < f64::EPSILON;
    }

    let a = as_text(actual);
    let b = as_text(expected);
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(&b)
    }
}

fn eval_contains(actual: &Value, expected: &Value, case_sensitive: bool) -> bool {
    let needle = as_text(expected);

    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| eval_equals(item, expected, case_sensitive)),
        _ => {
            let haystack = as_text(actual);
            if case_sensitive {
                haystack.contains(&needle)
            } else {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
        }
    }
}

fn eval_ordering(actual: &Value, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn greater_with_numbers() {
        assert!(evaluate_simple(&json!(5), CompareOp::Greater, &json!(3), false));
        assert!(!evaluate_simple(&json!(2), CompareOp::Greater, &json!(3), false));
    }

    #[test]
    fn ordering_coerces_numeric_strings() {
        assert!(evaluate_simple(&json!("42"), CompareOp::Greater, &json!("10"), false));
        assert!(evaluate_simple(&json!("3"), CompareOp::LessEqual, &json!(3), false));
    }

    #[test]
    fn ordering_is_false_for_non_numeric() {
        assert!(!evaluate_simple(&json!("abc"), CompareOp::Greater, &json!(1), false));
    }

    #[test]
    fn equals_case_insensitive_by_default() {
        assert!(evaluate_simple(&json!("Hello"), CompareOp::Equals, &json!("hello"), false));
        assert!(!evaluate_simple(&json!("Hello"), CompareOp::Equals, &json!("hello"), true));
    }

    #[test]
    fn equals_numeric_across_types() {
        assert!(evaluate_simple(&json!("5"), CompareOp::Equals, &json!(5), false));
    }

    #[test]
    fn contains_case_insensitive() {
        assert!(evaluate_simple(&json!("AbC"), CompareOp::Contains, &json!("bc"), false));
        assert!(!evaluate_simple(&json!("AbC"), CompareOp::Contains, &json!("bc"), true));
    }

    #[test]
    fn contains_in_array() {
        assert!(evaluate_simple(
            &json!(["a", "b"]),
            CompareOp::Contains,
            &json!("B"),
            false
        ));
    }

    #[test]
    fn empty_checks() {
        assert!(evaluate_simple(&json!(""), CompareOp::IsEmpty, &Value::Null, false));
        assert!(evaluate_simple(&Value::Null, CompareOp::IsEmpty, &Value::Null, false));
        assert!(evaluate_simple(&json!([]), CompareOp::IsEmpty, &Value::Null, false));
        assert!(evaluate_simple(&json!("x"), CompareOp::IsNotEmpty, &Value::Null, false));
        assert!(!evaluate_simple(&json!(0), CompareOp::IsEmpty, &Value::Null, false));
    }

    #[test]
    fn operator_names_deserialize() {
        let op: CompareOp = serde_json::from_str("\"not_contains\"").unwrap();
        assert_eq!(op, CompareOp::NotContains);
        let op: CompareOp = serde_json::from_str("\"greater_equal\"").unwrap();
        assert_eq!(op, CompareOp::GreaterEqual);
    }
}
