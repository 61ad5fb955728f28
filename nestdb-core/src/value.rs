//! JSON value helpers shared by the store and the script engine.

use serde_json::{Number, Value};

/// JS-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Structural equality with numbers compared by value.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a
                .as_f64()
                .zip(b.as_f64())
                .map(|(a, b)| a == b)
                .unwrap_or(false),
        },
        _ => a == b,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Short name of a value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Arithmetic operators over JSON numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Applies `op`, staying in integer arithmetic while the result is exact.
///
/// Returns `None` for division by zero and non-finite results.
pub fn arith(op: ArithOp, a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
            ArithOp::Mul => x.checked_mul(y),
            ArithOp::Div if y != 0 && x.checked_rem(y) == Some(0) => x.checked_div(y),
            ArithOp::Rem if y != 0 => x.checked_rem(y),
            ArithOp::Div | ArithOp::Rem if y == 0 => return None,
            ArithOp::Div | ArithOp::Rem => None,
        };
        if let Some(n) = exact {
            return Some(Number::from(n));
        }
    }

    let x = a.as_f64()?;
    let y = b.as_f64()?;
    let result = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div | ArithOp::Rem if y == 0.0 => return None,
        ArithOp::Div => x / y,
        ArithOp::Rem => x % y,
    };
    Number::from_f64(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn num(v: Value) -> Number {
        match v {
            Value::Number(n) => n,
            _ => panic!("not a number"),
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(values_equal(&json!({"a": [1]}), &json!({"a": [1]})));
        assert!(!values_equal(&json!("2"), &json!(2)));
    }

    #[test]
    fn test_integer_arithmetic_stays_integral() {
        let r = arith(ArithOp::Mul, &num(json!(10)), &num(json!(2))).unwrap();
        assert_eq!(Value::Number(r), json!(20));

        let r = arith(ArithOp::Div, &num(json!(9)), &num(json!(3))).unwrap();
        assert_eq!(Value::Number(r), json!(3));

        let r = arith(ArithOp::Div, &num(json!(7)), &num(json!(2))).unwrap();
        assert_eq!(Value::Number(r), json!(3.5));

        let r = arith(ArithOp::Rem, &num(json!(7)), &num(json!(4))).unwrap();
        assert_eq!(Value::Number(r), json!(3));
    }

    #[test]
    fn test_float_and_overflow() {
        let r = arith(ArithOp::Add, &num(json!(0.5)), &num(json!(1))).unwrap();
        assert_eq!(Value::Number(r), json!(1.5));

        let r = arith(ArithOp::Add, &num(json!(i64::MAX)), &num(json!(1))).unwrap();
        assert!(r.is_f64());
        assert_eq!(r.as_f64(), Some(i64::MAX as f64));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(arith(ArithOp::Div, &num(json!(1)), &num(json!(0))).is_none());
        assert!(arith(ArithOp::Rem, &num(json!(1)), &num(json!(0))).is_none());
        assert!(arith(ArithOp::Div, &num(json!(1.5)), &num(json!(0.0))).is_none());
    }
}
