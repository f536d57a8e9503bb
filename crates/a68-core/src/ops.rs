//! Primitive operator set: fixed functions from popped operand(s) to
//! pushed result(s), one overflow/exceptional-value check per class.

use crate::diagnostic::RuntimeErrorKind;

/// A runtime value as it sits on the expression stack for scalar modes.
/// Composite modes (rows, structs) are addressed through
/// [`crate::runtime::value::Reference`]/[`crate::runtime::value::RowDescriptor`]
/// instead; this enum only covers the scalar primitives (INT, REAL, BOOL,
/// CHAR, BITS, COMPLEX).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i64),
    Real(f64),
    Bool(bool),
    Char(char),
    Bits(u64),
    Complex(f64, f64),
}

type OpResult = Result<Scalar, RuntimeErrorKind>;

/// INT addition: carry-in comparison against `MAX_INT`.
pub fn int_add(a: i64, b: i64) -> OpResult {
    a.checked_add(b).map(Scalar::Int).ok_or(RuntimeErrorKind::IntegerOverflow)
}

pub fn int_sub(a: i64, b: i64) -> OpResult {
    a.checked_sub(b).map(Scalar::Int).ok_or(RuntimeErrorKind::IntegerOverflow)
}

/// INT multiplication via a sign-aware product-overflow predicate.
pub fn int_mul(a: i64, b: i64) -> OpResult {
    a.checked_mul(b).map(Scalar::Int).ok_or(RuntimeErrorKind::IntegerOverflow)
}

pub fn int_div(a: i64, b: i64) -> OpResult {
    if b == 0 {
        return Err(RuntimeErrorKind::DivisionByZero);
    }
    a.checked_div(b).map(Scalar::Int).ok_or(RuntimeErrorKind::IntegerOverflow)
}

pub fn int_mod(a: i64, b: i64) -> OpResult {
    if b == 0 {
        return Err(RuntimeErrorKind::DivisionByZero);
    }
    Ok(Scalar::Int(a.rem_euclid(b)))
}

/// Flushes a REAL arithmetic result through the exceptional-value guard
///: rejects NaN and infinities.
fn test_real_representation(x: f64) -> OpResult {
    if x.is_nan() || x.is_infinite() {
        Err(RuntimeErrorKind::RealOverflow)
    } else {
        Ok(Scalar::Real(x))
    }
}

pub fn real_add(a: f64, b: f64) -> OpResult {
    test_real_representation(a + b)
}

pub fn real_sub(a: f64, b: f64) -> OpResult {
    test_real_representation(a - b)
}

pub fn real_mul(a: f64, b: f64) -> OpResult {
    test_real_representation(a * b)
}

/// REAL division: a division-by-zero test is made explicit since IEEE-754
/// `inf`/`nan` results are rejected by the representation guard regardless,
/// matching hosts without native floating-point traps.
pub fn real_div(a: f64, b: f64) -> OpResult {
    if b == 0.0 {
        return Err(RuntimeErrorKind::DivisionByZero);
    }
    test_real_representation(a / b)
}

pub fn bool_and(a: bool, b: bool) -> OpResult {
    Ok(Scalar::Bool(a && b))
}

pub fn bool_or(a: bool, b: bool) -> OpResult {
    Ok(Scalar::Bool(a || b))
}

pub fn bool_not(a: bool) -> OpResult {
    Ok(Scalar::Bool(!a))
}

/// Totally ordered CHAR comparison.
pub fn char_lt(a: char, b: char) -> OpResult {
    Ok(Scalar::Bool(a < b))
}

const MAX_BITS_WIDTH: u32 = 64;

/// BITS shift, validated for positive directions against `MAX_BITS`.
pub fn bits_shift_left(a: u64, n: i64) -> OpResult {
    if n < 0 || n as u32 >= MAX_BITS_WIDTH {
        return Err(RuntimeErrorKind::InvalidArgument {
            operation: "SHL".to_string(),
        });
    }
    Ok(Scalar::Bits(a.checked_shl(n as u32).unwrap_or(0)))
}

pub fn bits_shift_right(a: u64, n: i64) -> OpResult {
    if n < 0 || n as u32 >= MAX_BITS_WIDTH {
        return Err(RuntimeErrorKind::InvalidArgument {
            operation: "SHR".to_string(),
        });
    }
    Ok(Scalar::Bits(a.checked_shr(n as u32).unwrap_or(0)))
}

pub fn bits_and(a: u64, b: u64) -> OpResult {
    Ok(Scalar::Bits(a & b))
}

pub fn bits_or(a: u64, b: u64) -> OpResult {
    Ok(Scalar::Bits(a | b))
}

/// STRING/BYTES concatenation: allocates a new row whose size is the sum
/// of the inputs. The actual heap allocation is the caller's
/// responsibility (via [`crate::runtime::heap::Heap`]); this just computes
/// the combined byte content.
pub fn string_concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

pub fn complex_add(a: (f64, f64), b: (f64, f64)) -> OpResult {
    Ok(Scalar::Complex(a.0 + b.0, a.1 + b.1))
}

pub fn complex_sub(a: (f64, f64), b: (f64, f64)) -> OpResult {
    Ok(Scalar::Complex(a.0 - b.0, a.1 - b.1))
}

/// Direct `(ac - bd, ad + bc)` complex multiplication formula.
pub fn complex_mul(a: (f64, f64), b: (f64, f64)) -> OpResult {
    let (ac, bd, ad, bc) = (a.0 * b.0, a.1 * b.1, a.0 * b.1, a.1 * b.0);
    Ok(Scalar::Complex(ac - bd, ad + bc))
}

/// Complex division via Smith's algorithm: scale by the larger magnitude
/// operand to avoid premature overflow/underflow.
pub fn complex_div(a: (f64, f64), b: (f64, f64)) -> OpResult {
    let (ar, ai) = a;
    let (br, bi) = b;
    if br == 0.0 && bi == 0.0 {
        return Err(RuntimeErrorKind::DivisionByZero);
    }
    let (re, im) = if br.abs() >= bi.abs() {
        let ratio = bi / br;
        let denom = br + bi * ratio;
        ((ar + ai * ratio) / denom, (ai - ar * ratio) / denom)
    } else {
        let ratio = br / bi;
        let denom = br * ratio + bi;
        ((ar * ratio + ai) / denom, (ai * ratio - ar) / denom)
    };
    test_real_representation(re).and_then(|_| test_real_representation(im))?;
    Ok(Scalar::Complex(re, im))
}

/// Tests whether a complex value's imaginary part is zero, comparing the
/// *value* rather than a pointer.
pub fn complex_imaginary_is_zero(value: (f64, f64)) -> bool {
    value.1 == 0.0
}

/// One entry in the standard-environment operator registry: a symbol and
/// the function it dispatches to, keyed by arity.
pub struct StandardOperator {
    pub symbol: &'static str,
    pub dyadic: Option<fn(Scalar, Scalar) -> OpResult>,
    pub monadic: Option<fn(Scalar) -> OpResult>,
}

fn dispatch_add(a: Scalar, b: Scalar) -> OpResult {
    match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => int_add(x, y),
        (Scalar::Real(x), Scalar::Real(y)) => real_add(x, y),
        (Scalar::Complex(xr, xi), Scalar::Complex(yr, yi)) => complex_add((xr, xi), (yr, yi)),
        _ => Err(RuntimeErrorKind::InvalidArgument {
            operation: "+".to_string(),
        }),
    }
}

fn dispatch_sub(a: Scalar, b: Scalar) -> OpResult {
    match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => int_sub(x, y),
        (Scalar::Real(x), Scalar::Real(y)) => real_sub(x, y),
        (Scalar::Complex(xr, xi), Scalar::Complex(yr, yi)) => complex_sub((xr, xi), (yr, yi)),
        _ => Err(RuntimeErrorKind::InvalidArgument {
            operation: "-".to_string(),
        }),
    }
}

fn dispatch_mul(a: Scalar, b: Scalar) -> OpResult {
    match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => int_mul(x, y),
        (Scalar::Real(x), Scalar::Real(y)) => real_mul(x, y),
        (Scalar::Complex(xr, xi), Scalar::Complex(yr, yi)) => complex_mul((xr, xi), (yr, yi)),
        _ => Err(RuntimeErrorKind::InvalidArgument {
            operation: "*".to_string(),
        }),
    }
}

fn dispatch_div(a: Scalar, b: Scalar) -> OpResult {
    match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => int_div(x, y),
        (Scalar::Real(x), Scalar::Real(y)) => real_div(x, y),
        (Scalar::Complex(xr, xi), Scalar::Complex(yr, yi)) => complex_div((xr, xi), (yr, yi)),
        _ => Err(RuntimeErrorKind::InvalidArgument {
            operation: "/".to_string(),
        }),
    }
}

/// Builds the standard environment's primitive operator set.
pub fn standard_environment() -> Vec<StandardOperator> {
    vec![
        StandardOperator { symbol: "+", dyadic: Some(dispatch_add), monadic: None },
        StandardOperator { symbol: "-", dyadic: Some(dispatch_sub), monadic: None },
        StandardOperator { symbol: "*", dyadic: Some(dispatch_mul), monadic: None },
        StandardOperator { symbol: "/", dyadic: Some(dispatch_div), monadic: None },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_add_overflow_is_rejected() {
        assert!(matches!(int_add(i64::MAX, 1), Err(RuntimeErrorKind::IntegerOverflow)));
    }

    #[test]
    fn int_division_by_zero_is_rejected() {
        assert!(matches!(int_div(5, 0), Err(RuntimeErrorKind::DivisionByZero)));
    }

    #[test]
    fn real_nan_result_is_rejected() {
        assert!(matches!(real_div(0.0, 0.0), Err(RuntimeErrorKind::RealOverflow)));
    }

    #[test]
    fn complex_division_matches_direct_formula_on_real_axis() {
        // (6+0i) / (2+0i) = 3+0i, verifiable directly since Smith's
        // algorithm collapses to ordinary division on the real axis.
        let result = complex_div((6.0, 0.0), (2.0, 0.0)).unwrap();
        assert_eq!(result, Scalar::Complex(3.0, 0.0));
    }

    #[test]
    fn complex_imaginary_zero_check_uses_value_not_pointer() {
        assert!(complex_imaginary_is_zero((4.0, 0.0)));
        assert!(!complex_imaginary_is_zero((4.0, 0.001)));
    }

    #[test]
    fn string_concat_sums_lengths() {
        let out = string_concat(b"foo", b"bar");
        assert_eq!(out, b"foobar");
    }

    #[test]
    fn bits_shift_rejects_width_overflow() {
        assert!(bits_shift_left(1, 64).is_err());
        assert!(bits_shift_left(1, -1).is_err());
        assert_eq!(bits_shift_left(1, 3).unwrap(), Scalar::Bits(8));
    }
}
