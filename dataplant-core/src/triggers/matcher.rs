//! Path and value matching for compiled data triggers.

use bson::Bson;
use dataplant_models::triggers::{PathMatch, ValueMatchOperator};

/// Match a concrete published path against a compiled trigger path.
///
/// An empty token is a single-segment wildcard; it never spans segments.
pub fn path_matches(path_match: &PathMatch, path: &str) -> bool {
    let tokens = match path_match {
        PathMatch::Any => return true,
        PathMatch::Tokens(tokens) => tokens,
    };
    let segments: Vec<&str> = path
        .strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    tokens.len() == segments.len()
        && tokens
            .iter()
            .zip(&segments)
            .all(|(token, segment)| token.is_empty() || token == segment)
}

/// Evaluate the value operator, only meaningful after the path matched.
///
/// Ordering operators require both sides numeric; equality falls back to
/// structural BSON equality when either side is not a number. A missing
/// incoming value (unset) only satisfies the always-match operator.
pub fn value_matches(
    operator: ValueMatchOperator,
    known_value: Option<&Bson>,
    value: Option<&Bson>,
) -> bool {
    if operator == ValueMatchOperator::Any {
        return true;
    }
    let (Some(known), Some(value)) = (known_value, value) else {
        return false;
    };

    match (as_f64(value), as_f64(known)) {
        (Some(a), Some(b)) => match operator {
            ValueMatchOperator::Any => true,
            ValueMatchOperator::EqualTo => a == b,
            ValueMatchOperator::NotEqualTo => a != b,
            ValueMatchOperator::GreaterThan => a > b,
            ValueMatchOperator::GreaterOrEqualTo => a >= b,
            ValueMatchOperator::LessThan => a < b,
            ValueMatchOperator::LessOrEqualTo => a <= b,
        },
        _ => match operator {
            ValueMatchOperator::EqualTo => value == known,
            ValueMatchOperator::NotEqualTo => value != known,
            _ => false,
        },
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(d) => Some(*d),
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        _ => None,
    }
}
