//! JSON scalar literals and canonical literal sets.
//!
//! `Enum` and `Flag` domains are parameterized by a set of JSON scalars.
//! Membership follows JavaScript equality, not host-language equality:
//! `1` and `1.0` are the same literal, while `1` and `true` are distinct.

use crate::error::TypeError;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// A JSON scalar usable as an `Enum`/`Flag` option.
#[derive(Debug, Clone)]
pub enum ScalarLiteral {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl ScalarLiteral {
    /// Interpret a JSON value as a scalar literal.
    ///
    /// Arrays, objects, and nulls are not scalars and fail with
    /// [`TypeError::NonScalarOption`] at the call sites that construct sets.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Num),
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The canonical JSON rendering of the literal.
    ///
    /// Whole numbers render without a fraction, so `1` and `1.0` share one
    /// canonical form. Sorting and equality are both defined over this
    /// rendering.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Num(n) => render_number(*n),
            Self::Str(s) => Value::String(s.clone()).to_string(),
        }
    }
}

const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < MAX_EXACT_INT {
        format!("{}", n as i64)
    } else {
        Value::from(n).to_string()
    }
}

// The rendering is injective over scalars (strings are quoted, booleans and
// numbers are not), so literal-text comparison is a total order consistent
// with JavaScript equality.
impl PartialEq for ScalarLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.render() == other.render()
    }
}

impl Eq for ScalarLiteral {}

impl PartialOrd for ScalarLiteral {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarLiteral {
    fn cmp(&self, other: &Self) -> Ordering {
        self.render().cmp(&other.render())
    }
}

impl fmt::Display for ScalarLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A canonical, deduplicated set of scalar literals.
///
/// Construction canonicalizes: option order and duplicates in the source
/// text are never preserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiteralSet(BTreeSet<ScalarLiteral>);

impl LiteralSet {
    /// Build a set from a JSON array of scalars.
    pub fn from_options(kind: &'static str, options: &[Value]) -> Result<Self, TypeError> {
        let mut set = BTreeSet::new();
        for option in options {
            let literal = ScalarLiteral::from_value(option).ok_or_else(|| {
                TypeError::NonScalarOption {
                    kind,
                    literal: option.to_string(),
                }
            })?;
            set.insert(literal);
        }
        Ok(Self(set))
    }

    /// Whether a JSON value is a member of the set.
    ///
    /// Non-scalar values are never members.
    pub fn contains_value(&self, value: &Value) -> bool {
        ScalarLiteral::from_value(value)
            .map(|literal| self.0.contains(&literal))
            .unwrap_or(false)
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_superset(&self, other: &Self) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical comma-joined rendering, sorted by literal form.
    pub fn render(&self) -> String {
        let rendered: Vec<String> = self.0.iter().map(ScalarLiteral::render).collect();
        rendered.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(kind: &'static str, options: &[Value]) -> LiteralSet {
        LiteralSet::from_options(kind, options).expect("options should be scalars")
    }

    #[test]
    fn ints_and_floats_are_indistinguishable() {
        let options = set("Enum", &[json!(1), json!(2.0)]);
        assert!(options.contains_value(&json!(1.0)));
        assert!(options.contains_value(&json!(2)));
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn bools_are_distinct_from_numbers() {
        let options = set("Enum", &[json!(1), json!(0)]);
        assert!(!options.contains_value(&json!(true)));
        assert!(!options.contains_value(&json!(false)));

        let bools = set("Enum", &[json!(true)]);
        assert!(!bools.contains_value(&json!(1)));
    }

    #[test]
    fn strings_are_distinct_from_their_unquoted_forms() {
        let options = set("Enum", &[json!("1"), json!("true")]);
        assert!(!options.contains_value(&json!(1)));
        assert!(!options.contains_value(&json!(true)));
        assert!(options.contains_value(&json!("1")));
    }

    #[test]
    fn duplicates_collapse() {
        let options = set("Flag", &[json!("a"), json!("b"), json!("a"), json!(1.0), json!(1)]);
        assert_eq!(options.len(), 3);
    }

    #[test]
    fn rendering_is_sorted_and_canonical() {
        let options = set("Enum", &[json!("red"), json!("blue"), json!(3), json!(2.0)]);
        assert_eq!(options.render(), "\"blue\",\"red\",2,3");
    }

    #[test]
    fn non_scalars_are_rejected() {
        let err = LiteralSet::from_options("Enum", &[json!([1, 2])]).expect_err("array option");
        assert!(matches!(err, TypeError::NonScalarOption { kind: "Enum", .. }));
        let err = LiteralSet::from_options("Flag", &[json!(null)]).expect_err("null option");
        assert!(matches!(err, TypeError::NonScalarOption { kind: "Flag", .. }));
    }

    #[test]
    fn non_scalars_are_never_members() {
        let options = set("Enum", &[json!(1)]);
        assert!(!options.contains_value(&json!([1])));
        assert!(!options.contains_value(&json!(null)));
    }
}
