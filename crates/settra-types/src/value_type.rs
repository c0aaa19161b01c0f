//! Value domains and the subtype order between them.

use crate::error::TypeError;
use crate::literal::LiteralSet;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The value domain of a setting.
///
/// The textual form round-trips: `parse(format(t)) == t` for every canonical
/// `t`. The inverse does not hold for `Enum`/`Flag`, whose option lists are
/// canonicalized (sorted, deduplicated) on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    /// JSON numbers with no fractional part.
    Int,
    /// Any JSON number.
    Float,
    Str,
    Bool,
    /// Exactly one of a closed set of scalars.
    Enum(LiteralSet),
    /// Any array of distinct members of a closed set of scalars.
    Flag(LiteralSet),
    Sequence(Box<ValueType>),
    Mapping(Box<ValueType>),
}

impl ValueType {
    /// Parse a value domain from its textual form.
    pub fn parse(text: &str) -> Result<Self, TypeError> {
        let text = text.trim();
        match text {
            "int" => return Ok(Self::Int),
            "float" => return Ok(Self::Float),
            "str" => return Ok(Self::Str),
            "bool" => return Ok(Self::Bool),
            _ => {}
        }
        for (kind, rest) in [("Enum", text.strip_prefix("Enum")), ("Flag", text.strip_prefix("Flag"))]
        {
            let Some(rest) = rest.map(str::trim_start) else {
                continue;
            };
            if !rest.starts_with('[') {
                continue;
            }
            let options: Vec<Value> =
                serde_json::from_str(rest).map_err(|e| TypeError::MalformedOptions {
                    kind,
                    detail: e.to_string(),
                })?;
            let set = LiteralSet::from_options(kind, &options)?;
            return Ok(match kind {
                "Enum" => Self::Enum(set),
                _ => Self::Flag(set),
            });
        }
        for (kind, rest) in [
            ("Sequence", text.strip_prefix("Sequence")),
            ("Mapping", text.strip_prefix("Mapping")),
        ] {
            let Some(rest) = rest.map(str::trim_start) else {
                continue;
            };
            let Some(param) = rest.strip_prefix('<').and_then(|r| r.strip_suffix('>')) else {
                continue;
            };
            let inner = Box::new(Self::parse(param)?);
            return Ok(match kind {
                "Sequence" => Self::Sequence(inner),
                _ => Self::Mapping(inner),
            });
        }
        Err(TypeError::UnknownType(text.to_string()))
    }

    /// Whether a JSON value inhabits this domain.
    pub fn validate(&self, value: &Value) -> bool {
        match self {
            Self::Int => match value {
                Value::Number(n) => {
                    n.as_i64().is_some()
                        || n.as_u64().is_some()
                        || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Enum(options) => options.contains_value(value),
            Self::Flag(options) => match value {
                Value::Array(items) => items.iter().all(|item| options.contains_value(item)),
                _ => false,
            },
            Self::Sequence(inner) => match value {
                Value::Array(items) => items.iter().all(|item| inner.validate(item)),
                _ => false,
            },
            Self::Mapping(inner) => match value {
                Value::Object(entries) => entries.values().all(|item| inner.validate(item)),
                _ => false,
            },
        }
    }

    /// Whether every inhabitant of `self` also inhabits `other`.
    pub fn is_subtype_of(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }
}

// The subtype relation: `a < b` means every value of `a` is a value of `b`
// and the domains differ. Domains of different families never compare.
impl PartialOrd for ValueType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use ValueType::*;
        match (self, other) {
            (Int, Int) | (Float, Float) | (Str, Str) | (Bool, Bool) => Some(Ordering::Equal),
            (Int, Float) => Some(Ordering::Less),
            (Float, Int) => Some(Ordering::Greater),
            (Enum(a), Enum(b)) | (Flag(a), Flag(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else if a.is_subset(b) {
                    Some(Ordering::Less)
                } else if a.is_superset(b) {
                    Some(Ordering::Greater)
                } else {
                    None
                }
            }
            (Sequence(a), Sequence(b)) | (Mapping(a), Mapping(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Str => f.write_str("str"),
            Self::Bool => f.write_str("bool"),
            Self::Enum(options) => write!(f, "Enum[{}]", options.render()),
            Self::Flag(options) => write!(f, "Flag[{}]", options.render()),
            Self::Sequence(inner) => write!(f, "Sequence<{inner}>"),
            Self::Mapping(inner) => write!(f, "Mapping<{inner}>"),
        }
    }
}

impl FromStr for ValueType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// On the wire and in snapshots a domain is its canonical textual form.
impl Serialize for ValueType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ValueType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> ValueType {
        ValueType::parse(text).expect("type should parse")
    }

    #[test]
    fn primitives_parse_and_format() {
        for name in ["int", "float", "str", "bool"] {
            assert_eq!(parse(name).to_string(), name);
        }
    }

    #[test]
    fn enum_options_canonicalize() {
        let ty = parse("Enum[3,2,1,2]");
        assert_eq!(ty.to_string(), "Enum[1,2,3]");
        assert_eq!(parse("Enum[1.0,2,3]"), ty);
    }

    #[test]
    fn parse_format_round_trips_on_canonical_forms() {
        for text in [
            "int",
            "Enum[\"blue\",\"green\",\"red\"]",
            "Flag[1,2]",
            "Sequence<Mapping<str>>",
            "Mapping<Flag[false,true]>",
        ] {
            assert_eq!(parse(text).to_string(), text);
        }
    }

    #[test]
    fn whitespace_is_tolerated() {
        assert_eq!(parse("Sequence < int >"), parse("Sequence<int>"));
        assert_eq!(parse("Enum [1,2]"), parse("Enum[2,1]"));
    }

    #[test]
    fn malformed_expressions_fail() {
        assert!(ValueType::parse("Sequence<int").is_err());
        assert!(ValueType::parse("Enum[1,").is_err());
        assert!(ValueType::parse("Enum[[1]]").is_err());
        assert!(ValueType::parse("Tuple<int>").is_err());
        assert!(ValueType::parse("").is_err());
    }

    #[test]
    fn int_accepts_whole_numbers_only() {
        let ty = parse("int");
        assert!(ty.validate(&json!(5)));
        assert!(ty.validate(&json!(5.0)));
        assert!(ty.validate(&json!(-3)));
        assert!(!ty.validate(&json!(5.5)));
        assert!(!ty.validate(&json!(true)));
        assert!(!ty.validate(&json!("5")));
    }

    #[test]
    fn float_accepts_any_number() {
        let ty = parse("float");
        assert!(ty.validate(&json!(5)));
        assert!(ty.validate(&json!(5.5)));
        assert!(!ty.validate(&json!("5.5")));
    }

    #[test]
    fn flag_accepts_subsets_of_options() {
        let ty = parse("Flag[\"a\",\"b\"]");
        assert!(ty.validate(&json!([])));
        assert!(ty.validate(&json!(["a"])));
        assert!(ty.validate(&json!(["b", "a"])));
        assert!(!ty.validate(&json!(["c"])));
        assert!(!ty.validate(&json!("a")));
    }

    #[test]
    fn sequence_and_mapping_validate_recursively() {
        let seq = parse("Sequence<int>");
        assert!(seq.validate(&json!([1, 2, 3])));
        assert!(!seq.validate(&json!([1, "2"])));
        assert!(!seq.validate(&json!({"a": 1})));

        let map = parse("Mapping<Sequence<bool>>");
        assert!(map.validate(&json!({"a": [true], "b": []})));
        assert!(!map.validate(&json!({"a": [1]})));
        assert!(!map.validate(&json!([true])));
    }

    #[test]
    fn int_is_a_subtype_of_float() {
        assert_eq!(parse("int").partial_cmp(&parse("float")), Some(Ordering::Less));
        assert_eq!(parse("float").partial_cmp(&parse("int")), Some(Ordering::Greater));
        assert!(parse("int").is_subtype_of(&parse("int")));
    }

    #[test]
    fn enum_subtyping_is_subset_inclusion() {
        let small = parse("Enum[1,2]");
        let big = parse("Enum[1,2,3]");
        let other = parse("Enum[4,5]");
        assert_eq!(small.partial_cmp(&big), Some(Ordering::Less));
        assert_eq!(big.partial_cmp(&small), Some(Ordering::Greater));
        assert_eq!(small.partial_cmp(&other), None);
    }

    #[test]
    fn no_cross_family_relations() {
        assert_eq!(parse("Flag[1,2]").partial_cmp(&parse("Sequence<int>")), None);
        assert_eq!(parse("Enum[false,true]").partial_cmp(&parse("bool")), None);
        assert_eq!(parse("Enum[1]").partial_cmp(&parse("Flag[1]")), None);
        assert_eq!(parse("str").partial_cmp(&parse("Enum[\"a\"]")), None);
        assert_eq!(parse("Sequence<int>").partial_cmp(&parse("Mapping<int>")), None);
    }

    #[test]
    fn generic_subtyping_is_covariant() {
        let a = parse("Sequence<Enum[1]>");
        let b = parse("Sequence<Enum[1,2]>");
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));

        let a = parse("Mapping<int>");
        let b = parse("Mapping<float>");
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
    }

    #[test]
    fn the_subtype_relation_is_a_partial_order() {
        let samples = [
            parse("int"),
            parse("float"),
            parse("Enum[1]"),
            parse("Enum[1,2]"),
            parse("Enum[1,2,3]"),
            parse("Flag[1,2]"),
            parse("Sequence<int>"),
            parse("Sequence<float>"),
            parse("Mapping<Enum[1,2]>"),
        ];
        for a in &samples {
            assert!(a.is_subtype_of(a), "{a} should be a subtype of itself");
            for b in &samples {
                if a.is_subtype_of(b) && b.is_subtype_of(a) {
                    assert_eq!(a, b, "antisymmetry violated for {a} and {b}");
                }
                for c in &samples {
                    if a.is_subtype_of(b) && b.is_subtype_of(c) {
                        assert!(a.is_subtype_of(c), "transitivity violated: {a} ≤ {b} ≤ {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn serde_round_trips_through_the_textual_form() {
        let ty = parse("Mapping<Enum[\"x\",\"y\"]>");
        let text = serde_json::to_string(&ty).expect("type should serialize");
        assert_eq!(text, "\"Mapping<Enum[\\\"x\\\",\\\"y\\\"]>\"");
        let back: ValueType = serde_json::from_str(&text).expect("type should deserialize");
        assert_eq!(back, ty);
    }
}
