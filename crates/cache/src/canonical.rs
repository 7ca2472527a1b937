//! Order-invariant canonical encoding used to fingerprint calls
//!
//! The encoding exists only to be hashed. Containers are rendered by
//! canonicalizing each element, sorting the element strings and joining them,
//! so a list and a set holding equal elements encode identically and element
//! order never affects a fingerprint. Mappings encode as the sorted set of
//! `[value, key]` pairs. Objects encode as their type name only.
//!
//! Rendering follows the classic repr conventions, e.g.
//! `canonicalize([1, 2, 3]) == "['1', '2', '3']"`.

use crate::value::Value;
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

const MICROS_PER_SECOND: i128 = 1_000_000;
const MICROS_PER_DAY: i128 = 86_400 * MICROS_PER_SECOND;

/// Canonicalize a value into its order-invariant string form
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    Canonicalizer::default().encode(value)
}

/// Drain a lazily produced sequence and canonicalize it as an unordered container
///
/// The iterator is consumed; callers that need the items afterwards must
/// collect them first.
pub fn canonicalize_iter<I>(items: I) -> String
where
    I: IntoIterator<Item = Value>,
{
    let mut canon = Canonicalizer::default();
    let parts: Vec<String> = items.into_iter().map(|v| canon.encode(&v)).collect();
    render_sorted(parts)
}

/// Canonicalize keyword arguments using the mapping rule
#[must_use]
pub fn canonicalize_entries(entries: &BTreeMap<String, Value>) -> String {
    Canonicalizer::default().encode_map(entries)
}

/// Canonicalize positional arguments, keeping their call order
///
/// Each argument is canonicalized on its own; only the containers inside an
/// argument are order-invariant.
#[must_use]
pub fn canonicalize_positional(args: &[Value]) -> String {
    let mut canon = Canonicalizer::default();
    let parts: Vec<String> = args.iter().map(|v| canon.encode(v)).collect();
    render_list(&parts)
}

#[derive(Default)]
struct Canonicalizer {
    // Shared nodes currently being encoded; a revisit renders as `...`.
    active: HashSet<usize>,
}

impl Canonicalizer {
    fn encode(&mut self, value: &Value) -> String {
        match value {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Text(s) => s.clone(),
            Value::DateTime(dt) => format_datetime(dt),
            Value::Duration(d) => format_duration(*d),
            Value::List(items) | Value::Set(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.encode(v)).collect();
                render_sorted(parts)
            }
            Value::Map(entries) => self.encode_map(entries),
            Value::Object(obj) => obj.type_name.clone(),
            Value::Callable(name) | Value::Resource(name) => name.clone(),
            Value::Shared(node) => {
                let id = node.id();
                if !self.active.insert(id) {
                    return "...".to_string();
                }
                let encoded = self.encode(&node.borrow());
                self.active.remove(&id);
                encoded
            }
            Value::Weak(weak) => match weak.upgrade() {
                Some(node) => self.encode(&Value::Shared(node)),
                None => "None".to_string(),
            },
        }
    }

    fn encode_map(&mut self, entries: &BTreeMap<String, Value>) -> String {
        let pairs: Vec<String> = entries
            .iter()
            .map(|(key, value)| {
                let encoded = self.encode(value);
                render_list(&[encoded, key.clone()])
            })
            .collect();
        render_sorted(pairs)
    }
}

fn render_sorted(mut parts: Vec<String>) -> String {
    parts.sort_unstable();
    render_list(&parts)
}

fn render_list(parts: &[String]) -> String {
    let mut out = String::from("[");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&quote(part));
    }
    out.push(']');
    out
}

/// Quote a string the way a repr would: single quotes unless the text holds a
/// single quote and no double quote.
fn quote(s: &str) -> String {
    let delim = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(delim);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let code = u32::from(c);
                if code <= 0xff {
                    let _ = write!(out, "\\x{code:02x}");
                } else {
                    let _ = write!(out, "\\u{code:04x}");
                }
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let s = f.to_string();
    if s.contains('.') { s } else { format!("{s}.0") }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    let micros = dt.nanosecond() % 1_000_000_000 / 1_000;
    if micros == 0 {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        format!("{}.{micros:06}", dt.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn format_duration(d: TimeDelta) -> String {
    let total = i128::from(d.num_seconds()) * MICROS_PER_SECOND
        + i128::from(d.subsec_nanos() / 1_000);
    let days = total.div_euclid(MICROS_PER_DAY);
    let rem = total.rem_euclid(MICROS_PER_DAY);
    let hours = rem / (3_600 * MICROS_PER_SECOND);
    let minutes = rem / (60 * MICROS_PER_SECOND) % 60;
    let seconds = rem / MICROS_PER_SECOND % 60;
    let micros = rem % MICROS_PER_SECOND;

    let mut out = String::new();
    if days != 0 {
        let plural = if days.abs() == 1 { "" } else { "s" };
        let _ = write!(out, "{days} day{plural}, ");
    }
    let _ = write!(out, "{hours}:{minutes:02}:{seconds:02}");
    if micros != 0 {
        let _ = write!(out, ".{micros:06}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    fn dict(entries: &[(&str, i64)]) -> Value {
        Value::map(entries.iter().map(|(k, v)| (*k, Value::Int(*v))))
    }

    #[test]
    fn test_scalars_render_directly() {
        assert_eq!(canonicalize(&Value::Int(42)), "42");
        assert_eq!(canonicalize(&Value::Float(1.0)), "1.0");
        assert_eq!(canonicalize(&Value::Float(0.25)), "0.25");
        assert_eq!(canonicalize(&Value::Float(f64::NAN)), "nan");
        assert_eq!(canonicalize(&Value::Bool(true)), "True");
        assert_eq!(canonicalize(&Value::None), "None");
        assert_eq!(canonicalize(&Value::from("abc")), "abc");
    }

    #[test]
    fn test_basic_list() {
        let list = Value::List(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(canonicalize(&list), "['a', 'b', 'c']");
    }

    #[test]
    fn test_list_and_set_encode_identically() {
        let list = Value::List(ints(&[1, 2, 3]));
        let set = Value::Set(ints(&[3, 1, 2]));
        assert_eq!(canonicalize(&list), canonicalize(&set));
        assert_eq!(canonicalize(&list), "['1', '2', '3']");
    }

    #[test]
    fn test_generator_drains_like_a_set() {
        let set = Value::Set(ints(&[5, 3, 4, 2, 7, 6, 1, 8, 9, 0]));
        let generated = canonicalize_iter((0..10).map(Value::Int));
        assert_eq!(canonicalize(&set), generated);
        assert_eq!(
            generated,
            "['0', '1', '2', '3', '4', '5', '6', '7', '8', '9']"
        );
    }

    #[test]
    fn test_generator_is_consumed() {
        let mut source = (0..4).map(Value::Int);
        let _ = canonicalize_iter(source.by_ref());
        assert!(source.next().is_none());
    }

    #[test]
    fn test_nested_lists_ignore_order_at_every_level() {
        let a = Value::List(vec![
            Value::List(ints(&[1, 2, 3])),
            Value::List(ints(&[4, 5, 6])),
            Value::List(ints(&[7, 8, 9])),
        ]);
        let c = Value::List(vec![
            Value::List(ints(&[6, 4, 5])),
            Value::List(ints(&[1, 3, 2])),
            Value::List(ints(&[9, 8, 7])),
        ]);
        assert_eq!(canonicalize(&a), canonicalize(&c));
        assert_eq!(
            canonicalize(&a),
            r#"["['1', '2', '3']", "['4', '5', '6']", "['7', '8', '9']"]"#
        );
    }

    #[test]
    fn test_dict_canonical_form() {
        let a = dict(&[("a", 1), ("b", 2), ("c", 3)]);
        let c = dict(&[("c", 3), ("b", 2), ("a", 1)]);
        assert_eq!(canonicalize(&a), canonicalize(&c));
        assert_eq!(
            canonicalize(&a),
            r#"["['1', 'a']", "['2', 'b']", "['3', 'c']"]"#
        );
    }

    #[test]
    fn test_dict_sorts_by_value_first() {
        let d = dict(&[("a", 2), ("b", 1)]);
        assert_eq!(canonicalize(&d), r#"["['1', 'b']", "['2', 'a']"]"#);
    }

    #[test]
    fn test_nested_dict_escapes_like_repr() {
        let nested = Value::map([
            ("a", dict(&[("a", 1), ("b", 2)])),
            ("b", dict(&[("c", 3), ("d", 4)])),
        ]);
        assert_eq!(
            canonicalize(&nested),
            r#"['[\'["[\\\'1\\\', \\\'a\\\']", "[\\\'2\\\', \\\'b\\\']"]\', \'a\']', '[\'["[\\\'3\\\', \\\'c\\\']", "[\\\'4\\\', \\\'d\\\']"]\', \'b\']']"#
        );
    }

    #[test]
    fn test_objects_encode_as_type_name() {
        let model = |a: &str, b: &str| {
            Value::object("TestModel", [("a", Value::from(a)), ("b", Value::from(b))])
        };
        assert_eq!(canonicalize(&model("a", "b")), "TestModel");

        let list = Value::List(vec![model("a", "b"), model("b", "c"), model("c", "d")]);
        assert_eq!(
            canonicalize(&list),
            "['TestModel', 'TestModel', 'TestModel']"
        );

        let map = Value::map([
            ("c", model("a", "b")),
            ("b", model("b", "c")),
            ("a", model("c", "d")),
        ]);
        assert_eq!(
            canonicalize(&map),
            r#"["['TestModel', 'a']", "['TestModel', 'b']", "['TestModel', 'c']"]"#
        );
    }

    #[test]
    fn test_callables_encode_as_name() {
        assert_eq!(canonicalize(&Value::Callable("<lambda>".into())), "<lambda>");
        assert_eq!(canonicalize(&Value::Callable("b".into())), "b");
    }

    #[test]
    fn test_datetime_and_duration() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).single();
        let dt = dt.map(Value::DateTime).unwrap_or(Value::None);
        assert_eq!(canonicalize(&dt), "2024-03-09 07:05:01");

        let d = TimeDelta::days(1) + TimeDelta::seconds(3_723) + TimeDelta::milliseconds(500);
        assert_eq!(canonicalize(&Value::Duration(d)), "1 day, 1:02:03.500000");
        assert_eq!(
            canonicalize(&Value::Duration(TimeDelta::seconds(-1))),
            "-1 day, 23:59:59"
        );
    }

    #[test]
    fn test_quote_switches_delimiter() {
        assert_eq!(quote("it's"), r#""it's""#);
        assert_eq!(quote(r#"say "hi" it's"#), r#"'say "hi" it\'s'"#);
        assert_eq!(quote("a\\b\n"), r"'a\\b\n'");
    }

    #[test]
    fn test_cyclic_shared_node_terminates() {
        let node = Value::List(vec![]).shared();
        node.replace(Value::List(vec![Value::Int(1), Value::Shared(node.clone())]));
        assert_eq!(canonicalize(&Value::Shared(node)), "['...', '1']");
    }

    #[test]
    fn test_dead_weak_reference_is_none() {
        let weak = Value::Int(1).shared().downgrade();
        assert_eq!(canonicalize(&Value::Weak(weak)), "None");
    }

    #[test]
    fn test_positional_args_keep_order() {
        let forward = canonicalize_positional(&ints(&[1, 2]));
        let backward = canonicalize_positional(&ints(&[2, 1]));
        assert_ne!(forward, backward);
    }

    proptest! {
        #[test]
        fn prop_permutation_invariance(
            mut values in prop::collection::vec(any::<i64>(), 0..24),
            seed in any::<u64>(),
        ) {
            let original = canonicalize(&Value::List(ints(&values)));
            // Deterministic shuffle driven by the generated seed
            let mut state = seed;
            for i in (1..values.len()).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let j = usize::try_from(state % (i as u64 + 1)).unwrap_or(0);
                values.swap(i, j);
            }
            prop_assert_eq!(original, canonicalize(&Value::Set(ints(&values))));
        }

        #[test]
        fn prop_map_insertion_order_is_irrelevant(
            entries in prop::collection::vec(("[a-z]{1,6}", any::<i32>()), 0..16),
        ) {
            let forward = Value::map(entries.iter().map(|(k, v)| (k.clone(), Value::from(*v))));
            let backward =
                Value::map(entries.iter().rev().map(|(k, v)| (k.clone(), Value::from(*v))));
            // Duplicate keys resolve to the last write; only compare when keys are unique
            let unique: HashSet<&String> = entries.iter().map(|(k, _)| k).collect();
            prop_assume!(unique.len() == entries.len());
            prop_assert_eq!(canonicalize(&forward), canonicalize(&backward));
        }
    }
}
