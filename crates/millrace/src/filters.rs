//! The built-in filter catalogue and `is` tests.
//!
//! Synchronous filters run in-engine; filters registered as asynchronous
//! dispatch through the host-call mechanism instead and never appear in
//! this table.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{error::Exception, value::Value};

/// A synchronous filter: receives the piped value and its arguments.
pub type FilterFn = Rc<dyn Fn(&Value, &[Value]) -> Result<Value, Exception>>;

fn filter_err(name: &str, message: impl Into<String>) -> Exception {
    Exception::runtime(format!("filter `{name}`: {}", message.into()))
}

fn coerce_filter_fn<F>(f: F) -> FilterFn
where
    F: Fn(&Value, &[Value]) -> Result<Value, Exception> + 'static,
{
    Rc::new(f)
}

macro_rules! filter {
    ($table:expr, $name:literal, $func:expr) => {
        $table.insert($name.to_owned(), coerce_filter_fn($func));
    };
}

/// Builds the default filter table.
pub(crate) fn builtin_filters() -> AHashMap<String, FilterFn> {
    let mut t: AHashMap<String, FilterFn> = AHashMap::new();

    filter!(t, "upper", |v: &Value, _| Ok(Value::from(v.coerce_str().to_uppercase())));
    filter!(t, "lower", |v: &Value, _| Ok(Value::from(v.coerce_str().to_lowercase())));
    filter!(t, "capitalize", |v: &Value, _| {
        let s = v.coerce_str();
        let mut chars = s.chars();
        let out = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
            None => String::new(),
        };
        Ok(Value::from(out))
    });
    filter!(t, "title", |v: &Value, _| {
        let s = v.coerce_str();
        let out = s
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Value::from(out))
    });
    filter!(t, "trim", |v: &Value, _| Ok(Value::from(v.coerce_str().trim().to_owned())));
    filter!(t, "length", |v: &Value, _| match v.length() {
        Some(len) => Ok(Value::Int(len as i64)),
        None => Err(filter_err("length", format!("{} has no length", v.type_name()))),
    });
    filter!(t, "count", |v: &Value, _| match v.length() {
        Some(len) => Ok(Value::Int(len as i64)),
        None => Err(filter_err("count", format!("{} has no length", v.type_name()))),
    });
    filter!(t, "first", |v: &Value, _| match v {
        Value::Array(items) => Ok(items.first().cloned().unwrap_or_default()),
        Value::Str(s) => Ok(s.chars().next().map(|c| Value::from(c.to_string())).unwrap_or_default()),
        other => Err(filter_err("first", format!("cannot take first of {}", other.type_name()))),
    });
    filter!(t, "last", |v: &Value, _| match v {
        Value::Array(items) => Ok(items.last().cloned().unwrap_or_default()),
        Value::Str(s) => Ok(s.chars().last().map(|c| Value::from(c.to_string())).unwrap_or_default()),
        other => Err(filter_err("last", format!("cannot take last of {}", other.type_name()))),
    });
    filter!(t, "join", |v: &Value, args: &[Value]| {
        let sep = args.first().map(Value::coerce_str).unwrap_or_default();
        match v {
            Value::Array(items) => {
                Ok(Value::from(items.iter().map(Value::coerce_str).collect::<Vec<_>>().join(&sep)))
            }
            other => Err(filter_err("join", format!("cannot join {}", other.type_name()))),
        }
    });
    filter!(t, "default", |v: &Value, args: &[Value]| {
        if v.is_nullish() {
            Ok(args.first().cloned().unwrap_or_default())
        } else {
            Ok(v.clone())
        }
    });
    filter!(t, "reverse", |v: &Value, _| match v {
        Value::Array(items) => {
            let mut out: Vec<Value> = items.as_ref().clone();
            out.reverse();
            Ok(Value::array(out))
        }
        Value::Str(s) => Ok(Value::from(s.chars().rev().collect::<String>())),
        other => Err(filter_err("reverse", format!("cannot reverse {}", other.type_name()))),
    });
    filter!(t, "sort", |v: &Value, _| match v {
        Value::Array(items) => {
            let mut out: Vec<Value> = items.as_ref().clone();
            out.sort_by(|a, b| a.compare(b).unwrap_or_else(|| a.coerce_str().cmp(&b.coerce_str())));
            Ok(Value::array(out))
        }
        other => Err(filter_err("sort", format!("cannot sort {}", other.type_name()))),
    });
    filter!(t, "unique", |v: &Value, _| match v {
        Value::Array(items) => {
            let mut out: Vec<Value> = Vec::new();
            for item in items.iter() {
                if !out.iter().any(|seen| seen.deep_eq(item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::array(out))
        }
        other => Err(filter_err("unique", format!("cannot deduplicate {}", other.type_name()))),
    });
    filter!(t, "abs", |v: &Value, _| match v {
        Value::Int(i) => Ok(Value::Int(i.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(filter_err("abs", format!("expected a number, found {}", other.type_name()))),
    });
    filter!(t, "round", |v: &Value, args: &[Value]| {
        let digits = match args.first() {
            Some(Value::Int(d)) => *d,
            _ => 0,
        };
        match v {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) => {
                let factor = 10f64.powi(digits as i32);
                let rounded = (f * factor).round() / factor;
                Ok(if digits <= 0 { Value::Int(rounded as i64) } else { Value::Float(rounded) })
            }
            other => Err(filter_err("round", format!("expected a number, found {}", other.type_name()))),
        }
    });
    filter!(t, "int", |v: &Value, _| match v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| filter_err("int", format!("cannot parse `{s}`"))),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        other => Err(filter_err("int", format!("cannot convert {}", other.type_name()))),
    });
    filter!(t, "float", |v: &Value, _| match v {
        Value::Int(i) => Ok(Value::Float(*i as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| filter_err("float", format!("cannot parse `{s}`"))),
        other => Err(filter_err("float", format!("cannot convert {}", other.type_name()))),
    });
    filter!(t, "string", |v: &Value, _| Ok(Value::from(v.coerce_str())));
    filter!(t, "replace", |v: &Value, args: &[Value]| {
        let from = args.first().map(Value::coerce_str).unwrap_or_default();
        let to = args.get(1).map(Value::coerce_str).unwrap_or_default();
        Ok(Value::from(v.coerce_str().replace(&from, &to)))
    });
    filter!(t, "split", |v: &Value, args: &[Value]| {
        let sep = args.first().map(Value::coerce_str).unwrap_or_default();
        let s = v.coerce_str();
        let parts: Vec<Value> = if sep.is_empty() {
            s.chars().map(|c| Value::from(c.to_string())).collect()
        } else {
            s.split(&sep).map(Value::from).collect()
        };
        Ok(Value::array(parts))
    });
    filter!(t, "keys", |v: &Value, _| match v {
        Value::Dict(map) => Ok(Value::array(map.keys().map(|k| Value::str(k)).collect())),
        other => Err(filter_err("keys", format!("expected an object, found {}", other.type_name()))),
    });
    filter!(t, "values", |v: &Value, _| match v {
        Value::Dict(map) => Ok(Value::array(map.values().cloned().collect())),
        other => Err(filter_err("values", format!("expected an object, found {}", other.type_name()))),
    });
    filter!(t, "items", |v: &Value, _| match v {
        Value::Dict(map) => Ok(Value::array(
            map.iter().map(|(k, val)| Value::array(vec![Value::str(k), val.clone()])).collect(),
        )),
        other => Err(filter_err("items", format!("expected an object, found {}", other.type_name()))),
    });
    filter!(t, "sum", |v: &Value, _| match v {
        Value::Array(items) => {
            let mut total = 0f64;
            let mut integral = true;
            for item in items.iter() {
                match item {
                    Value::Int(i) => total += *i as f64,
                    Value::Float(f) => {
                        total += f;
                        integral = false;
                    }
                    other => return Err(filter_err("sum", format!("cannot add {}", other.type_name()))),
                }
            }
            Ok(if integral { Value::Int(total as i64) } else { Value::Float(total) })
        }
        other => Err(filter_err("sum", format!("cannot sum {}", other.type_name()))),
    });
    filter!(t, "min", |v: &Value, _| fold_extreme(v, "min", std::cmp::Ordering::Less));
    filter!(t, "max", |v: &Value, _| fold_extreme(v, "max", std::cmp::Ordering::Greater));
    filter!(t, "escape", |v: &Value, _| Ok(Value::from(html_escape(&v.coerce_str()))));
    filter!(t, "e", |v: &Value, _| Ok(Value::from(html_escape(&v.coerce_str()))));
    filter!(t, "safe", |v: &Value, _| Ok(v.clone()));
    filter!(t, "dump", |v: &Value, _| {
        serde_json::to_string(&v.to_json())
            .map(Value::from)
            .map_err(|e| filter_err("dump", e.to_string()))
    });

    t
}

fn fold_extreme(v: &Value, name: &str, keep: std::cmp::Ordering) -> Result<Value, Exception> {
    let Value::Array(items) = v else {
        return Err(filter_err(name, format!("expected an array, found {}", v.type_name())));
    };
    let mut best: Option<Value> = None;
    for item in items.iter() {
        match &best {
            None => best = Some(item.clone()),
            Some(current) => {
                if item.compare(current) == Some(keep) {
                    best = Some(item.clone());
                }
            }
        }
    }
    Ok(best.unwrap_or_default())
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Runs an `is` test (`value is defined`, `n is divisibleby(3)`).
pub(crate) fn run_test(name: &str, value: &Value, args: &[Value]) -> Result<bool, Exception> {
    match name {
        "defined" => Ok(!value.is_undefined()),
        "undefined" => Ok(value.is_undefined()),
        "none" | "null" => Ok(matches!(value, Value::Null)),
        "string" => Ok(matches!(value, Value::Str(_))),
        "number" => Ok(matches!(value, Value::Int(_) | Value::Float(_))),
        "boolean" => Ok(matches!(value, Value::Bool(_))),
        "mapping" => Ok(matches!(value, Value::Dict(_))),
        "iterable" => Ok(matches!(value, Value::Array(_) | Value::Dict(_) | Value::Str(_))),
        "callable" => Ok(matches!(value, Value::Func(_))),
        "truthy" => Ok(value.is_truthy()),
        "falsy" => Ok(!value.is_truthy()),
        "even" => match value {
            Value::Int(i) => Ok(i % 2 == 0),
            other => Err(Exception::runtime(format!("`is even` expects a number, found {}", other.type_name()))),
        },
        "odd" => match value {
            Value::Int(i) => Ok(i % 2 != 0),
            other => Err(Exception::runtime(format!("`is odd` expects a number, found {}", other.type_name()))),
        },
        "divisibleby" => {
            let (Value::Int(n), Some(Value::Int(d))) = (value, args.first()) else {
                return Err(Exception::runtime("`is divisibleby` expects integers"));
            };
            if *d == 0 {
                return Err(Exception::runtime("`is divisibleby` by zero"));
            }
            Ok(n % d == 0)
        }
        "in" => Ok(args.first().is_some_and(|container| container.contains(value))),
        other => Err(Exception::template_error(format!("unknown test `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, value: Value, args: &[Value]) -> Value {
        (builtin_filters()[name])(&value, args).unwrap()
    }

    #[test]
    fn string_filters() {
        assert_eq!(run("upper", Value::str("ab"), &[]), Value::str("AB"));
        assert_eq!(run("capitalize", Value::str("hELLO"), &[]), Value::str("Hello"));
        assert_eq!(run("title", Value::str("a b"), &[]), Value::str("A B"));
    }

    #[test]
    fn collection_filters() {
        let arr = Value::array(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(run("sort", arr.clone(), &[]), Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        assert_eq!(run("length", arr.clone(), &[]), Value::Int(3));
        assert_eq!(run("join", arr, &[Value::str("-")]), Value::str("3-1-2"));
    }

    #[test]
    fn default_applies_only_to_nullish() {
        assert_eq!(run("default", Value::Undefined, &[Value::Int(7)]), Value::Int(7));
        assert_eq!(run("default", Value::Int(0), &[Value::Int(7)]), Value::Int(0));
    }

    #[test]
    fn escape_covers_html_metacharacters() {
        assert_eq!(run("escape", Value::str("<a & 'b'>"), &[]), Value::str("&lt;a &amp; &#39;b&#39;&gt;"));
    }

    #[test]
    fn tests_table() {
        assert!(run_test("defined", &Value::Int(1), &[]).unwrap());
        assert!(run_test("undefined", &Value::Undefined, &[]).unwrap());
        assert!(run_test("divisibleby", &Value::Int(9), &[Value::Int(3)]).unwrap());
        assert!(run_test("even", &Value::Int(2), &[]).unwrap());
        assert!(run_test("unknown-test", &Value::Int(1), &[]).is_err());
    }
}
