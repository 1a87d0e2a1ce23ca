//! The data assembler: path-addressed tree mutation commands.
//!
//! Commands are journaled during evaluation and applied here, in lexical
//! order, at scope flush time. Paths autovivify missing intermediates: a
//! dictionary when the next segment is a property name, an array when it is
//! an index or the `[]` last-element marker.

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    error::Exception,
    value::{Value, ValueMap},
};

/// A user-supplied data method: receives the current target value and the
/// command arguments, returns the replacement value.
pub type DataMethodFn = Rc<dyn Fn(Value, &[Value]) -> Result<Value, Exception>>;

/// A resolved command path. Paths are short; the common case stays inline.
pub(crate) type SegPath = SmallVec<[ResolvedSeg; 4]>;

/// One resolved path segment of a data command.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedSeg {
    Key(String),
    Index(i64),
    /// `[]`: the last element of the parent array.
    Last,
}

impl ResolvedSeg {
    fn describe(&self) -> String {
        match self {
            Self::Key(k) => k.clone(),
            Self::Index(i) => format!("[{i}]"),
            Self::Last => "[]".to_owned(),
        }
    }
}

fn path_str(path: &[ResolvedSeg]) -> String {
    if path.is_empty() {
        "<root>".to_owned()
    } else {
        path.iter().map(ResolvedSeg::describe).collect::<Vec<_>>().join(".")
    }
}

fn err(method: &str, path: &[ResolvedSeg], message: impl Into<String>) -> Exception {
    Exception::runtime(format!("data.{method} at `{}`: {}", path_str(path), message.into()))
}

/// Applies one command to the data root.
pub(crate) fn apply_command(
    root: &mut Value,
    method: &str,
    path: &[ResolvedSeg],
    args: &[Value],
    custom: &AHashMap<String, DataMethodFn>,
) -> Result<(), Exception> {
    if method == "delete" {
        return delete(root, path);
    }
    let target = navigate(root, path, method)?;
    apply_method(target, method, path, args, custom)
}

/// Walks to the command's target, creating missing intermediates.
fn navigate<'a>(root: &'a mut Value, path: &[ResolvedSeg], method: &str) -> Result<&'a mut Value, Exception> {
    let mut cur = root;
    for (i, seg) in path.iter().enumerate() {
        let next = path.get(i + 1);
        match seg {
            ResolvedSeg::Key(key) => {
                if cur.is_nullish() {
                    *cur = Value::dict(ValueMap::new());
                }
                let Value::Dict(map) = cur else {
                    return Err(err(method, path, format!("`{}` is not an object", path_str(&path[..i]))));
                };
                let map = Rc::make_mut(map);
                cur = map.entry(key.clone()).or_insert_with(|| vivified(next));
            }
            ResolvedSeg::Index(index) => {
                if cur.is_nullish() {
                    *cur = Value::array(Vec::new());
                }
                let Value::Array(items) = cur else {
                    return Err(err(method, path, format!("`{}` is not an array", path_str(&path[..i]))));
                };
                let items = Rc::make_mut(items);
                let idx = usize::try_from(*index)
                    .map_err(|_| err(method, path, format!("negative index {index} in path")))?;
                while items.len() <= idx {
                    items.push(Value::Null);
                }
                cur = &mut items[idx];
                if cur.is_nullish() && next.is_some() {
                    *cur = vivified(next);
                }
            }
            ResolvedSeg::Last => {
                if cur.is_nullish() {
                    *cur = Value::array(Vec::new());
                }
                let Value::Array(items) = cur else {
                    return Err(err(method, path, format!("`{}` is not an array", path_str(&path[..i]))));
                };
                let items = Rc::make_mut(items);
                let Some(last) = items.last_mut() else {
                    return Err(err(method, path, "last-element marker on an empty array"));
                };
                cur = last;
            }
        }
    }
    Ok(cur)
}

/// What a freshly created intermediate should be, given the segment that
/// follows it.
fn vivified(next: Option<&ResolvedSeg>) -> Value {
    match next {
        Some(ResolvedSeg::Index(_) | ResolvedSeg::Last) => Value::array(Vec::new()),
        Some(ResolvedSeg::Key(_)) => Value::dict(ValueMap::new()),
        None => Value::Undefined,
    }
}

/// Removes the value at `path` from its parent; on the root, resets the
/// whole tree.
fn delete(root: &mut Value, path: &[ResolvedSeg]) -> Result<(), Exception> {
    let Some((last, parent_path)) = path.split_last() else {
        *root = Value::Undefined;
        return Ok(());
    };
    let parent = navigate(root, parent_path, "delete")?;
    match (parent, last) {
        (Value::Dict(map), ResolvedSeg::Key(key)) => {
            Rc::make_mut(map).shift_remove(key);
            Ok(())
        }
        (Value::Array(items), ResolvedSeg::Index(index)) => {
            let items = Rc::make_mut(items);
            let idx = usize::try_from(*index).unwrap_or(usize::MAX);
            if idx < items.len() {
                items.remove(idx);
            }
            Ok(())
        }
        (Value::Array(items), ResolvedSeg::Last) => {
            Rc::make_mut(items).pop();
            Ok(())
        }
        _ => Err(err("delete", path, "target container does not support delete")),
    }
}

fn want_number(method: &str, path: &[ResolvedSeg], value: &Value) -> Result<f64, Exception> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(err(method, path, format!("expected a number, found {}", other.type_name()))),
    }
}

fn numeric(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn want_string<'a>(method: &str, path: &[ResolvedSeg], value: &'a Value) -> Result<&'a str, Exception> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(err(method, path, format!("expected a string, found {}", other.type_name()))),
    }
}

fn arg<'a>(method: &str, path: &[ResolvedSeg], args: &'a [Value], index: usize) -> Result<&'a Value, Exception> {
    args.get(index)
        .ok_or_else(|| err(method, path, format!("missing argument {}", index + 1)))
}

fn check_not_nullish(method: &str, path: &[ResolvedSeg], target: &Value) -> Result<(), Exception> {
    if target.is_nullish() {
        Err(err(method, path, "target is undefined or null"))
    } else {
        Ok(())
    }
}

fn apply_method(
    target: &mut Value,
    method: &str,
    path: &[ResolvedSeg],
    args: &[Value],
    custom: &AHashMap<String, DataMethodFn>,
) -> Result<(), Exception> {
    match method {
        "set" => {
            *target = arg(method, path, args, 0)?.clone();
            Ok(())
        }
        "push" => {
            if target.is_nullish() {
                *target = Value::array(Vec::new());
            }
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot push to {}", target.type_name())));
            };
            Rc::make_mut(items).extend(args.iter().cloned());
            Ok(())
        }
        "unshift" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot unshift into {}", target.type_name())));
            };
            let items = Rc::make_mut(items);
            for (offset, value) in args.iter().enumerate() {
                items.insert(offset, value.clone());
            }
            Ok(())
        }
        "pop" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot pop from {}", target.type_name())));
            };
            Rc::make_mut(items).pop();
            Ok(())
        }
        "shift" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot shift from {}", target.type_name())));
            };
            let items = Rc::make_mut(items);
            if !items.is_empty() {
                items.remove(0);
            }
            Ok(())
        }
        "reverse" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot reverse {}", target.type_name())));
            };
            Rc::make_mut(items).reverse();
            Ok(())
        }
        "sort" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot sort {}", target.type_name())));
            };
            Rc::make_mut(items).sort_by(compare_for_sort);
            Ok(())
        }
        "sortWith" => {
            // the comparator is a dictionary key to order by; callable
            // comparators are not supported at flush time
            let key = want_string(method, path, arg(method, path, args, 0)?)?.to_owned();
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot sort {}", target.type_name())));
            };
            Rc::make_mut(items).sort_by(|a, b| compare_for_sort(&a.get_attr(&key), &b.get_attr(&key)));
            Ok(())
        }
        "concat" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot concat onto {}", target.type_name())));
            };
            let items = Rc::make_mut(items);
            for value in args {
                match value {
                    Value::Array(more) => items.extend(more.iter().cloned()),
                    other => items.push(other.clone()),
                }
            }
            Ok(())
        }
        "at" => {
            let index = want_number(method, path, arg(method, path, args, 0)?)? as i64;
            let Value::Array(_) = target else {
                return Err(err(method, path, format!("cannot index {}", target.type_name())));
            };
            *target = target.get_item(&Value::Int(index));
            Ok(())
        }
        "arraySlice" => {
            let Value::Array(items) = target else {
                return Err(err(method, path, format!("cannot slice {}", target.type_name())));
            };
            let len = items.len();
            let start = slice_bound(args.first(), 0, len);
            let end = slice_bound(args.get(1), len, len);
            let slice: Vec<Value> = items.iter().skip(start).take(end.saturating_sub(start)).cloned().collect();
            *target = Value::array(slice);
            Ok(())
        }
        "merge" => {
            let source = arg(method, path, args, 0)?;
            let Value::Dict(src) = source else {
                return Err(err(method, path, format!("merge source must be an object, found {}", source.type_name())));
            };
            if target.is_nullish() {
                *target = Value::dict(ValueMap::new());
            }
            let Value::Dict(map) = target else {
                return Err(err(method, path, format!("cannot merge into {}", target.type_name())));
            };
            let map = Rc::make_mut(map);
            for (key, value) in src.iter() {
                map.insert(key.clone(), value.clone());
            }
            Ok(())
        }
        "deepMerge" => {
            let source = arg(method, path, args, 0)?;
            if !matches!(source, Value::Dict(_)) {
                return Err(err(method, path, "deepMerge source must be an object"));
            }
            if target.is_nullish() {
                *target = Value::dict(ValueMap::new());
            }
            if !matches!(target, Value::Dict(_)) {
                return Err(err(method, path, format!("cannot deepMerge into {}", target.type_name())));
            }
            deep_merge(target, source);
            Ok(())
        }
        "append" | "text" => {
            let value = arg(method, path, args, 0)?;
            match target {
                Value::Str(s) => {
                    let mut out = s.to_string();
                    out.push_str(&value.coerce_str());
                    *target = Value::from(out);
                    Ok(())
                }
                Value::Array(items) => {
                    Rc::make_mut(items).push(value.clone());
                    Ok(())
                }
                Value::Undefined | Value::Null => {
                    *target = Value::from(value.coerce_str());
                    Ok(())
                }
                other => Err(err(method, path, format!("cannot append to {}", other.type_name()))),
            }
        }
        "add" => {
            check_not_nullish(method, path, target)?;
            let value = arg(method, path, args, 0)?;
            if let Value::Str(s) = target {
                let mut out = s.to_string();
                out.push_str(&value.coerce_str());
                *target = Value::from(out);
                return Ok(());
            }
            let result = want_number(method, path, target)? + want_number(method, path, value)?;
            *target = numeric(result);
            Ok(())
        }
        "subtract" => {
            check_not_nullish(method, path, target)?;
            let result = want_number(method, path, target)? - want_number(method, path, arg(method, path, args, 0)?)?;
            *target = numeric(result);
            Ok(())
        }
        "multiply" => {
            check_not_nullish(method, path, target)?;
            let result = want_number(method, path, target)? * want_number(method, path, arg(method, path, args, 0)?)?;
            *target = numeric(result);
            Ok(())
        }
        "divide" => {
            check_not_nullish(method, path, target)?;
            let divisor = want_number(method, path, arg(method, path, args, 0)?)?;
            if divisor == 0.0 {
                return Err(err(method, path, "division by zero"));
            }
            let result = want_number(method, path, target)? / divisor;
            *target = numeric(result);
            Ok(())
        }
        "increment" => {
            check_not_nullish(method, path, target)?;
            let result = want_number(method, path, target)? + 1.0;
            *target = numeric(result);
            Ok(())
        }
        "decrement" => {
            check_not_nullish(method, path, target)?;
            let result = want_number(method, path, target)? - 1.0;
            *target = numeric(result);
            Ok(())
        }
        "and" => {
            check_not_nullish(method, path, target)?;
            let value = arg(method, path, args, 0)?;
            if target.is_truthy() {
                *target = value.clone();
            }
            Ok(())
        }
        "or" => {
            check_not_nullish(method, path, target)?;
            let value = arg(method, path, args, 0)?;
            if !target.is_truthy() {
                *target = value.clone();
            }
            Ok(())
        }
        "not" => {
            check_not_nullish(method, path, target)?;
            *target = Value::Bool(!target.is_truthy());
            Ok(())
        }
        "bitAnd" => {
            let result = want_int(method, path, target)? & want_int(method, path, arg(method, path, args, 0)?)?;
            *target = Value::Int(result);
            Ok(())
        }
        "bitOr" => {
            let result = want_int(method, path, target)? | want_int(method, path, arg(method, path, args, 0)?)?;
            *target = Value::Int(result);
            Ok(())
        }
        "bitNot" => {
            let result = !want_int(method, path, target)?;
            *target = Value::Int(result);
            Ok(())
        }
        "toUpperCase" => string_transform(target, method, path, |s, _| Ok(s.to_uppercase()), args),
        "toLowerCase" => string_transform(target, method, path, |s, _| Ok(s.to_lowercase()), args),
        "trim" => string_transform(target, method, path, |s, _| Ok(s.trim().to_owned()), args),
        "trimStart" => string_transform(target, method, path, |s, _| Ok(s.trim_start().to_owned()), args),
        "trimEnd" => string_transform(target, method, path, |s, _| Ok(s.trim_end().to_owned()), args),
        "slice" | "substring" => {
            let s = want_string(method, path, target)?.to_owned();
            let chars: Vec<char> = s.chars().collect();
            let start = slice_bound(args.first(), 0, chars.len());
            let end = slice_bound(args.get(1), chars.len(), chars.len());
            let out: String = chars[start.min(chars.len())..end.clamp(start, chars.len())].iter().collect();
            *target = Value::from(out);
            Ok(())
        }
        "replace" => {
            let s = want_string(method, path, target)?.to_owned();
            let from = arg(method, path, args, 0)?.coerce_str();
            let to = arg(method, path, args, 1)?.coerce_str();
            *target = Value::from(s.replacen(&from, &to, 1));
            Ok(())
        }
        "replaceAll" => {
            let s = want_string(method, path, target)?.to_owned();
            let from = arg(method, path, args, 0)?.coerce_str();
            let to = arg(method, path, args, 1)?.coerce_str();
            *target = Value::from(s.replace(&from, &to));
            Ok(())
        }
        "split" => {
            let s = want_string(method, path, target)?.to_owned();
            let sep = arg(method, path, args, 0)?.coerce_str();
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::from(c.to_string())).collect()
            } else {
                s.split(&sep).map(Value::from).collect()
            };
            *target = Value::array(parts);
            Ok(())
        }
        "charAt" => {
            let s = want_string(method, path, target)?.to_owned();
            let index = want_number(method, path, arg(method, path, args, 0)?)? as usize;
            let out = s.chars().nth(index).map(|c| c.to_string()).unwrap_or_default();
            *target = Value::from(out);
            Ok(())
        }
        "repeat" => {
            let s = want_string(method, path, target)?.to_owned();
            let count = want_number(method, path, arg(method, path, args, 0)?)? as usize;
            *target = Value::from(s.repeat(count));
            Ok(())
        }
        other => {
            let Some(func) = custom.get(other) else {
                return Err(err(other, path, "unknown data method"));
            };
            let current = std::mem::take(target);
            *target = func(current, args)?;
            Ok(())
        }
    }
}

fn want_int(method: &str, path: &[ResolvedSeg], value: &Value) -> Result<i64, Exception> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(err(method, path, format!("expected an integer, found {}", other.type_name()))),
    }
}

fn string_transform(
    target: &mut Value,
    method: &str,
    path: &[ResolvedSeg],
    f: impl Fn(&str, &[Value]) -> Result<String, Exception>,
    args: &[Value],
) -> Result<(), Exception> {
    let s = want_string(method, path, target)?.to_owned();
    *target = Value::from(f(&s, args)?);
    Ok(())
}

fn slice_bound(value: Option<&Value>, default: usize, len: usize) -> usize {
    match value {
        Some(Value::Int(i)) => {
            if *i < 0 {
                len.saturating_sub(usize::try_from(-*i).unwrap_or(0))
            } else {
                usize::try_from(*i).unwrap_or(len).min(len)
            }
        }
        _ => default,
    }
}

/// Ordering used by `sort`: numbers before strings, otherwise coerced
/// string comparison.
fn compare_for_sort(a: &Value, b: &Value) -> std::cmp::Ordering {
    a.compare(b).unwrap_or_else(|| a.coerce_str().cmp(&b.coerce_str()))
}

/// Recursive merge: source wins on primitives, arrays are replaced,
/// dictionaries merge key by key.
fn deep_merge(target: &mut Value, source: &Value) {
    if let (Value::Dict(dst), Value::Dict(src)) = (&mut *target, source) {
        let dst = Rc::make_mut(dst);
        for (key, value) in src.iter() {
            match dst.get_mut(key) {
                Some(existing) if matches!(existing, Value::Dict(_)) && matches!(value, Value::Dict(_)) => {
                    deep_merge(existing, value);
                }
                _ => {
                    dst.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *target = source.clone();
    }
}

/// Builds the empty custom method table.
pub(crate) fn empty_methods() -> AHashMap<String, DataMethodFn> {
    AHashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResolvedSeg {
        ResolvedSeg::Key(s.to_owned())
    }

    fn apply(root: &mut Value, method: &str, path: &[ResolvedSeg], args: &[Value]) -> Result<(), Exception> {
        apply_command(root, method, path, args, &empty_methods())
    }

    #[test]
    fn deep_autovivification_creates_the_spine() {
        let mut root = Value::Undefined;
        apply(&mut root, "push", &[key("a"), key("b"), key("c"), key("d")], &[Value::Int(5)]).unwrap();
        let expected: serde_json::Value = serde_json::json!({"a": {"b": {"c": {"d": [5]}}}});
        assert_eq!(root.to_json(), expected);
    }

    #[test]
    fn last_marker_on_empty_array_raises() {
        let mut root = Value::Undefined;
        let result = apply(&mut root, "set", &[ResolvedSeg::Last], &[Value::Int(1)]);
        assert!(result.unwrap_err().message.contains("empty array"));
    }

    #[test]
    fn last_marker_targets_final_element() {
        let mut root = Value::Undefined;
        apply(&mut root, "push", &[key("xs")], &[Value::Int(1), Value::Int(2)]).unwrap();
        apply(&mut root, "add", &[key("xs"), ResolvedSeg::Last], &[Value::Int(10)]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"xs": [1, 12]}));
    }

    #[test]
    fn merge_and_deep_merge() {
        let mut root = Value::Undefined;
        let cfg = Value::from_json(serde_json::json!({"theme": "dark", "nested": {"a": 1, "keep": true}}));
        apply(&mut root, "merge", &[key("config")], std::slice::from_ref(&cfg)).unwrap();
        let update = Value::from_json(serde_json::json!({"nested": {"a": 2}}));
        apply(&mut root, "deepMerge", &[key("config")], &[update]).unwrap();
        assert_eq!(
            root.to_json(),
            serde_json::json!({"config": {"theme": "dark", "nested": {"a": 2, "keep": true}}})
        );
    }

    #[test]
    fn arithmetic_and_error_cases() {
        let mut root = Value::Undefined;
        apply(&mut root, "set", &[key("n")], &[Value::Int(10)]).unwrap();
        apply(&mut root, "divide", &[key("n")], &[Value::Int(4)]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"n": 2.5}));

        let result = apply(&mut root, "divide", &[key("n")], &[Value::Int(0)]);
        assert!(result.unwrap_err().message.contains("division by zero"));

        let result = apply(&mut root, "increment", &[key("missing")], &[]);
        assert!(result.unwrap_err().message.contains("undefined or null"));
    }

    #[test]
    fn delete_removes_from_parent() {
        let mut root = Value::from_json(serde_json::json!({"a": 1, "b": [1, 2, 3]}));
        apply(&mut root, "delete", &[key("a")], &[]).unwrap();
        apply(&mut root, "delete", &[key("b"), ResolvedSeg::Index(0)], &[]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"b": [2, 3]}));
    }

    #[test]
    fn string_projections() {
        let mut root = Value::from_json(serde_json::json!({"s": "  Hello World  "}));
        apply(&mut root, "trim", &[key("s")], &[]).unwrap();
        apply(&mut root, "toLowerCase", &[key("s")], &[]).unwrap();
        apply(&mut root, "replaceAll", &[key("s")], &[Value::str("l"), Value::str("_")]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"s": "he__o wor_d"}));
        let result = apply(&mut root, "trim", &[], &[]);
        assert!(result.unwrap_err().message.contains("expected a string"));
    }

    #[test]
    fn logical_combine_respects_truthiness() {
        let mut root = Value::from_json(serde_json::json!({"flag": false}));
        apply(&mut root, "or", &[key("flag")], &[Value::Bool(true)]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"flag": true}));
        apply(&mut root, "and", &[key("flag")], &[Value::str("yes")]).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"flag": "yes"}));
    }

    #[test]
    fn custom_methods_extend_the_vocabulary() {
        let mut table = empty_methods();
        table.insert(
            "double".to_owned(),
            Rc::new(|value: Value, _args: &[Value]| match value {
                Value::Int(i) => Ok(Value::Int(i * 2)),
                other => Err(Exception::runtime(format!("cannot double {}", other.type_name()))),
            }),
        );
        let mut root = Value::from_json(serde_json::json!({"n": 21}));
        apply_command(&mut root, "double", &[key("n")], &[], &table).unwrap();
        assert_eq!(root.to_json(), serde_json::json!({"n": 42}));
    }
}
