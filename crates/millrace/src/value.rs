//! The runtime value model.
//!
//! Values are a closed enum in a hybrid design: small immediates (`Int`,
//! `Bool`, `Null`) are stored inline, while strings, arrays, and dictionaries
//! are shared behind `Rc` with copy-on-write mutation (`Rc::make_mut`) in the
//! data assembler. Dictionaries are insertion-ordered, which fixes `for`
//! iteration order.
//!
//! Values are always fully resolved: a value still being computed lives in a
//! frame *slot* (see `schedule`), and readers park on the slot rather than
//! observing a placeholder.

use std::{cmp::Ordering, fmt, rc::Rc};

use indexmap::IndexMap;

/// An insertion-ordered dictionary of template values.
pub type ValueMap = IndexMap<String, Value>;

/// A template-defined callable: a macro closing over its defining frame, or
/// the `caller` body bound by a `{% call %}` block.
///
/// The definition and closure frame live in the render's macro registry;
/// the value carries only an index. This keeps frames and values acyclic
/// even for self-recursive macros.
#[derive(Debug, Clone)]
pub struct MacroValue {
    /// Index into the render's macro registry.
    pub(crate) index: usize,
    /// The `caller` value to expose inside the body, when bound by `call`.
    pub(crate) caller: Option<Box<Value>>,
}

/// Callable values flowing through frames.
#[derive(Debug, Clone)]
pub enum FuncValue {
    /// A `{% macro %}` closure (also used for `caller` and imported macros).
    Macro(Rc<MacroValue>),
}

/// Primary value type representing template data at runtime.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// A missing value: unset variable, absent attribute, out-of-range index.
    #[default]
    Undefined,
    /// The `null`/`none` literal.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Array(Rc<Vec<Value>>),
    Dict(Rc<ValueMap>),
    /// A template-defined callable.
    Func(FuncValue),
}

impl Value {
    #[must_use]
    pub fn str(s: impl AsRef<str>) -> Self {
        Self::Str(Rc::from(s.as_ref()))
    }

    #[must_use]
    pub fn array(items: Vec<Self>) -> Self {
        Self::Array(Rc::new(items))
    }

    #[must_use]
    pub fn dict(map: ValueMap) -> Self {
        Self::Dict(Rc::new(map))
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Dict(_) => "object",
            Self::Func(_) => "function",
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Truthiness mirrors the template language: empty strings, empty
    /// containers, zero, `null`, and `undefined` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Array(items) => !items.is_empty(),
            Self::Dict(map) => !map.is_empty(),
            Self::Func(_) => true,
        }
    }

    /// Number of elements for sized values: string chars, array items, dict
    /// entries.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.chars().count()),
            Self::Array(items) => Some(items.len()),
            Self::Dict(map) => Some(map.len()),
            _ => None,
        }
    }

    /// Attribute access (`a.b`). Returns `Undefined` for missing keys so the
    /// caller decides between lenient and `throw_on_undefined` behavior.
    #[must_use]
    pub fn get_attr(&self, name: &str) -> Self {
        match self {
            Self::Dict(map) => map.get(name).cloned().unwrap_or_default(),
            _ => Self::Undefined,
        }
    }

    /// Subscript access (`a[b]`). Negative integers index arrays and strings
    /// from the end.
    #[must_use]
    pub fn get_item(&self, key: &Self) -> Self {
        match (self, key) {
            (Self::Dict(map), Self::Str(k)) => map.get(k.as_ref()).cloned().unwrap_or_default(),
            (Self::Array(items), Self::Int(i)) => {
                resolve_index(*i, items.len()).and_then(|i| items.get(i).cloned()).unwrap_or_default()
            }
            (Self::Str(s), Self::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                resolve_index(*i, chars.len())
                    .and_then(|i| chars.get(i).map(|c| Self::str(c.to_string())))
                    .unwrap_or_default()
            }
            (Self::Dict(map), Self::Int(i)) => map.get(&i.to_string()).cloned().unwrap_or_default(),
            _ => Self::Undefined,
        }
    }

    /// The text-stream coercion.
    ///
    /// Arrays join their coerced elements with `,`. Plain dictionaries render
    /// the `[object Object]` placeholder in template mode and are dropped
    /// entirely (`None`) in script mode. `undefined`/`null` render empty.
    #[must_use]
    pub fn coerce_text(&self, script_mode: bool) -> Option<String> {
        match self {
            Self::Undefined | Self::Null => Some(String::new()),
            Self::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(format_float(*f)),
            Self::Str(s) => Some(s.to_string()),
            Self::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.coerce_text(script_mode).unwrap_or_default()).collect();
                Some(parts.join(","))
            }
            Self::Dict(_) => {
                if script_mode {
                    None
                } else {
                    Some("[object Object]".into())
                }
            }
            Self::Func(_) => Some(String::new()),
        }
    }

    /// Plain display string used by filters and error messages; like
    /// [`Self::coerce_text`] in template mode but never drops values.
    #[must_use]
    pub fn coerce_str(&self) -> String {
        self.coerce_text(false).unwrap_or_default()
    }

    /// Structural equality with numeric cross-comparison (`1 == 1.0`).
    #[must_use]
    pub fn deep_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y)),
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.deep_eq(w)))
            }
            _ => false,
        }
    }

    /// Ordering for comparison operators; `None` when the operands are not
    /// comparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Membership test (`in`): substring for strings, element for arrays,
    /// key for dictionaries.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        match self {
            Self::Str(s) => matches!(needle, Self::Str(n) if s.contains(n.as_ref())),
            Self::Array(items) => items.iter().any(|v| v.deep_eq(needle)),
            Self::Dict(map) => matches!(needle, Self::Str(n) if map.contains_key(n.as_ref())),
            _ => false,
        }
    }

    /// Converts from JSON, preserving object key order.
    #[must_use]
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::str(s),
            serde_json::Value::Array(items) => Self::array(items.into_iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => {
                Self::dict(map.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect())
            }
        }
    }

    /// Converts to JSON. `Undefined`, functions, and pending slots map to
    /// `null`; hosts never see pending values through supported boundaries.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Undefined | Self::Null | Self::Func(_) => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Str(s) => serde_json::Value::String(s.to_string()),
            Self::Array(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Dict(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

/// Formats a float the way the text stream expects: integral floats keep a
/// trailing `.0`-free form only when they round-trip, otherwise ryu's
/// shortest representation.
#[must_use]
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    if f == f.trunc() && f.abs() < 1e15 {
        // integral floats print without the exponent ryu would pick
        return format!("{f:.0}");
    }
    let mut buf = ryu::Buffer::new();
    buf.format(f).to_owned()
}

/// Maps a possibly negative subscript onto `0..len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        let i = usize::try_from(index).ok()?;
        (i < len).then_some(i)
    } else {
        let back = usize::try_from(-index).ok()?;
        len.checked_sub(back)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.coerce_str())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(Rc::from(v.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_coercion_drops_dicts_in_script_mode() {
        let dict = Value::dict(ValueMap::from_iter([("a".to_owned(), Value::Int(1))]));
        assert_eq!(dict.coerce_text(true), None);
        assert_eq!(dict.coerce_text(false).as_deref(), Some("[object Object]"));
    }

    #[test]
    fn arrays_join_with_comma() {
        let arr = Value::array(vec![Value::Int(1), Value::str("x"), Value::Bool(true)]);
        assert_eq!(arr.coerce_text(true).as_deref(), Some("1,x,true"));
    }

    #[test]
    fn negative_indices_count_from_the_end() {
        let arr = Value::array(vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
        assert!(arr.get_item(&Value::Int(-1)).deep_eq(&Value::Int(30)));
        assert!(arr.get_item(&Value::Int(3)).is_undefined());
    }

    #[test]
    fn numeric_cross_equality() {
        assert!(Value::Int(1).deep_eq(&Value::Float(1.0)));
        assert!(!Value::Int(1).deep_eq(&Value::str("1")));
    }

    #[test]
    fn json_round_trip_preserves_key_order() {
        let json: serde_json::Value = serde_json::from_str(r#"{"z":1,"a":{"k":[1,2]},"m":null}"#).unwrap();
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);
        let Value::Dict(map) = &value else { panic!("expected dict") };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(-0.25), "-0.25");
    }
}
