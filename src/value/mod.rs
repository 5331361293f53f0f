//! The dynamic value model: a tagged sum type used as both the in-memory
//! representation handlers operate on and the wire format for RPC payloads.
//! Variants live in one enum and operators are plain match arms, rather than
//! the class hierarchy a dynamically-typed value model is often built from.

mod json;

use std::fmt;
use std::rc::Rc;

use crate::coroutine::Coroutine;

pub use json::JsonError;

/// An insertion-ordered string-keyed map.
///
/// Iteration order is the order keys were first inserted, matching the wire
/// order of a JSON object. Backed by a flat `Vec` rather than a hash map: RPC
/// `args`/`kwargs` maps are small, and linear lookup is both simpler and
/// plenty fast at that size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedMap {
    entries: Vec<(String, Value)>,
}

impl OrderedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or overwrites `key`, preserving the original position on overwrite.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }
}

impl FromIterator<(String, Value)> for OrderedMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// A byte-sequence string. Conventionally UTF-8, but the wire format's
/// `\xNN` escape can introduce bytes that aren't valid UTF-8 on their own,
/// so this does not wrap `std::String`.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct WString(pub Vec<u8>);

impl WString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossless if the bytes are valid UTF-8; otherwise replaces invalid
    /// sequences, matching how most callers want to display a Value for logs.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl fmt::Debug for WString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl From<String> for WString {
    fn from(s: String) -> Self {
        WString(s.into_bytes())
    }
}

impl From<&str> for WString {
    fn from(s: &str) -> Self {
        WString(s.as_bytes().to_vec())
    }
}

/// Four non-serializable callable shapes. A "bound member" is just a closure
/// that already captured its receiver; the variant is kept distinct so
/// callers can tell at runtime whether invoking it is expected to suspend
/// (the `Coroutine*` variants).
#[derive(Clone)]
pub enum Callable {
    /// Plain function: runs to completion synchronously.
    Function(Rc<dyn Fn(Vec<Value>, OrderedMap) -> Result<Value, Value>>),
    /// Factory for a coroutine: may suspend before producing a value.
    CoroutineFunction(Rc<dyn Fn(Vec<Value>, OrderedMap) -> Coroutine>),
    /// Bound-member equivalent of `Function`.
    BoundMethod(Rc<dyn Fn(Vec<Value>, OrderedMap) -> Result<Value, Value>>),
    /// Bound-member equivalent of `CoroutineFunction`.
    BoundCoroutineMethod(Rc<dyn Fn(Vec<Value>, OrderedMap) -> Coroutine>),
}

impl Callable {
    /// Invokes the callable, always producing a coroutine: synchronous
    /// variants are wrapped in an already-completed one.
    pub fn call(&self, args: Vec<Value>, kwargs: OrderedMap) -> Coroutine {
        match self {
            Callable::Function(f) | Callable::BoundMethod(f) => {
                Coroutine::completed(f(args, kwargs))
            }
            Callable::CoroutineFunction(f) | Callable::BoundCoroutineMethod(f) => f(args, kwargs),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Callable::Function(_) => "function",
            Callable::CoroutineFunction(_) => "coroutine_function",
            Callable::BoundMethod(_) => "bound_method",
            Callable::BoundCoroutineMethod(_) => "bound_coroutine_method",
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callable:{}>", self.kind())
    }
}

// Callables have no meaningful equality; two references to different
// closures are never considered equal, even to themselves by value.
impl PartialEq for Callable {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

/// The tagged sum type. See module docs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(WString),
    Vector(Vec<Value>),
    Map(OrderedMap),
    Callable(Callable),
}

impl Value {
    pub fn str(s: impl Into<WString>) -> Value {
        Value::Str(s.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => s.as_str(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Value]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&OrderedMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Asserts this is a `Str` and returns it, panicking otherwise. For call
    /// sites that already know a value's tag from protocol position (e.g. a
    /// handler that documents its own argument types) and would rather abort
    /// immediately on a violated assumption than propagate an `Option`.
    pub fn expect_str(&self) -> &str {
        self.as_str().unwrap_or_else(|| panic!("expected a string Value, got {self:?}"))
    }

    pub fn expect_int(&self) -> i64 {
        self.as_int().unwrap_or_else(|| panic!("expected an int Value, got {self:?}"))
    }

    pub fn expect_float(&self) -> f64 {
        self.as_float().unwrap_or_else(|| panic!("expected a float Value, got {self:?}"))
    }

    pub fn expect_bool(&self) -> bool {
        self.as_bool().unwrap_or_else(|| panic!("expected a bool Value, got {self:?}"))
    }

    pub fn expect_vector(&self) -> &[Value] {
        self.as_vector().unwrap_or_else(|| panic!("expected a vector Value, got {self:?}"))
    }

    pub fn expect_map(&self) -> &OrderedMap {
        self.as_map().unwrap_or_else(|| panic!("expected a map Value, got {self:?}"))
    }

    /// Serializes to the wire JSON format. Fails if any `Callable` is
    /// reachable from this value, since a callable has no wire representation.
    pub fn dump(&self) -> Result<String, JsonError> {
        json::dump(self)
    }

    /// Parses wire JSON into a fresh, owned `Value` tree.
    pub fn load(text: &str) -> Value {
        json::load(text)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Vector(v)
    }
}

impl From<OrderedMap> for Value {
    fn from(m: OrderedMap) -> Self {
        Value::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_preserves_insertion_order_through_overwrite() {
        let mut m = OrderedMap::new();
        m.insert("b", Value::Int(1));
        m.insert("a", Value::Int(2));
        m.insert("b", Value::Int(3));
        let keys: Vec<&str> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(m.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn dump_rejects_callable() {
        let v = Value::Callable(Callable::Function(Rc::new(|_, _| Ok(Value::None))));
        assert!(v.dump().is_err());
    }

    #[test]
    fn expect_int_returns_the_value_when_tag_matches() {
        assert_eq!(Value::Int(7).expect_int(), 7);
    }

    #[test]
    #[should_panic(expected = "expected an int Value")]
    fn expect_int_panics_on_tag_mismatch() {
        Value::str("not an int").expect_int();
    }
}
