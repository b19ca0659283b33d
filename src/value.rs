//! Host-side dynamic values.
//!
//! A native stack slot decodes to a [`Value`], and any `Value` can be pushed
//! back. Primitives cross by copy; functions, objects, sequences and
//! mappings cross by handle and stay shared with the host.

use std::cell::{Ref, RefCell};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::state::State;

/// Mapping payload of [`Value::Map`].
pub type Map = BTreeMap<Key, Value>;

/// Shared sequence storage. Clones of a [`Value::Array`] alias it.
pub type SharedArray = Rc<RefCell<Vec<Value>>>;

/// Shared mapping storage. Clones of a [`Value::Map`] alias it.
pub type SharedMap = Rc<RefCell<Map>>;

/// A dynamic value as seen by host code.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Ordered sequence. Decoded from composites keyed exactly `1..=N`.
    Array(SharedArray),
    /// Keyed mapping. Only text and number keys survive decoding.
    Map(SharedMap),
    /// Opaque host object, exposed to script through dynamic field access.
    Object(Object),
    /// Host function callable from script.
    Function(Function),
}

/// Keys a [`Map`] may hold.
///
/// Numbers with an exact 64-bit integer value are always stored as `Int`,
/// matching the runtime's own key normalization.
#[derive(Clone, Debug)]
pub enum Key {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Convert a float to an integer only if the conversion is exact.
pub fn float_to_int_exact(n: f64) -> Option<i64> {
    // 2^63 itself saturates to i64::MAX and would compare equal after the
    // round trip, so bound the range explicitly.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n >= -LIMIT && n < LIMIT {
        let i = n as i64;
        if i as f64 == n {
            return Some(i);
        }
    }
    None
}

impl Key {
    /// Key for a numeric value, normalizing integral floats. NaN has no key.
    pub fn from_number(n: f64) -> Option<Key> {
        if n.is_nan() {
            return None;
        }
        Some(match float_to_int_exact(n) {
            Some(i) => Key::Int(i),
            None => Key::Float(n),
        })
    }

    /// Key for a value, if the value is usable as one.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int(i) => Some(Key::Int(*i)),
            Value::Float(f) => Key::from_number(*f),
            Value::String(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }

    /// The key as a value.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Int(*i),
            Key::Float(f) => Value::Float(*f),
            Key::Str(s) => Value::String(s.clone()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Int(_) => 0,
            Key::Float(_) => 1,
            Key::Str(_) => 2,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Float(a), Key::Float(b)) => a.total_cmp(b),
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Float(n) => write!(f, "{}", n),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// By-name field access for values exposed to script as objects.
///
/// `obj.key` in script calls [`get`](DynamicAccess::get); `obj.key = v` calls
/// [`set`](DynamicAccess::set), with `Nil` when the value was omitted.
pub trait DynamicAccess {
    fn get(&self, key: &str) -> Value;
    fn set(&mut self, key: &str, value: Value);
}

/// Something script can call.
///
/// The callee reads its arguments from `state` (slots `1..=get_top()`),
/// pushes its results and returns how many it pushed.
pub trait Invoke {
    fn call(&self, state: &State) -> i32;
}

/// A host type that can be pushed as an opaque [`Object`].
pub trait HostObject: DynamicAccess {
    /// Objects that are also callable get pushed as script functions.
    fn as_invoke(&self) -> Option<&dyn Invoke> {
        None
    }
}

/// A shared host function.
#[derive(Clone)]
pub struct Function(Rc<dyn Fn(&State) -> i32>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&State) -> i32 + 'static,
    {
        Function(Rc::new(f))
    }

    pub fn call(&self, state: &State) -> i32 {
        (self.0)(state)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Rc::as_ptr(&self.0) as *const u8)
    }
}

/// A shared, opaque host object.
///
/// Keep your own `Rc<RefCell<T>>` and pass it to [`Object::from_rc`] to read
/// the concrete type back after script has modified it.
#[derive(Clone)]
pub struct Object(Rc<RefCell<dyn HostObject>>);

impl Object {
    pub fn new<T: HostObject + 'static>(object: T) -> Self {
        Object(Rc::new(RefCell::new(object)))
    }

    pub fn from_rc<T: HostObject + 'static>(object: Rc<RefCell<T>>) -> Self {
        Object(object)
    }

    /// Read a field. Yields `Nil` while the object is mutably borrowed.
    pub fn get(&self, key: &str) -> Value {
        match self.0.try_borrow() {
            Ok(obj) => obj.get(key),
            Err(_) => {
                log::debug!("object busy, field '{}' reads as nil", key);
                Value::Nil
            }
        }
    }

    /// Write a field. Returns false if the object was busy (e.g. it is the
    /// callee currently running).
    pub fn set(&self, key: &str, value: Value) -> bool {
        match self.0.try_borrow_mut() {
            Ok(mut obj) => {
                obj.set(key, value);
                true
            }
            Err(_) => {
                log::debug!("object busy, write to field '{}' dropped", key);
                false
            }
        }
    }

    pub fn is_callable(&self) -> bool {
        self.0
            .try_borrow()
            .map(|obj| obj.as_invoke().is_some())
            .unwrap_or(false)
    }

    /// Call the object, if it is callable.
    pub fn call(&self, state: &State) -> Option<i32> {
        let obj = self.0.try_borrow().ok()?;
        let invoke = obj.as_invoke()?;
        Some(invoke.call(state))
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:p})", Rc::as_ptr(&self.0) as *const u8)
    }
}

// =============================================================================
// Value
// =============================================================================

impl Value {
    /// A new sequence.
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// A new mapping.
    pub fn map(map: Map) -> Value {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<Ref<'_, Vec<Value>>> {
        match self {
            Value::Array(items) => Some(items.borrow()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<Ref<'_, Map>> {
        match self {
            Value::Map(map) => Some(map.borrow()),
            _ => None,
        }
    }

    /// Identity of a shared sequence or mapping.
    pub(crate) fn composite_id(&self) -> Option<*const ()> {
        match self {
            Value::Array(items) => Some(Rc::as_ptr(items) as *const ()),
            Value::Map(map) => Some(Rc::as_ptr(map) as *const ()),
            _ => None,
        }
    }

    /// Whether pushing this value produces a script function.
    pub fn is_callable(&self) -> bool {
        match self {
            Value::Function(_) => true,
            Value::Object(obj) => obj.is_callable(),
            _ => false,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    /// Convert to JSON. Objects and functions have no JSON form and become
    /// `null`, as do non-finite floats and a composite nested in itself.
    pub fn to_json(&self) -> serde_json::Value {
        self.json_of(&mut Vec::new())
    }

    fn json_of(&self, open: &mut Vec<*const ()>) -> serde_json::Value {
        use serde_json::Value as Json;
        if let Some(id) = self.composite_id() {
            if open.contains(&id) {
                return Json::Null;
            }
            open.push(id);
        }
        let json = match self {
            Value::Nil | Value::Object(_) | Value::Function(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => {
                Json::Array(items.borrow().iter().map(|v| v.json_of(open)).collect())
            }
            Value::Map(map) => Json::Object(
                map.borrow()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.json_of(open)))
                    .collect(),
            ),
        };
        if self.composite_id().is_some() {
            open.pop();
        }
        json
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Nil,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(fields) => Value::map(
                fields
                    .iter()
                    .map(|(k, v)| (Key::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Resolve a field name against a mapping: the text key if present, else a
/// numeric key spelled the same way.
fn map_key(map: &Map, key: &str) -> Key {
    let text = Key::Str(key.to_string());
    if map.contains_key(&text) {
        return text;
    }
    if let Some(numeric) = key.parse::<f64>().ok().and_then(Key::from_number) {
        if map.contains_key(&numeric) {
            return numeric;
        }
    }
    text
}

/// 1-based position from a field name.
fn array_index(key: &str) -> Option<usize> {
    key.parse::<usize>().ok().filter(|i| *i >= 1)
}

/// Field access on composites reads and writes the shared storage, so every
/// clone of the value sees a write.
impl DynamicAccess for Value {
    fn get(&self, key: &str) -> Value {
        match self {
            Value::Map(map) => {
                let map = map.borrow();
                map.get(&map_key(&map, key)).cloned().unwrap_or_default()
            }
            Value::Array(items) => array_index(key)
                .and_then(|i| items.borrow().get(i - 1).cloned())
                .unwrap_or_default(),
            Value::Object(obj) => obj.get(key),
            _ => Value::Nil,
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        match self {
            Value::Map(map) => {
                let mut map = map.borrow_mut();
                let key = map_key(&map, key);
                if value.is_nil() {
                    map.remove(&key);
                } else {
                    map.insert(key, value);
                }
            }
            Value::Array(items) => match array_index(key) {
                Some(i) if i <= items.borrow().len() => items.borrow_mut()[i - 1] = value,
                Some(i) if i == items.borrow().len() + 1 && !value.is_nil() => {
                    items.borrow_mut().push(value)
                }
                _ => log::debug!("array write to '{}' out of range", key),
            },
            Value::Object(obj) => {
                obj.set(key, value);
            }
            _ => log::debug!("field write to '{}' on a {}", key, self.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tree(f, self, Style::Debug, &mut Vec::new())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tree(f, self, Style::Display, &mut Vec::new())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Style {
    Debug,
    Display,
    /// Display inside a composite: strings are quoted.
    Nested,
}

/// Write a value, printing `<cycle>` for a composite nested in itself.
fn write_tree(
    f: &mut fmt::Formatter<'_>,
    value: &Value,
    style: Style,
    open: &mut Vec<*const ()>,
) -> fmt::Result {
    let inner = match style {
        Style::Debug => Style::Debug,
        _ => Style::Nested,
    };
    if let Some(id) = value.composite_id() {
        if open.contains(&id) {
            return write!(f, "<cycle>");
        }
        open.push(id);
    }

    match value {
        Value::Array(items) => {
            if style == Style::Debug {
                write!(f, "Array")?;
            }
            write!(f, "[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_tree(f, item, inner, open)?;
            }
            write!(f, "]")?;
        }
        Value::Map(map) => {
            if style == Style::Debug {
                write!(f, "Map")?;
            }
            write!(f, "{{")?;
            for (i, (k, v)) in map.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: ", k)?;
                write_tree(f, v, inner, open)?;
            }
            write!(f, "}}")?;
        }
        other => write_leaf(f, other, style)?,
    }

    if value.composite_id().is_some() {
        open.pop();
    }
    Ok(())
}

fn write_leaf(f: &mut fmt::Formatter<'_>, value: &Value, style: Style) -> fmt::Result {
    if style == Style::Debug {
        return match value {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Object(obj) => fmt::Debug::fmt(obj, f),
            Value::Function(func) => fmt::Debug::fmt(func, f),
            Value::Array(_) | Value::Map(_) => Ok(()),
        };
    }
    match value {
        Value::Nil => write!(f, "nil"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Int(n) => write!(f, "{}", n),
        Value::Float(n) => {
            if n.is_finite() && n.fract() == 0.0 {
                write!(f, "{}.0", n)
            } else {
                write!(f, "{}", n)
            }
        }
        Value::String(s) if style == Style::Nested => write!(f, "{:?}", s),
        Value::String(s) => write!(f, "{}", s),
        Value::Object(_) => write!(f, "<object>"),
        Value::Function(_) => write!(f, "<function>"),
        Value::Array(_) | Value::Map(_) => Ok(()),
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::map(map)
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::Function(func)
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(obj)
    }
}
