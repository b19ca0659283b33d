//! Value marshaling between native stack slots and [`Value`].
//!
//! Encoding: primitives map onto native primitives; functions and callable
//! objects become native functions; everything else becomes an opaque
//! userdata whose fields script reaches through [`DynamicAccess`].
//! [`State::push_table`] is the by-copy alternative for plain data.
//!
//! Decoding tests the native type in a fixed order: userdata, number,
//! boolean, text, table, function. Tables are classified as a sequence when
//! their keys are exactly `1..=N`, and as a mapping otherwise. Composites
//! nested deeper than [`MAX_DEPTH`] decode as nil.
//!
//! [`DynamicAccess`]: crate::value::DynamicAccess

use std::collections::HashSet;

use libc::c_void;
use mlua_sys as ffi;

use crate::state::{Kind, State};
use crate::trampoline;
use crate::value::{Key, Map, Value, float_to_int_exact};

/// Deepest composite nesting converted in either direction.
pub(crate) const MAX_DEPTH: usize = 128;

impl State {
    /// Push a host value.
    ///
    /// Each push of a function or object allocates a fresh handle; pushing
    /// the same object twice yields two independently finalized handles.
    pub fn push_value(&self, value: &Value) {
        if !self.check_stack(1) {
            log::error!("stack overflow pushing a {}", value.type_name());
            return;
        }
        match value {
            Value::Nil => self.push_nil(),
            Value::Bool(b) => self.push_boolean(*b),
            Value::Int(n) => self.push_integer(*n),
            Value::Float(n) => self.push_number(*n),
            Value::String(s) => self.push_string(s),
            _ if value.is_callable() => {
                trampoline::push_function(self, value.clone());
            }
            _ => {
                trampoline::push_object(self, value.clone());
            }
        }
    }

    /// Push a host function.
    pub fn push_function<F>(&self, f: F)
    where
        F: Fn(&State) -> i32 + 'static,
    {
        self.push_value(&Value::Function(crate::value::Function::new(f)));
    }

    /// Push a value, copying sequences and mappings into native tables.
    ///
    /// Sequences land at keys `1..=N`. Anything that is not a sequence or a
    /// mapping is pushed as by [`push_value`](State::push_value).
    ///
    /// A composite nested in itself, or deeper than [`MAX_DEPTH`], is pushed
    /// as nil.
    pub fn push_table(&self, value: &Value) {
        self.push_tree(value, &mut Vec::new());
    }

    fn push_tree(&self, value: &Value, open: &mut Vec<*const ()>) {
        let Some(id) = value.composite_id() else {
            self.push_value(value);
            return;
        };
        if open.contains(&id) || open.len() >= MAX_DEPTH {
            log::warn!("{} nested too deep or in itself, pushed as nil", value.type_name());
            self.push_nil();
            return;
        }
        if !self.check_stack(3) {
            log::error!("stack overflow pushing a table");
            return;
        }

        open.push(id);
        match value {
            Value::Array(items) => {
                let items = items.borrow();
                self.create_table(items.len() as i32, 0);
                for (i, item) in items.iter().enumerate() {
                    self.push_tree(item, open);
                    self.raw_set_index(-2, i as i64 + 1);
                }
            }
            Value::Map(map) => {
                let map = map.borrow();
                self.create_table(0, map.len() as i32);
                for (key, item) in map.iter() {
                    if item.is_nil() {
                        continue;
                    }
                    self.push_key(key);
                    self.push_tree(item, open);
                    self.raw_set(-3);
                }
            }
            _ => {}
        }
        open.pop();
    }

    fn push_key(&self, key: &Key) {
        match key {
            Key::Int(n) => self.push_integer(*n),
            Key::Float(n) => self.push_number(*n),
            Key::Str(s) => self.push_string(s),
        }
    }

    /// Decode the slot at `index`.
    ///
    /// The stack is left exactly as found. Types without a host counterpart
    /// (threads, light userdata, functions not pushed by the host) decode to
    /// `Nil`, as does a table reached again while it is still being decoded.
    pub fn to_value(&self, index: i32) -> Value {
        let mut visiting = HashSet::new();
        self.decode(index, &mut visiting, 0)
    }

    fn decode(&self, index: i32, visiting: &mut HashSet<*const c_void>, depth: usize) -> Value {
        match self.type_at(index) {
            Kind::Userdata => self.decode_object(index),
            Kind::Number => self.decode_number(index),
            Kind::Boolean => Value::Bool(self.to_boolean(index)),
            Kind::String => self.to_text(index).map(Value::String).unwrap_or_default(),
            Kind::Table => self.decode_table(index, visiting, depth),
            Kind::Function => self.decode_function(index),
            _ => Value::Nil,
        }
    }

    /// Host functions come back as themselves; script and native functions
    /// have no host form.
    fn decode_function(&self, index: i32) -> Value {
        let l = self.raw();
        if !self.check_stack(1) {
            log::error!("stack overflow decoding a function");
            return Value::Nil;
        }
        unsafe {
            if ffi::lua_iscfunction(l, index) == 0 || ffi::lua_getupvalue(l, index, 1).is_null() {
                return Value::Nil;
            }
        }
        let value = match self.decode_object(-1) {
            value if value.is_callable() => value,
            _ => Value::Nil,
        };
        self.pop(1);
        value
    }

    fn decode_object(&self, index: i32) -> Value {
        let Some(handle) = self.to_handle(index) else {
            return Value::Nil;
        };
        let found = match self.objects().try_borrow() {
            Ok(objects) => objects.get(handle).cloned(),
            Err(_) => None,
        };
        match found {
            Some(value) => value,
            None => {
                log::debug!("userdata {:?} is not a host object", handle);
                Value::Nil
            }
        }
    }

    fn decode_number(&self, index: i32) -> Value {
        if unsafe { ffi::lua_isinteger(self.raw(), index) } != 0 {
            return Value::Int(self.to_integer(index));
        }
        let n = self.to_number(index);
        match float_to_int_exact(n) {
            Some(i) => Value::Int(i),
            None => Value::Float(n),
        }
    }

    fn decode_table(
        &self,
        index: i32,
        visiting: &mut HashSet<*const c_void>,
        depth: usize,
    ) -> Value {
        if depth >= MAX_DEPTH {
            log::warn!("table nested deeper than {} levels decoded as nil", MAX_DEPTH);
            return Value::Nil;
        }
        let table = self.abs_index(index);
        let identity = unsafe { ffi::lua_topointer(self.raw(), table) };
        if !visiting.insert(identity) {
            log::debug!("cyclic table decoded as nil");
            return Value::Nil;
        }
        if !self.check_stack(3) {
            log::error!("stack overflow decoding a table");
            visiting.remove(&identity);
            return Value::Nil;
        }

        let mut entries: Vec<(Value, Value)> = Vec::new();
        self.push_nil();
        while self.next(table) {
            // key at -2, value at -1
            let key = match self.type_at(-2) {
                Kind::Number => self.decode_number(-2),
                Kind::String => self.to_text(-2).map(Value::String).unwrap_or_default(),
                other => {
                    log::debug!("dropping table entry with a {} key", other.name());
                    Value::Nil
                }
            };
            let value = self.decode(-1, visiting, depth + 1);
            entries.push((key, value));
            self.pop(1);
        }

        visiting.remove(&identity);
        classify(entries)
    }
}

/// Decide whether decoded table entries form a sequence or a mapping.
///
/// `entries` holds every entry of the table, with `Nil` standing in for keys
/// of unsupported types. The table is a sequence iff its integer keys form
/// the run `1..=N` and nothing else is present. No entries is an empty
/// mapping.
pub(crate) fn classify(entries: Vec<(Value, Value)>) -> Value {
    let total = entries.len();
    let run = entries
        .iter()
        .filter(|(key, _)| matches!(key, Value::Int(i) if *i >= 1 && *i as u64 <= total as u64))
        .count();

    if total > 0 && run == total {
        let mut items = vec![Value::Nil; total];
        for (key, value) in entries {
            if let Value::Int(i) = key {
                items[i as usize - 1] = value;
            }
        }
        return Value::array(items);
    }

    let mut map = Map::new();
    for (key, value) in entries {
        if value.is_nil() {
            continue;
        }
        if let Some(key) = Key::from_value(&key) {
            map.insert(key, value);
        }
    }
    Value::map(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lua;
    use crate::value::{DynamicAccess, Function, Object};

    fn map_of(entries: &[(&str, Value)]) -> Map {
        entries
            .iter()
            .map(|(k, v)| (Key::from(*k), v.clone()))
            .collect()
    }

    fn eval(lua: &Lua, expr: &str) -> Value {
        let mut results = lua.exec(&format!("return {}", expr)).unwrap();
        results.remove(0)
    }

    #[test]
    fn test_primitive_round_trip() {
        let lua = Lua::open();
        let samples = [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-17),
            Value::Int(i64::MAX),
            Value::Int(i64::MIN),
            Value::Float(1.5),
            Value::Float(-0.125),
            Value::from(""),
            Value::from("text with spaces"),
        ];
        for sample in &samples {
            lua.push_value(sample);
            assert_eq!(&lua.to_value(-1), sample);
            lua.pop(1);
        }
        assert_eq!(lua.get_top(), 0);
    }

    #[test]
    fn test_integral_float_decodes_as_integer() {
        let lua = Lua::open();
        lua.push_number(8.0);
        assert_eq!(lua.to_value(-1), Value::Int(8));
        lua.push_number(f64::INFINITY);
        assert_eq!(lua.to_value(-1), Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_sequence_from_script() {
        let lua = Lua::open();
        assert_eq!(
            eval(&lua, "{'a', 'b', 'c'}"),
            Value::array(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
    }

    #[test]
    fn test_mapping_from_script() {
        let lua = Lua::open();
        assert_eq!(
            eval(&lua, "{x = 1, y = 2}"),
            Value::map(map_of(&[("x", Value::Int(1)), ("y", Value::Int(2))]))
        );
    }

    #[test]
    fn test_gap_decodes_as_mapping() {
        let lua = Lua::open();
        let value = eval(&lua, "{[1] = 'a', [2] = 'b', [4] = 'd'}");
        let mut expected = Map::new();
        expected.insert(Key::Int(1), Value::from("a"));
        expected.insert(Key::Int(2), Value::from("b"));
        expected.insert(Key::Int(4), Value::from("d"));
        assert_eq!(value, Value::map(expected));
    }

    #[test]
    fn test_empty_table_is_empty_mapping() {
        let lua = Lua::open();
        assert_eq!(eval(&lua, "{}"), Value::map(Map::new()));
    }

    #[test]
    fn test_mixed_keys_decode_as_mapping() {
        let lua = Lua::open();
        let value = eval(&lua, "{10, 20, name = 'n'}");
        let mut expected = Map::new();
        expected.insert(Key::Int(1), Value::Int(10));
        expected.insert(Key::Int(2), Value::Int(20));
        expected.insert(Key::from("name"), Value::from("n"));
        assert_eq!(value, Value::map(expected));
    }

    #[test]
    fn test_unsupported_keys_are_dropped() {
        let lua = Lua::open();
        let value = eval(&lua, "{[true] = 1, [{}] = 2, keep = 3}");
        assert_eq!(value, Value::map(map_of(&[("keep", Value::Int(3))])));
    }

    #[test]
    fn test_sequence_containing_only_unsupported_key_is_mapping() {
        let lua = Lua::open();
        assert_eq!(eval(&lua, "{[false] = 1}"), Value::map(Map::new()));
    }

    #[test]
    fn test_nested_tables() {
        let lua = Lua::open();
        let value = eval(&lua, "{items = {1, 2}, meta = {ok = true}}");
        assert_eq!(
            value.get("items"),
            Value::array(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            value.get("meta"),
            Value::map(map_of(&[("ok", Value::Bool(true))]))
        );
    }

    #[test]
    fn test_unsupported_values() {
        let lua = Lua::with_libs();
        assert_eq!(eval(&lua, "print"), Value::Nil);
        assert_eq!(eval(&lua, "coroutine.create(function() end)"), Value::Nil);
        assert_eq!(eval(&lua, "io.stdout"), Value::Nil);
        // Entries whose value has no host form are dropped from mappings.
        assert_eq!(
            eval(&lua, "{f = print, n = 1}"),
            Value::map(map_of(&[("n", Value::Int(1))]))
        );
    }

    #[test]
    fn test_cyclic_table() {
        let lua = Lua::open();
        let value = eval(&lua, "(function() local t = {name = 'loop'}; t.self = t; return t end)()");
        assert_eq!(value, Value::map(map_of(&[("name", Value::from("loop"))])));
    }

    #[test]
    fn test_deeply_nested_table_is_cut_off() {
        let lua = Lua::open();
        let value = eval(&lua, "(function() local t = {} for i = 1, 20000 do t = {t} end return t end)()");

        let mut levels = 0;
        let mut current = value;
        loop {
            let next = match &current {
                Value::Array(items) => items.borrow().first().cloned(),
                _ => break,
            };
            levels += 1;
            current = next.unwrap_or_default();
        }
        assert_eq!(levels, MAX_DEPTH);
        assert!(current.is_nil());
        assert_eq!(lua.get_top(), 0);
    }

    #[test]
    fn test_push_table_cuts_off_cycles() {
        let lua = Lua::open();
        let mut value = Value::map(map_of(&[("name", Value::from("loop"))]));
        let alias = value.clone();
        value.set("self", alias);

        lua.push_table(&value);
        assert_eq!(lua.get_top(), 1);
        assert_eq!(
            lua.to_value(-1),
            Value::map(map_of(&[("name", Value::from("loop"))]))
        );
        value.set("self", Value::Nil);
    }

    #[test]
    fn test_opaque_composite_aliases_host_value() {
        let lua = Lua::open();
        let data = Value::map(map_of(&[("title", Value::from("OK"))]));
        lua.push_value(&data);
        lua.set_global("data");

        lua.exec("data.title = 'changed'; data.count = 2").unwrap();
        assert_eq!(data.get("title"), Value::from("changed"));
        assert_eq!(data.get("count"), Value::Int(2));
    }

    #[test]
    fn test_decode_preserves_stack_depth() {
        let lua = Lua::open();
        lua.load_string("return {1, {2, 3}, {k = 'v'}}, 'tail'");
        lua.call(0, 2);
        assert_eq!(lua.get_top(), 2);

        let _ = lua.to_value(1);
        let _ = lua.to_value(-2);
        assert_eq!(lua.get_top(), 2);
        assert_eq!(lua.to_text(-1).as_deref(), Some("tail"));
    }

    #[test]
    fn test_push_table_round_trip() {
        let lua = Lua::open();
        let seq = Value::array(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        lua.push_table(&seq);
        assert!(lua.is_table(-1));
        assert_eq!(lua.to_value(-1), seq);

        let map = Value::map(map_of(&[("x", Value::Int(1)), ("y", Value::Int(2))]));
        lua.push_table(&map);
        assert!(lua.is_table(-1));
        assert_eq!(lua.to_value(-1), map);
    }

    #[test]
    fn test_push_table_visible_to_script() {
        let lua = Lua::open();
        let mut config = Map::new();
        config.insert(Key::from("ports"), Value::array(vec![Value::Int(80), Value::Int(443)]));
        lua.push_table(&Value::map(config));
        lua.set_global("config");

        let results = lua.exec("return #config.ports, config.ports[2]").unwrap();
        assert_eq!(results, vec![Value::Int(2), Value::Int(443)]);
    }

    #[test]
    fn test_push_opaque_sequence_and_mapping() {
        let lua = Lua::open();
        let seq = Value::array(vec![Value::Int(1), Value::Int(2)]);
        lua.push_value(&seq);
        assert!(lua.is_object(-1));
        assert_eq!(lua.to_value(-1), seq);

        let map = Value::map(map_of(&[("title", Value::from("OK"))]));
        lua.push_value(&map);
        assert!(lua.is_object(-1));
        assert_eq!(lua.to_value(-1), map);
    }

    #[test]
    fn test_object_identity_allocates_distinct_handles() {
        struct Unit;
        impl crate::value::DynamicAccess for Unit {
            fn get(&self, _key: &str) -> Value {
                Value::Nil
            }
            fn set(&mut self, _key: &str, _value: Value) {}
        }
        impl crate::value::HostObject for Unit {}

        let lua = Lua::open();
        let obj = Value::Object(Object::new(Unit));
        lua.push_value(&obj);
        lua.push_value(&obj);

        let a = lua.to_handle(-1).unwrap();
        let b = lua.to_handle(-2).unwrap();
        assert_ne!(a, b);
        assert_eq!(lua.object_count(), 2);
        assert_eq!(lua.to_value(-1), obj);
        assert_eq!(lua.to_value(-2), obj);
    }

    #[test]
    fn test_function_pushes_native_function() {
        let lua = Lua::open();
        let f = Value::Function(Function::new(|_| 0));
        lua.push_value(&f);
        assert!(lua.is_function(-1));
        assert_eq!(lua.object_count(), 1);
        assert_eq!(lua.to_value(-1), f);
        assert_eq!(lua.get_top(), 1);
    }

    #[test]
    fn test_function_decoded_deep_in_nested_tables() {
        let lua = Lua::open();
        lua.push_value(&Value::Function(Function::new(|_| 0)));
        lua.set_global("f");
        let results = lua
            .exec("local t = {f} for _ = 1, 100 do t = {t} end return t")
            .unwrap();

        let mut value = results[0].clone();
        for _ in 0..100 {
            let inner = value.as_array().and_then(|items| items.first().cloned());
            value = inner.unwrap_or(Value::Nil);
        }
        let leaf = value.as_array().and_then(|items| items.first().cloned());
        assert!(leaf.is_some_and(|f| f.is_callable()));
        assert_eq!(lua.get_top(), 0);
    }

    #[test]
    fn test_classify_rules() {
        let seq = classify(vec![
            (Value::Int(2), Value::from("b")),
            (Value::Int(1), Value::from("a")),
        ]);
        assert_eq!(seq, Value::array(vec![Value::from("a"), Value::from("b")]));

        let gap = classify(vec![(Value::Int(1), Value::Int(1)), (Value::Int(3), Value::Int(3))]);
        assert!(matches!(gap, Value::Map(_)));

        let zero = classify(vec![(Value::Int(0), Value::Int(0))]);
        assert!(matches!(zero, Value::Map(_)));

        assert_eq!(classify(Vec::new()), Value::map(Map::new()));
    }
}
