//! Native callback entry points.
//!
//! The runtime calls back into the host with nothing but its own instance
//! pointer. [`LIVE_STATES`] maps that pointer back to the owning [`State`]:
//! entries are added by [`Lua::open`] and removed by its drop, after the
//! native instance has been closed. Every entry point starts with that
//! lookup and does nothing if it misses, which is the defined behavior for
//! callbacks that race with teardown.
//!
//! None of the entry points can report failure through the native calling
//! convention, so an unexpected stack shape or a registry miss yields "no
//! results" and a panic in host code is caught here and logged.
//!
//! [`Lua::open`]: crate::state::Lua::open

use std::ffi::CStr;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::LazyLock;

use libc::c_int;
use mlua_sys as ffi;

use crate::registry::{Handle, SyncRegistry};
use crate::state::{MAIN_THREAD_SLOT, REGISTRY_INDEX, State};
use crate::value::{DynamicAccess, Value};

/// Back-reference to a live state. Never owns it.
#[derive(Clone, Copy)]
struct StateRef(NonNull<State>);

// Only dereferenced on the thread driving the instance, from inside a
// callback that instance itself issued.
unsafe impl Send for StateRef {}

/// Process-wide table of live runtime instances, keyed by instance handle.
static LIVE_STATES: LazyLock<SyncRegistry<StateRef>> = LazyLock::new(SyncRegistry::new);

/// Name of the shared metatable for host userdata.
const METATABLE: &CStr = c"luabridge.object";

pub(crate) fn register(state: NonNull<State>) {
    let handle = unsafe { state.as_ref() }.handle();
    LIVE_STATES.set(handle, StateRef(state));
}

pub(crate) fn unregister(handle: Handle) {
    LIVE_STATES.remove(handle);
}

/// Whether callbacks for this instance handle still reach a host state.
pub fn is_registered(handle: Handle) -> bool {
    LIVE_STATES.contains(handle)
}

/// Number of open runtime instances in the process.
pub fn live_count() -> usize {
    LIVE_STATES.len()
}

/// Find the host state for a callback.
///
/// Coroutines run on their own native thread, which is not registered; they
/// are resolved through the instance's main thread and get a view onto their
/// own stack.
fn resolve(l: *mut ffi::lua_State) -> Option<State> {
    let raw = NonNull::new(l)?;
    if let Some(owner) = LIVE_STATES.get(Handle::from_ptr(l)) {
        return Some(unsafe { owner.0.as_ref() }.thread_view(raw));
    }

    let main = unsafe {
        ffi::lua_rawgeti(l, REGISTRY_INDEX, MAIN_THREAD_SLOT);
        let main = ffi::lua_tothread(l, -1);
        ffi::lua_settop(l, -2);
        main
    };
    if main.is_null() || main == l {
        return None;
    }
    let owner = LIVE_STATES.get(Handle::from_ptr(main))?;
    Some(unsafe { owner.0.as_ref() }.thread_view(raw))
}

/// Run host code, turning a panic into `fallback`.
fn guarded<T>(what: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            log::error!("host {} panicked; returning no results", what);
            fallback
        }
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Push a userdata carrying `value` and record it in the state's registry.
fn push_userdata(state: &State, value: Value) -> Handle {
    let l = state.raw();
    let handle = unsafe {
        let block = ffi::lua_newuserdatauv(l, mem::size_of::<usize>(), 0);
        if ffi::luaL_newmetatable(l, METATABLE.as_ptr()) != 0 {
            ffi::lua_pushcfunction(l, finalize);
            ffi::lua_setfield(l, -2, c"__gc".as_ptr());
            ffi::lua_pushcfunction(l, property_get);
            ffi::lua_setfield(l, -2, c"__index".as_ptr());
            ffi::lua_pushcfunction(l, property_set);
            ffi::lua_setfield(l, -2, c"__newindex".as_ptr());
        }
        ffi::lua_setmetatable(l, -2);
        Handle::from_ptr(block)
    };
    state.objects().borrow_mut().set(handle, value);
    handle
}

/// Push `value` as an opaque object.
pub(crate) fn push_object(state: &State, value: Value) -> Handle {
    push_userdata(state, value)
}

/// Push `value` as a script function. The userdata holding the handle is
/// the closure's only upvalue.
pub(crate) fn push_function(state: &State, value: Value) -> Handle {
    let handle = push_userdata(state, value);
    unsafe { ffi::lua_pushcclosure(state.raw(), invoke, 1) };
    handle
}

// =============================================================================
// Entry Points
// =============================================================================

/// `__gc`: the runtime reclaimed a host userdata (slot 1).
pub(crate) unsafe extern "C-unwind" fn finalize(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = resolve(l) else {
        log::debug!("finalize: no live state for {:?}", Handle::from_ptr(l));
        return 0;
    };
    if state.get_top() < 1 {
        return 0;
    }
    let Some(handle) = state.to_handle(1) else {
        return 0;
    };

    // Bind the removed value so host destructors run after the borrow ends.
    let removed = match state.objects().try_borrow_mut() {
        Ok(mut objects) => objects.remove(handle),
        Err(_) => {
            log::error!("finalize: registry busy, leaking {:?}", handle);
            None
        }
    };
    guarded("destructor", (), || drop(removed));
    0
}

/// Closure body for pushed functions: dispatch to the host value named by
/// upvalue 1.
pub(crate) unsafe extern "C-unwind" fn invoke(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = resolve(l) else {
        log::debug!("invoke: no live state for {:?}", Handle::from_ptr(l));
        return 0;
    };
    let Some(handle) = state.to_handle(ffi::lua_upvalueindex(1)) else {
        return 0;
    };
    let target = match state.objects().try_borrow() {
        Ok(objects) => objects.get(handle).cloned(),
        Err(_) => None,
    };

    let count = guarded("function", 0, || match target {
        Some(Value::Function(f)) => f.call(&state),
        Some(Value::Object(obj)) => obj.call(&state).unwrap_or(0),
        _ => 0,
    });
    // Never claim more results than the stack holds.
    count.clamp(0, state.get_top())
}

/// `__index`: `object.key` from script.
pub(crate) unsafe extern "C-unwind" fn property_get(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = resolve(l) else {
        log::debug!("property get: no live state for {:?}", Handle::from_ptr(l));
        return 0;
    };
    let Some((handle, key)) = target_and_key(&state) else {
        return 0;
    };
    let target = match state.objects().try_borrow() {
        Ok(objects) => objects.get(handle).cloned(),
        Err(_) => None,
    };
    let Some(target) = target else {
        return 0;
    };

    let value = guarded("field read", Value::Nil, || target.get(&key));
    state.push_value(&value);
    1
}

/// `__newindex`: `object.key = value` from script. A missing value slot
/// means nil.
pub(crate) unsafe extern "C-unwind" fn property_set(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = resolve(l) else {
        log::debug!("property set: no live state for {:?}", Handle::from_ptr(l));
        return 0;
    };
    let Some((handle, key)) = target_and_key(&state) else {
        return 0;
    };
    let value = if state.get_top() > 2 {
        state.to_value(3)
    } else {
        Value::Nil
    };

    let target = match state.objects().try_borrow() {
        Ok(objects) => objects.get(handle).cloned(),
        Err(_) => None,
    };
    let Some(mut target) = target else {
        return 0;
    };
    // Composites and objects share storage with every other handle to them.
    guarded("field write", (), || target.set(&key, value));
    0
}

/// Slots 1 and 2 of a field access: a host userdata and a text key.
fn target_and_key(state: &State) -> Option<(Handle, String)> {
    if state.get_top() < 2 || !state.is_string(2) {
        return None;
    }
    let handle = state.to_handle(1)?;
    let key = state.to_text(2)?;
    Some((handle, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lua;
    use crate::value::{Function, HostObject, Invoke, Key, Map, Object};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    struct Point {
        x: i64,
        y: i64,
    }

    impl DynamicAccess for Point {
        fn get(&self, key: &str) -> Value {
            match key {
                "x" => Value::Int(self.x),
                "y" => Value::Int(self.y),
                _ => Value::Nil,
            }
        }

        fn set(&mut self, key: &str, value: Value) {
            let n = value.as_int().unwrap_or(0);
            match key {
                "x" => self.x = n,
                "y" => self.y = n,
                _ => {}
            }
        }
    }

    impl HostObject for Point {}

    struct Counter {
        calls: Cell<i64>,
    }

    impl DynamicAccess for Counter {
        fn get(&self, key: &str) -> Value {
            match key {
                "calls" => Value::Int(self.calls.get()),
                _ => Value::Nil,
            }
        }

        fn set(&mut self, _key: &str, _value: Value) {}
    }

    impl Invoke for Counter {
        fn call(&self, state: &State) -> i32 {
            self.calls.set(self.calls.get() + 1);
            state.push_integer(self.calls.get());
            1
        }
    }

    impl HostObject for Counter {
        fn as_invoke(&self) -> Option<&dyn Invoke> {
            Some(self)
        }
    }

    fn data_map() -> Value {
        let mut map = Map::new();
        map.insert(Key::from("title"), Value::from("OK"));
        Value::map(map)
    }

    #[test]
    fn test_unregistered_state_is_ignored() {
        unsafe {
            let l = ffi::luaL_newstate();
            ffi::lua_newuserdatauv(l, 8, 0);
            ffi::lua_pushlstring(l, c"key".as_ptr(), 3);
            ffi::lua_pushinteger(l, 1);

            assert!(!is_registered(Handle::from_ptr(l)));
            assert_eq!(finalize(l), 0);
            assert_eq!(invoke(l), 0);
            assert_eq!(property_get(l), 0);
            assert_eq!(property_set(l), 0);
            assert_eq!(ffi::lua_gettop(l), 3);

            ffi::lua_close(l);
        }
    }

    #[test]
    fn test_closed_state_is_ignored() {
        let lua = Lua::open();
        let handle = lua.handle();
        assert!(is_registered(handle));
        lua.close();
        assert!(!is_registered(handle));
        assert!(LIVE_STATES.get(handle).is_none());
    }

    #[test]
    fn test_wrong_stack_shape_is_ignored() {
        let lua = Lua::open();
        let l = lua.raw();
        unsafe {
            assert_eq!(property_get(l), 0);
            lua.push_integer(1);
            lua.push_string("key");
            assert_eq!(property_get(l), 0);
            assert_eq!(property_set(l), 0);
            assert_eq!(finalize(l), 0);
        }
        assert_eq!(lua.get_top(), 2);
    }

    #[test]
    fn test_call_dispatch_receives_arguments() {
        let lua = Lua::open();
        let seen: Rc<RefCell<Vec<Value>>> = Rc::default();
        let depth = Rc::new(Cell::new(0));

        let (seen_in, depth_in) = (seen.clone(), depth.clone());
        lua.push_function(move |s| {
            depth_in.set(s.get_top());
            for i in 1..=s.get_top() {
                seen_in.borrow_mut().push(s.to_value(i));
            }
            s.push_integer(s.to_integer(1) + s.to_integer(2));
            1
        });
        lua.set_global("add");

        let results = lua.exec("return add(1, 2)").unwrap();
        assert_eq!(depth.get(), 2);
        assert_eq!(*seen.borrow(), vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(results, vec![Value::Int(3)]);
    }

    #[test]
    fn test_result_count_matches_pushed_values() {
        let lua = Lua::open();
        lua.push_function(|s| {
            s.push_integer(1);
            s.push_string("two");
            s.push_boolean(false);
            3
        });
        lua.set_global("triple");

        let results = lua.exec("return triple()").unwrap();
        assert_eq!(
            results,
            vec![Value::Int(1), Value::from("two"), Value::Bool(false)]
        );
    }

    #[test]
    fn test_overclaimed_results_are_clamped() {
        let lua = Lua::open();
        lua.push_function(|_| 10);
        lua.set_global("liar");
        assert_eq!(lua.exec("return liar()").unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_callable_object() {
        let lua = Lua::open();
        let counter = Rc::new(RefCell::new(Counter { calls: Cell::new(0) }));
        lua.push_value(&Value::Object(Object::from_rc(counter.clone())));
        assert!(lua.is_function(-1));
        lua.set_global("tick");

        let results = lua.exec("tick(); tick(); return tick()").unwrap();
        assert_eq!(results, vec![Value::Int(3)]);
        assert_eq!(counter.borrow().calls.get(), 3);
    }

    #[test]
    fn test_non_callable_value_dispatches_nothing() {
        let lua = Lua::open();
        // A function handle whose registry entry is plain data.
        push_function(&lua, Value::Int(5));
        lua.set_global("f");
        assert_eq!(lua.exec("return f(1)").unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn test_host_panic_is_contained() {
        let lua = Lua::open();
        lua.push_function(|_| panic!("host failure"));
        lua.set_global("boom");

        assert_eq!(lua.exec("return boom()").unwrap(), Vec::<Value>::new());
        assert_eq!(lua.exec("return 1").unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_property_get_and_set_on_data() {
        let lua = Lua::open();
        lua.push_value(&data_map());
        lua.set_global("data");

        let results = lua.exec("data.count = 5; return data.title, data.count").unwrap();
        assert_eq!(results, vec![Value::from("OK"), Value::Int(5)]);

        lua.get_global("data");
        let data = lua.to_value(-1);
        assert_eq!(data.get("count"), Value::Int(5));
        assert_eq!(data.get("title"), Value::from("OK"));
    }

    #[test]
    fn test_nested_write_is_shared() {
        let lua = Lua::open();
        let mut inner = Map::new();
        inner.insert(Key::from("v"), Value::Int(1));
        let mut outer = Map::new();
        outer.insert(Key::from("inner"), Value::map(inner));
        outer.insert(Key::from("list"), Value::array(vec![Value::Int(1)]));
        let data = Value::map(outer);
        lua.push_value(&data);
        lua.set_global("data");

        let results = lua
            .exec("data.inner.v = 99; data.list[2] = 'x'; return data.inner.v, data.list[2]")
            .unwrap();
        assert_eq!(results, vec![Value::Int(99), Value::from("x")]);

        assert_eq!(data.get("inner").get("v"), Value::Int(99));
        assert_eq!(
            data.get("list"),
            Value::array(vec![Value::Int(1), Value::from("x")])
        );
    }

    #[test]
    fn test_script_can_store_host_value_in_itself() {
        let lua = Lua::open();
        let data = data_map();
        lua.push_value(&data);
        lua.set_global("data");

        lua.exec("data.me = data").unwrap();
        assert_eq!(lua.exec("return data.me.me.title").unwrap(), vec![Value::from("OK")]);
        assert_eq!(data.to_string(), "{me: <cycle>, title: \"OK\"}");
        data.clone().set("me", Value::Nil);
    }

    #[test]
    fn test_property_access_on_host_object() {
        let lua = Lua::open();
        let point = Rc::new(RefCell::new(Point { x: 1, y: 2 }));
        lua.push_value(&Value::Object(Object::from_rc(point.clone())));
        lua.set_global("p");

        let results = lua.exec("p.x = p.x + 10; return p.x, p.y, p.z").unwrap();
        assert_eq!(results, vec![Value::Int(11), Value::Int(2), Value::Nil]);
        assert_eq!(point.borrow().x, 11);
    }

    #[test]
    fn test_property_set_with_omitted_value() {
        let lua = Lua::with_libs();
        lua.push_value(&data_map());
        lua.set_global("data");

        lua.exec("getmetatable(data).__newindex(data, 'title')").unwrap();
        assert_eq!(lua.exec("return data.title").unwrap(), vec![Value::Nil]);
    }

    #[test]
    fn test_function_field_is_callable_from_script() {
        let lua = Lua::open();
        let mut map = Map::new();
        map.insert(
            Key::from("onload"),
            Value::Function(Function::new(|s| {
                s.push_integer(s.get_top() as i64);
                1
            })),
        );
        lua.push_value(&Value::map(map));
        lua.set_global("data");

        assert_eq!(lua.exec("return data.onload(1, 2, 3)").unwrap(), vec![Value::Int(3)]);
    }

    #[test]
    fn test_finalizer_removes_handle() {
        let lua = Lua::with_libs();
        lua.push_value(&data_map());
        lua.set_global("data");
        lua.push_function(|_| 0);
        lua.set_global("f");
        assert_eq!(lua.object_count(), 2);

        lua.exec("collectgarbage()").unwrap();
        assert_eq!(lua.object_count(), 2);

        lua.exec("data = nil; f = nil; collectgarbage(); collectgarbage()").unwrap();
        assert_eq!(lua.object_count(), 0);
    }

    #[test]
    fn test_each_handle_is_finalized_independently() {
        let lua = Lua::with_libs();
        let point = Value::Object(Object::new(Point { x: 0, y: 0 }));
        lua.push_value(&point);
        lua.set_global("a");
        lua.push_value(&point);
        lua.set_global("b");
        assert_eq!(lua.object_count(), 2);

        lua.exec("a = nil; collectgarbage(); collectgarbage()").unwrap();
        assert_eq!(lua.object_count(), 1);
        assert_eq!(lua.exec("return b.x").unwrap(), vec![Value::Int(0)]);
    }

    #[test]
    fn test_coroutine_dispatch() {
        let lua = Lua::with_libs();
        lua.push_function(|s| {
            s.push_integer(s.to_integer(1) * 2);
            1
        });
        lua.set_global("double");

        let results = lua
            .exec("local co = coroutine.wrap(function(n) return double(n) end); return co(21)")
            .unwrap();
        assert_eq!(results, vec![Value::Int(42)]);
    }

    #[test]
    fn test_reentrant_exec_from_host_function() {
        let lua = Lua::open();
        lua.push_function(|s| match s.exec("return 40 + 2") {
            Ok(values) => {
                s.push_value(values.first().unwrap_or(&Value::Nil));
                1
            }
            Err(_) => 0,
        });
        lua.set_global("nested");
        assert_eq!(lua.exec("return nested()").unwrap(), vec![Value::Int(42)]);
    }

    #[test]
    fn test_live_count_tracks_instances() {
        let lua = Lua::open();
        assert!(live_count() >= 1);
        drop(lua);
    }
}
