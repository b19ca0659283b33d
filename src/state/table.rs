//! Composite values, globals and reference pinning.

use mlua_sys as ffi;

use super::{Kind, REGISTRY_INDEX, State};

/// Registry slot holding the main thread.
pub(crate) const MAIN_THREAD_SLOT: ffi::lua_Integer = 1;
/// Registry slot holding the globals table.
const GLOBALS_SLOT: ffi::lua_Integer = 2;

impl State {
    /// Push a new empty table.
    pub fn new_table(&self) {
        self.create_table(0, 0);
    }

    /// Push a new table with preallocated array and hash parts.
    pub fn create_table(&self, narr: i32, nrec: i32) {
        unsafe { ffi::lua_createtable(self.raw(), narr.max(0), nrec.max(0)) }
    }

    /// Pop a key and push `t[key]` for the table at `index`, without
    /// metamethods. Returns the type of the pushed value.
    pub fn raw_get(&self, index: i32) -> Kind {
        Kind::from_code(unsafe { ffi::lua_rawget(self.raw(), index) })
    }

    /// Pop a key and a value (value on top) and assign `t[key] = value`
    /// for the table at `index`, without metamethods.
    pub fn raw_set(&self, index: i32) {
        unsafe { ffi::lua_rawset(self.raw(), index) }
    }

    /// Push `t[n]` for the table at `index`. Returns the type pushed.
    pub fn raw_get_index(&self, index: i32, n: i64) -> Kind {
        Kind::from_code(unsafe { ffi::lua_rawgeti(self.raw(), index, n) })
    }

    /// Pop a value and assign `t[n] = value` for the table at `index`.
    pub fn raw_set_index(&self, index: i32, n: i64) {
        unsafe { ffi::lua_rawseti(self.raw(), index, n) }
    }

    /// Table traversal step.
    ///
    /// Pops a key and pushes the next key/value pair of the table at `index`,
    /// returning true; returns false (pushing nothing) when the traversal is
    /// done. Start with a nil key.
    pub fn next(&self, index: i32) -> bool {
        unsafe { ffi::lua_next(self.raw(), index) != 0 }
    }

    /// Pop a table (or nil) and make it the metatable of the value at
    /// `index`.
    pub fn set_metatable(&self, index: i32) {
        unsafe {
            ffi::lua_setmetatable(self.raw(), index);
        }
    }

    /// Pop a value and assign it to the global `name`.
    pub fn set_global(&self, name: &str) {
        let l = self.raw();
        unsafe {
            ffi::lua_rawgeti(l, REGISTRY_INDEX, GLOBALS_SLOT); // v G
            self.push_string(name); // v G k
            ffi::lua_rotate(l, -3, -1); // G k v
            ffi::lua_settable(l, -3);
        }
        self.pop(1);
    }

    /// Push the value of the global `name`. Returns its type.
    pub fn get_global(&self, name: &str) -> Kind {
        let l = self.raw();
        let kind = unsafe {
            ffi::lua_rawgeti(l, REGISTRY_INDEX, GLOBALS_SLOT);
            self.push_string(name);
            ffi::lua_gettable(l, -2)
        };
        unsafe { ffi::lua_rotate(l, -2, 1) }; // v G
        self.pop(1);
        Kind::from_code(kind)
    }

    /// Pin the value on top of the stack in the table at `index` (usually
    /// [`REGISTRY_INDEX`]), popping it. Returns the reference, [`REF_NIL`]
    /// for nil.
    ///
    /// [`REF_NIL`]: super::REF_NIL
    pub fn reference(&self, index: i32) -> i32 {
        unsafe { ffi::luaL_ref(self.raw(), index) }
    }

    /// Release a reference obtained from [`reference`](State::reference).
    pub fn unreference(&self, index: i32, reference: i32) {
        unsafe { ffi::luaL_unref(self.raw(), index, reference) }
    }
}
