//! Stack inspection, type tests and primitive conversions.
//!
//! Conversions follow the runtime's own coercion rules: numeric text
//! converts to numbers and numbers convert to text in place.

use std::ptr;

use libc::c_int;
use mlua_sys as ffi;

use super::{Kind, State};
use crate::registry::Handle;
use crate::value::float_to_int_exact;

impl State {
    // =========================================================================
    // Stack Manipulation
    // =========================================================================

    /// Get the current stack height.
    pub fn get_top(&self) -> i32 {
        unsafe { ffi::lua_gettop(self.raw()) }
    }

    /// Set the stack height, popping values or filling with nil.
    pub fn set_top(&self, index: i32) {
        unsafe { ffi::lua_settop(self.raw(), index) }
    }

    /// Pop `count` values.
    pub fn pop(&self, count: i32) {
        if count > 0 {
            self.set_top(-count - 1);
        }
    }

    /// Push a copy of the value at `index`.
    pub fn push_copy(&self, index: i32) {
        unsafe { ffi::lua_pushvalue(self.raw(), index) }
    }

    /// Convert a relative index into an absolute one.
    pub fn abs_index(&self, index: i32) -> i32 {
        unsafe { ffi::lua_absindex(self.raw(), index) }
    }

    /// Make room for `extra` more slots. Returns false if the stack cannot grow.
    pub fn check_stack(&self, extra: i32) -> bool {
        unsafe { ffi::lua_checkstack(self.raw(), extra) != 0 }
    }

    // =========================================================================
    // Type Checking
    // =========================================================================

    pub fn type_at(&self, index: i32) -> Kind {
        Kind::from_code(unsafe { ffi::lua_type(self.raw(), index) })
    }

    pub fn is_nil(&self, index: i32) -> bool {
        self.type_at(index) == Kind::Nil
    }

    /// True for numbers and for text convertible to a number.
    pub fn is_number(&self, index: i32) -> bool {
        unsafe { ffi::lua_isnumber(self.raw(), index) != 0 }
    }

    /// True if the slot is a number whose value is an exact 64-bit integer.
    pub fn is_integer(&self, index: i32) -> bool {
        if !self.is_number(index) {
            return false;
        }
        let native = unsafe { ffi::lua_isinteger(self.raw(), index) != 0 };
        native || float_to_int_exact(self.to_number(index)).is_some()
    }

    pub fn is_boolean(&self, index: i32) -> bool {
        self.type_at(index) == Kind::Boolean
    }

    /// True for text and for numbers (which convert to text).
    pub fn is_string(&self, index: i32) -> bool {
        unsafe { ffi::lua_isstring(self.raw(), index) != 0 }
    }

    /// True for full userdata, the carrier of host objects.
    pub fn is_object(&self, index: i32) -> bool {
        self.type_at(index) == Kind::Userdata
    }

    pub fn is_function(&self, index: i32) -> bool {
        self.type_at(index) == Kind::Function
    }

    pub fn is_table(&self, index: i32) -> bool {
        self.type_at(index) == Kind::Table
    }

    // =========================================================================
    // Conversion Functions
    // =========================================================================

    /// Integer value at `index`; 0 if the slot has no exact integer value.
    pub fn to_integer(&self, index: i32) -> i64 {
        unsafe { ffi::lua_tointegerx(self.raw(), index, ptr::null_mut()) }
    }

    /// Number value at `index`; 0.0 if not convertible.
    pub fn to_number(&self, index: i32) -> f64 {
        unsafe { ffi::lua_tonumberx(self.raw(), index, ptr::null_mut()) }
    }

    /// Truthiness of the value at `index`: only nil and false are false.
    pub fn to_boolean(&self, index: i32) -> bool {
        unsafe { ffi::lua_toboolean(self.raw(), index) != 0 }
    }

    /// Text at `index`, or `None` if the slot is neither text nor a number.
    ///
    /// A number slot is converted to text in place. Invalid UTF-8 is
    /// replaced, not rejected.
    pub fn to_text(&self, index: i32) -> Option<String> {
        let mut len: usize = 0;
        unsafe {
            let ptr = ffi::lua_tolstring(self.raw(), index, &mut len);
            if ptr.is_null() {
                return None;
            }
            let bytes = std::slice::from_raw_parts(ptr as *const u8, len);
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    /// Handle of the userdata at `index`.
    pub fn to_handle(&self, index: i32) -> Option<Handle> {
        if !self.is_object(index) {
            return None;
        }
        let ptr = unsafe { ffi::lua_touserdata(self.raw(), index) };
        if ptr.is_null() {
            None
        } else {
            Some(Handle::from_ptr(ptr))
        }
    }

    // =========================================================================
    // Push Functions
    // =========================================================================

    pub fn push_nil(&self) {
        unsafe { ffi::lua_pushnil(self.raw()) }
    }

    pub fn push_boolean(&self, value: bool) {
        unsafe { ffi::lua_pushboolean(self.raw(), value as c_int) }
    }

    pub fn push_integer(&self, value: i64) {
        unsafe { ffi::lua_pushinteger(self.raw(), value) }
    }

    pub fn push_number(&self, value: f64) {
        unsafe { ffi::lua_pushnumber(self.raw(), value) }
    }

    /// Push text. The bytes are copied; embedded NULs are kept.
    pub fn push_string(&self, value: &str) {
        self.push_bytes(value.as_bytes());
    }

    pub fn push_bytes(&self, value: &[u8]) {
        unsafe {
            ffi::lua_pushlstring(self.raw(), value.as_ptr() as *const _, value.len());
        }
    }
}
