//! The runtime state wrapper.
//!
//! [`Lua`] owns one native runtime instance together with the private
//! registry of host values allocated through it. It dereferences to
//! [`State`], the stack-level API that host functions also receive when
//! script calls back into the host.
//!
//! # Safety
//!
//! A runtime instance is single-threaded: neither `Lua` nor `State` is
//! `Send`, and host code must not smuggle the raw instance to another thread.

mod load;
mod stack;
mod table;

pub(crate) use table::MAIN_THREAD_SLOT;

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::rc::Rc;

use libc::c_int;
use mlua_sys as ffi;

use crate::registry::{Handle, Registry};
use crate::trampoline;
use crate::value::Value;

/// Pass as `nresults` to [`State::call`] to keep every result.
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// Pseudo-index of the runtime's registry table, for [`State::reference`].
pub const REGISTRY_INDEX: i32 = ffi::LUA_REGISTRYINDEX;

/// Reference value meaning "no reference".
pub const NO_REF: i32 = -2;

/// Reference value handed out when pinning nil.
pub const REF_NIL: i32 = -1;

/// Status codes returned by load and call.
///
/// These map one-to-one onto the native status integers; `Ok` is 0.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation succeeded
    Ok = 0,
    /// Coroutine yielded
    Yield = 1,
    /// Runtime error during execution
    ErrRun = 2,
    /// Syntax error while compiling
    ErrSyntax = 3,
    /// Out of memory
    ErrMem = 4,
    /// Error while running the message handler
    ErrErr = 5,
    /// Source file could not be read
    ErrFile = 6,
}

impl Status {
    pub fn from_code(code: c_int) -> Status {
        match code {
            0 => Status::Ok,
            1 => Status::Yield,
            2 => Status::ErrRun,
            3 => Status::ErrSyntax,
            4 => Status::ErrMem,
            6 => Status::ErrFile,
            _ => Status::ErrErr,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn is_err(self) -> bool {
        self != Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::Yield => "yield",
            Status::ErrRun => "runtime error",
            Status::ErrSyntax => "syntax error",
            Status::ErrMem => "out of memory",
            Status::ErrErr => "error in error handler",
            Status::ErrFile => "file error",
        };
        f.write_str(text)
    }
}

/// Native type of a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Index does not refer to a valid slot
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl Kind {
    pub(crate) fn from_code(code: c_int) -> Kind {
        match code {
            ffi::LUA_TNIL => Kind::Nil,
            ffi::LUA_TBOOLEAN => Kind::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Kind::LightUserdata,
            ffi::LUA_TNUMBER => Kind::Number,
            ffi::LUA_TSTRING => Kind::String,
            ffi::LUA_TTABLE => Kind::Table,
            ffi::LUA_TFUNCTION => Kind::Function,
            ffi::LUA_TUSERDATA => Kind::Userdata,
            ffi::LUA_TTHREAD => Kind::Thread,
            _ => Kind::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::None => "no value",
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::LightUserdata | Kind::Userdata => "userdata",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Thread => "thread",
        }
    }
}

/// Stack-level access to one runtime instance.
///
/// Indices follow the native convention: `1..=get_top()` counts from the
/// bottom, `-1` is the top.
pub struct State {
    raw: NonNull<ffi::lua_State>,
    objects: Rc<RefCell<Registry<Value>>>,
}

impl State {
    /// A view of the same instance running on another native thread
    /// (a coroutine), sharing this state's registry.
    pub(crate) fn thread_view(&self, raw: NonNull<ffi::lua_State>) -> State {
        State {
            raw,
            objects: Rc::clone(&self.objects),
        }
    }

    pub(crate) fn raw(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    /// The native handle of this instance (or coroutine thread).
    pub fn handle(&self) -> Handle {
        Handle::from_ptr(self.raw.as_ptr())
    }

    pub(crate) fn objects(&self) -> &RefCell<Registry<Value>> {
        &self.objects
    }

    /// Number of live host values allocated through this instance.
    pub fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }

    /// Open the standard libraries.
    pub fn open_libs(&self) {
        unsafe { ffi::luaL_openlibs(self.raw()) }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("handle", &self.handle())
            .field("objects", &self.object_count())
            .finish()
    }
}

/// Owner of a runtime instance.
///
/// Created by [`Lua::open`]; the instance is closed exactly once, when the
/// owner is dropped or passed to [`Lua::close`].
pub struct Lua {
    state: NonNull<State>,
}

impl Lua {
    /// Create a runtime instance and register it for callbacks.
    ///
    /// Aborts the process if the native allocator cannot create an instance.
    pub fn open() -> Lua {
        let raw = unsafe { ffi::luaL_newstate() };
        let Some(raw) = NonNull::new(raw) else {
            log::error!("cannot allocate a runtime instance");
            std::process::abort();
        };

        let state = Box::new(State {
            raw,
            objects: Rc::new(RefCell::new(Registry::new())),
        });
        let state = NonNull::from(Box::leak(state));
        trampoline::register(state);
        log::trace!("opened runtime {:?}", Handle::from_ptr(raw.as_ptr()));
        Lua { state }
    }

    /// Create a runtime instance with the standard libraries opened.
    pub fn with_libs() -> Lua {
        let lua = Lua::open();
        lua.open_libs();
        lua
    }

    /// Close the instance. Same as dropping the owner.
    pub fn close(self) {}
}

impl Deref for Lua {
    type Target = State;

    fn deref(&self) -> &State {
        // The box is only reclaimed in `drop`.
        unsafe { self.state.as_ref() }
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        let handle = self.handle();
        unsafe {
            // Finalizers run inside lua_close and still need the lookup entry.
            ffi::lua_close(self.raw());
            trampoline::unregister(handle);
            drop(Box::from_raw(self.state.as_ptr()));
        }
        log::trace!("closed runtime {:?}", handle);
    }
}

impl fmt::Debug for Lua {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lua").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trampoline::is_registered;

    #[test]
    fn test_status_codes() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_err());
        assert!(Status::ErrRun.is_err());
        assert_eq!(Status::from_code(0), Status::Ok);
        assert_eq!(Status::from_code(3), Status::ErrSyntax);
        assert_eq!(Status::ErrFile.code(), 6);
    }

    #[test]
    fn test_open_close() {
        let lua = Lua::open();
        let handle = lua.handle();
        assert!(is_registered(handle));
        assert_eq!(lua.get_top(), 0);
        assert_eq!(lua.object_count(), 0);

        lua.close();
        assert!(!is_registered(handle));
    }

    #[test]
    fn test_drop_deregisters() {
        let handle = {
            let lua = Lua::with_libs();
            lua.handle()
        };
        assert!(!is_registered(handle));
    }

    #[test]
    fn test_independent_instances() {
        let a = Lua::open();
        let b = Lua::open();
        assert_ne!(a.handle(), b.handle());

        a.push_integer(1);
        assert_eq!(a.get_top(), 1);
        assert_eq!(b.get_top(), 0);
    }
}
