//! Loading and calling script code.

use std::ffi::CString;
use std::path::Path;

use mlua_sys as ffi;

use super::{MULTRET, State, Status};
use crate::error::{BridgeError, Result};
use crate::value::Value;

/// A chunk name the native loader accepts. Interior NULs are dropped.
fn chunk_name(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}

impl State {
    /// Compile `code` and push the resulting function.
    ///
    /// On failure the error text is pushed instead.
    pub fn load_string(&self, code: &str) -> Status {
        self.load_buffer(code.as_bytes(), code)
    }

    /// Compile a source (or precompiled) buffer under a chunk name.
    ///
    /// The name shows up in error messages; prefix it with `@` for a file
    /// name or `=` for a verbatim label.
    pub fn load_buffer(&self, source: &[u8], name: &str) -> Status {
        let name = chunk_name(name);
        let code = unsafe {
            ffi::luaL_loadbufferx(
                self.raw(),
                source.as_ptr() as *const _,
                source.len(),
                name.as_ptr(),
                std::ptr::null(),
            )
        };
        Status::from_code(code)
    }

    /// Compile a file and push the resulting function.
    ///
    /// If the file cannot be read, pushes a message and returns
    /// [`Status::ErrFile`].
    pub fn load_file(&self, path: impl AsRef<Path>) -> Status {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(source) => self.load_buffer(&source, &format!("@{}", path.display())),
            Err(e) => {
                self.push_string(&format!("cannot open {}: {}", path.display(), e));
                Status::ErrFile
            }
        }
    }

    /// Call the function below `nargs` arguments in protected mode.
    ///
    /// Function and arguments are popped; `nresults` results are pushed
    /// ([`MULTRET`] keeps all). On failure the error text is pushed instead.
    pub fn call(&self, nargs: i32, nresults: i32) -> Status {
        Status::from_code(unsafe { ffi::lua_pcall(self.raw(), nargs, nresults, 0) })
    }

    /// Pop the error value on top of the stack and return its text.
    pub fn pop_error(&self) -> String {
        let message = self
            .to_text(-1)
            .unwrap_or_else(|| format!("(error object is a {} value)", self.type_at(-1).name()));
        self.pop(1);
        message
    }

    /// Load and run `code`, returning every result it produced.
    ///
    /// The stack is left as it was found.
    pub fn exec(&self, code: &str) -> Result<Vec<Value>> {
        let status = self.load_string(code);
        self.run_loaded(status)
    }

    /// Load and run a script file, returning every result it produced.
    pub fn exec_file(&self, path: impl AsRef<Path>) -> Result<Vec<Value>> {
        let path = path.as_ref();
        let source = std::fs::read(path).map_err(|source| BridgeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let status = self.load_buffer(&source, &format!("@{}", path.display()));
        self.run_loaded(status)
    }

    fn run_loaded(&self, status: Status) -> Result<Vec<Value>> {
        if status.is_err() {
            return Err(self.runtime_error(status));
        }
        // The loaded function sits on top; everything below it stays.
        let base = self.get_top() - 1;
        let status = self.call(0, MULTRET);
        if status.is_err() {
            return Err(self.runtime_error(status));
        }

        let results = (base + 1..=self.get_top())
            .map(|index| self.to_value(index))
            .collect();
        self.set_top(base);
        Ok(results)
    }

    fn runtime_error(&self, status: Status) -> BridgeError {
        BridgeError::Runtime {
            status,
            message: self.pop_error(),
        }
    }
}
