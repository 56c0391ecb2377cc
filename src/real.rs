//! Lookup of the definitions an interposed entry point shadows.

use std::{
    ffi::{c_void, CStr},
    io::Write,
    ptr::NonNull,
};

use crate::{Error, Result};

/// Resolves the next definition of `symbol` after the calling object in
/// library search order.
pub fn resolve_next(symbol: &CStr) -> Result<NonNull<c_void>> {
    let ptr = unsafe {
        // clear any stale error
        libc::dlerror();
        libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr())
    };
    NonNull::new(ptr).ok_or_else(|| {
        let error = unsafe { libc::dlerror() };
        let reason = if error.is_null() {
            "resolved to null".to_string()
        } else {
            unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned()
        };
        Error::MissingSymbol {
            symbol: symbol.to_string_lossy().into_owned(),
            reason,
        }
    })
}

/// Like [`resolve_next`], but there is no way to go on without the real
/// implementation: the process aborts with a diagnostic.
pub fn require_next(symbol: &CStr) -> NonNull<c_void> {
    match resolve_next(symbol) {
        Ok(ptr) => ptr,
        Err(err) => {
            let _ = writeln!(std::io::stderr(), "object-track: {err}");
            std::process::abort()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_libc_symbol() {
        let symbol = CStr::from_bytes_with_nul(b"malloc\0").unwrap();
        assert!(resolve_next(symbol).is_ok());
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let symbol = CStr::from_bytes_with_nul(b"object_track_no_such_symbol\0").unwrap();
        match resolve_next(symbol) {
            Err(Error::MissingSymbol { symbol, .. }) => {
                assert_eq!(symbol, "object_track_no_such_symbol")
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
