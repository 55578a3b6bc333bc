//! Error model.
//!
//! Two layers, kept strictly apart:
//!
//! * [`RuntimeError`] — infrastructure failures inside the IC machinery
//!   itself (out of code memory, bad patchpoint geometry). These are Rust
//!   errors and never visible to Python code.
//! * [`ExcInfo`] — a Python-level exception (type + message). Every
//!   dispatch entry point exists in two flavors: the `Result`-returning
//!   surface used by Rust callers, and the CAPI surface that returns a
//!   null pointer and parks the exception in a thread-local pending slot,
//!   which is what emitted fast paths and trampolines use.

use std::cell::RefCell;

use crate::objects::PyClass;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("out of executable code memory")]
    OutOfCodeMemory,
    #[error("patchpoint region too small: need {needed} bytes, have {have}")]
    PatchpointTooSmall { needed: usize, have: usize },
    #[error("invalid patchpoint geometry: {0}")]
    BadPatchpoint(&'static str),
}

/// A Python-level exception in flight.
///
/// Exception *types* are class pointers so tests and callers can match on
/// them; the payload is a rendered message, which is all this subsystem
/// ever needs (argument formatting happens at raise time, as in the
/// reference implementation's `raiseExcHelper`).
#[derive(Debug, Clone)]
pub struct ExcInfo {
    pub exc_type: *mut PyClass,
    pub message: String,
}

impl ExcInfo {
    pub fn new(exc_type: *mut PyClass, message: impl Into<String>) -> ExcInfo {
        ExcInfo {
            exc_type,
            message: message.into(),
        }
    }
}

/// Result alias for the CXX-flavored entry points.
pub type PyResult<T> = Result<T, ExcInfo>;

thread_local! {
    static PENDING_EXC: RefCell<Option<ExcInfo>> = const { RefCell::new(None) };
}

/// Park `exc` as the thread's pending exception (CAPI convention).
pub fn set_pending_exc(exc: ExcInfo) {
    PENDING_EXC.with(|slot| *slot.borrow_mut() = Some(exc));
}

/// Take and clear the pending exception, if any.
pub fn take_pending_exc() -> Option<ExcInfo> {
    PENDING_EXC.with(|slot| slot.borrow_mut().take())
}

/// True if an exception is pending on this thread.
pub fn exc_occurred() -> bool {
    PENDING_EXC.with(|slot| slot.borrow().is_some())
}

/// Convert a CAPI-style null return into the CXX flavor.
///
/// Callers use this at the boundary: a null `ptr` means the callee parked
/// an exception, which we pick up and return as `Err`.
pub fn to_result<T>(ptr: *mut T) -> PyResult<*mut T> {
    if ptr.is_null() {
        Err(take_pending_exc().expect("null return without a pending exception"))
    } else {
        Ok(ptr)
    }
}

/// Convert a CXX-style result into the CAPI flavor.
pub fn to_capi<T>(res: PyResult<*mut T>) -> *mut T {
    match res {
        Ok(p) => p,
        Err(exc) => {
            set_pending_exc(exc);
            std::ptr::null_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_exc_round_trip() {
        assert!(!exc_occurred());
        set_pending_exc(ExcInfo::new(std::ptr::null_mut(), "boom"));
        assert!(exc_occurred());
        let e = take_pending_exc().unwrap();
        assert_eq!(e.message, "boom");
        assert!(!exc_occurred());
    }
}
