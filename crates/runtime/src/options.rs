//! Process-wide runtime options.
//!
//! Options are read from the environment exactly once, on first use. They
//! exist so tests and debugging sessions can flip the expensive machinery
//! off without recompiling.

use lazy_static::lazy_static;

/// Parsed option set.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Master switch for inline caches. When false every call site runs the
    /// generic slow path and nothing is ever patched.
    pub enable_ics: bool,
    /// Master switch for the standalone runtime-IC trampolines.
    pub enable_runtime_ics: bool,
    /// Trace verbosity for the IC machinery (0 = quiet). Levels mirror the
    /// points at which the subsystem reports slot picks, commits and
    /// invalidations through `log::trace!`/`debug!`.
    pub verbosity: u32,
}

impl Options {
    fn from_env() -> Options {
        fn flag(name: &str, default: bool) -> bool {
            match std::env::var(name) {
                Ok(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
                Err(_) => default,
            }
        }

        Options {
            enable_ics: flag("QUICKENING_ICS", true),
            enable_runtime_ics: flag("QUICKENING_RUNTIME_ICS", true),
            verbosity: std::env::var("QUICKENING_VERBOSE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

lazy_static! {
    static ref OPTIONS: Options = Options::from_env();
}

pub fn get() -> &'static Options {
    &OPTIONS
}

pub fn ics_enabled() -> bool {
    OPTIONS.enable_ics
}

pub fn runtime_ics_enabled() -> bool {
    OPTIONS.enable_runtime_ics
}

pub fn verbosity() -> u32 {
    OPTIONS.verbosity
}
