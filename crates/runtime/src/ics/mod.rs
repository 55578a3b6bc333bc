//! Inline-cache bookkeeping: per-patchpoint slot management, invalidation,
//! patchpoint initialization, and standalone runtime-IC trampolines.

pub mod icinfo;
pub mod invalidator;
pub mod patchpoint;
pub mod runtime_ics;

pub use icinfo::{
    clear_all_ics, get_ic_info, register_compiled_patchpoint, CallingConv, CommitOutcome,
    DecrefInfo, ICHandle, ICInfo, ICSlot, ICSlotRewrite, StackInfo, IC_INVALIDATION_HEADER_SIZE,
    IC_MEGAMORPHIC_THRESHOLD,
};
pub use invalidator::ICInvalidator;
pub use patchpoint::{
    initialize_patchpoint, set_slowpath_func, take_ic_return_addr, PatchpointInfo,
    PatchpointInitializationInfo, INITIAL_CALL_SIZE,
};
pub use runtime_ics::{RuntimeIC, RuntimeICCache};
