//! Standalone runtime ICs: self-contained trampolines for hot generic
//! operations inside the built-in runtime (binop, nonzero, callattr, ...).
//!
//! Each trampoline is a 512-byte chunk holding a hand-written EH frame, a
//! tiny prologue (`sub rsp, 0x28`), a patchable region ending in the
//! slow-path call sequence, and an epilogue. The patchable region is a
//! regular one-slot IC driven by the ordinary slot manager and rewriter.
//! Chunks come from a pool of 4 KiB RWX pages carved into 512-byte pieces
//! with a free list.

use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::asm::{self, Assembler, Immediate};
use crate::error::RuntimeError;
use crate::ics::icinfo::{register_compiled_patchpoint, CallingConv, ICHandle, StackInfo};
use crate::ics::patchpoint::{initialize_patchpoint, INITIAL_CALL_SIZE};
use crate::mem::{alloc_code_region, deregister_eh_frame, register_eh_frame};
use crate::objects::PyObject;
use crate::options;
use crate::stats::StatCounter;

static NUM_RUNTIME_ICS: StatCounter = StatCounter::new("num_runtime_ics");

// The trampolines omit the frame pointer; the scratch area size shows up
// in both the prologue encoding and the DWARF CFA offset below.
const SCRATCH_BYTES: usize = 0x28;
const PROLOGUE_SIZE: usize = 4; // sub $0x28, %rsp
const EPILOGUE_SIZE: usize = 5; // add $0x28, %rsp; retq

// DWARF CIE+FDE for a frame that only adjusts rsp:
//   DW_CFA_def_cfa: rsp+8; DW_CFA_offset: rip at cfa-8
//   DW_CFA_advance_loc 4;  DW_CFA_def_cfa_offset 0x30
// The FDE's pc-begin (offset 0x20) and range (0x24) get patched per
// trampoline. The 0x30 byte is SCRATCH_BYTES + 8.
#[rustfmt::skip]
const EH_FRAME_TEMPLATE: [u8; 52] = [
    // CIE
    0x14, 0x00, 0x00, 0x00,             // CIE length
    0x00, 0x00, 0x00, 0x00,             // CIE marker
    0x03,                               // version
    0x7a, 0x52, 0x00,                   // augmentation "zR"
    0x01, 0x78, 0x10,                   // code align 1, data align -8, RA = 16
    0x01, 0x1b,                         // augmentation data: pcrel sdata4
    0x0c, 0x07, 0x08, 0x90, 0x01, 0x00, 0x00,
    // FDE
    0x14, 0x00, 0x00, 0x00,             // FDE length
    0x1c, 0x00, 0x00, 0x00,             // CIE offset
    0x00, 0x00, 0x00, 0x00,             // pc-begin (patched)
    0x00, 0x00, 0x00, 0x00,             // pc-range (patched)
    0x00,                               // augmentation length
    0x44, 0x0e, 0x30,                   // advance 4; def_cfa_offset 0x30
    0x00, 0x00, 0x00, 0x00,             // padding
    // terminator
    0x00, 0x00, 0x00, 0x00,
];

const EH_FRAME_SIZE: usize = EH_FRAME_TEMPLATE.len();
const EH_CIE_SIZE: usize = 24;

const CHUNK_SIZE: usize = 512;
const REGION_SIZE: usize = 4096;

lazy_static! {
    static ref FREE_CHUNKS: Mutex<Vec<usize>> = Mutex::new(Vec::new());
}

fn alloc_chunk() -> Result<*mut u8, RuntimeError> {
    let mut free = FREE_CHUNKS.lock().unwrap();
    if free.is_empty() {
        let region = alloc_code_region(REGION_SIZE)?;
        for i in 0..REGION_SIZE / CHUNK_SIZE {
            free.push(region as usize + i * CHUNK_SIZE);
        }
    }
    Ok(free.pop().unwrap() as *mut u8)
}

fn dealloc_chunk(chunk: *mut u8) {
    FREE_CHUNKS.lock().unwrap().push(chunk as usize);
}

fn write_trivial_eh_frame(eh_frame_addr: *mut u8, func_addr: *mut u8, func_size: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(EH_FRAME_TEMPLATE.as_ptr(), eh_frame_addr, EH_FRAME_SIZE);

        let offset_ptr = eh_frame_addr.add(0x20) as *mut i32;
        let size_ptr = eh_frame_addr.add(0x24) as *mut i32;

        let offset = func_addr as i64 - offset_ptr as i64;
        assert!((i32::MIN as i64..=i32::MAX as i64).contains(&offset));
        offset_ptr.write_unaligned(offset as i32);
        size_ptr.write_unaligned(func_size as i32);
    }
}

/// One standalone patchable call: EH frame + prologue + IC + epilogue.
pub struct RuntimeIC {
    /// Entry point (the prologue), not the chunk base.
    addr: *mut u8,
    icinfo: Option<ICHandle>,
    owns_chunk: bool,
}

impl RuntimeIC {
    /// Build a trampoline whose slow path is `func_addr`. With runtime
    /// ICs disabled this degrades to a plain function pointer.
    pub fn new(func_addr: usize) -> Result<RuntimeIC, RuntimeError> {
        NUM_RUNTIME_ICS.log();

        if !options::runtime_ics_enabled() {
            return Ok(RuntimeIC {
                addr: func_addr as *mut u8,
                icinfo: None,
                owns_chunk: false,
            });
        }

        assert!(SCRATCH_BYTES % 16 == 8, "call alignment depends on this");

        let total_code_size = CHUNK_SIZE - EH_FRAME_SIZE;
        let patchable_size = total_code_size - (PROLOGUE_SIZE + INITIAL_CALL_SIZE + EPILOGUE_SIZE);

        let chunk = alloc_chunk()?;
        let eh_frame_addr = chunk;
        let code = unsafe { chunk.add(EH_FRAME_SIZE) };

        let pp_start = unsafe { code.add(PROLOGUE_SIZE) };
        let pp_end = unsafe { pp_start.add(patchable_size + INITIAL_CALL_SIZE) };

        let init_info = unsafe {
            initialize_patchpoint(func_addr, pp_start, pp_end, 0, 0, Vec::new())?
        };
        assert_eq!(init_info.slowpath_start as usize, pp_start as usize + patchable_size);
        assert_eq!(init_info.slowpath_rtn_addr, pp_end);
        assert_eq!(init_info.continue_addr, pp_end);

        let icinfo = unsafe {
            register_compiled_patchpoint(
                pp_start,
                init_info.slowpath_start,
                pp_end,
                pp_end,
                patchable_size,
                CallingConv::C,
                StackInfo {
                    scratch_size: SCRATCH_BYTES,
                    scratch_rsp_offset: 0,
                },
                Vec::new(),
                true,
                Vec::new(),
            )
        };

        let mut prologue = unsafe { Assembler::new(code, PROLOGUE_SIZE) };
        prologue.sub_imm(Immediate(SCRATCH_BYTES as u64), asm::RSP);
        assert!(!prologue.has_failed() && prologue.is_exactly_full());

        let mut epilogue = unsafe { Assembler::new(pp_end, EPILOGUE_SIZE) };
        epilogue.add_imm(Immediate(SCRATCH_BYTES as u64), asm::RSP);
        epilogue.ret();
        assert!(!epilogue.has_failed() && epilogue.is_exactly_full());

        write_trivial_eh_frame(eh_frame_addr, code, total_code_size);
        register_eh_frame(eh_frame_addr, EH_CIE_SIZE);

        Ok(RuntimeIC {
            addr: code,
            icinfo: Some(icinfo),
            owns_chunk: true,
        })
    }

    pub fn entry(&self) -> *const u8 {
        self.addr
    }

    pub fn ic_handle(&self) -> Option<&ICHandle> {
        self.icinfo.as_ref()
    }
}

impl Drop for RuntimeIC {
    fn drop(&mut self) {
        if self.owns_chunk {
            // Clear slots (and release embedded references) before the
            // code goes back to the pool.
            self.icinfo.take();
            let eh_frame_addr = unsafe { self.addr.sub(EH_FRAME_SIZE) };
            deregister_eh_frame(eh_frame_addr, EH_CIE_SIZE);
            dealloc_chunk(eh_frame_addr);
        }
    }
}

// Typed fronts for the hot generic entry points.

pub struct BinopIC(RuntimeIC);

impl BinopIC {
    pub fn new() -> Result<BinopIC, RuntimeError> {
        Ok(BinopIC(RuntimeIC::new(
            crate::dispatch::binop::binop_capi as usize,
        )?))
    }

    pub fn call(&self, lhs: *mut PyObject, rhs: *mut PyObject, op: i32) -> *mut PyObject {
        let f: extern "C" fn(*mut PyObject, *mut PyObject, i32) -> *mut PyObject =
            unsafe { std::mem::transmute(self.0.addr) };
        f(lhs, rhs, op)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct AugbinopIC(RuntimeIC);

impl AugbinopIC {
    pub fn new() -> Result<AugbinopIC, RuntimeError> {
        Ok(AugbinopIC(RuntimeIC::new(
            crate::dispatch::binop::augbinop_capi as usize,
        )?))
    }

    pub fn call(&self, lhs: *mut PyObject, rhs: *mut PyObject, op: i32) -> *mut PyObject {
        let f: extern "C" fn(*mut PyObject, *mut PyObject, i32) -> *mut PyObject =
            unsafe { std::mem::transmute(self.0.addr) };
        f(lhs, rhs, op)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct NonzeroIC(RuntimeIC);

impl NonzeroIC {
    pub fn new() -> Result<NonzeroIC, RuntimeError> {
        Ok(NonzeroIC(RuntimeIC::new(
            crate::dispatch::len::nonzero_capi as usize,
        )?))
    }

    pub fn call(&self, obj: *mut PyObject) -> i64 {
        let f: extern "C" fn(*mut PyObject) -> i64 = unsafe { std::mem::transmute(self.0.addr) };
        f(obj)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct GetattrIC(RuntimeIC);

impl GetattrIC {
    pub fn new() -> Result<GetattrIC, RuntimeError> {
        Ok(GetattrIC(RuntimeIC::new(
            crate::dispatch::attr::getattr_capi as usize,
        )?))
    }

    pub fn call(&self, obj: *mut PyObject, attr: *mut crate::objects::PyStr) -> *mut PyObject {
        let f: extern "C" fn(*mut PyObject, *mut crate::objects::PyStr) -> *mut PyObject =
            unsafe { std::mem::transmute(self.0.addr) };
        f(obj, attr)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct SetattrIC(RuntimeIC);

impl SetattrIC {
    pub fn new() -> Result<SetattrIC, RuntimeError> {
        Ok(SetattrIC(RuntimeIC::new(
            crate::dispatch::attr::setattr_capi as usize,
        )?))
    }

    pub fn call(
        &self,
        obj: *mut PyObject,
        attr: *mut crate::objects::PyStr,
        val: *mut PyObject,
    ) -> i32 {
        let f: extern "C" fn(*mut PyObject, *mut crate::objects::PyStr, *mut PyObject) -> i32 =
            unsafe { std::mem::transmute(self.0.addr) };
        f(obj, attr, val)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct LenIC(RuntimeIC);

impl LenIC {
    pub fn new() -> Result<LenIC, RuntimeError> {
        Ok(LenIC(RuntimeIC::new(crate::dispatch::len::len_capi as usize)?))
    }

    pub fn call(&self, obj: *mut PyObject) -> *mut PyObject {
        let f: extern "C" fn(*mut PyObject) -> *mut PyObject =
            unsafe { std::mem::transmute(self.0.addr) };
        f(obj)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct GetitemIC(RuntimeIC);

impl GetitemIC {
    pub fn new() -> Result<GetitemIC, RuntimeError> {
        Ok(GetitemIC(RuntimeIC::new(
            crate::dispatch::item::getitem_capi as usize,
        )?))
    }

    pub fn call(&self, target: *mut PyObject, key: *mut PyObject) -> *mut PyObject {
        let f: extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject =
            unsafe { std::mem::transmute(self.0.addr) };
        f(target, key)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

pub struct CallattrIC(RuntimeIC);

impl CallattrIC {
    pub fn new() -> Result<CallattrIC, RuntimeError> {
        Ok(CallattrIC(RuntimeIC::new(
            crate::dispatch::call::callattr_capi as usize,
        )?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &self,
        obj: *mut PyObject,
        attr: *mut crate::objects::PyStr,
        flags: u64,
        arg1: *mut PyObject,
        arg2: *mut PyObject,
        arg3: *mut PyObject,
        args: *mut *mut PyObject,
        keyword_names: *const crate::dispatch::args::KeywordNames,
    ) -> *mut PyObject {
        let f: extern "C" fn(
            *mut PyObject,
            *mut crate::objects::PyStr,
            u64,
            *mut PyObject,
            *mut PyObject,
            *mut PyObject,
            *mut *mut PyObject,
            *const crate::dispatch::args::KeywordNames,
        ) -> *mut PyObject = unsafe { std::mem::transmute(self.0.addr) };
        f(obj, attr, flags, arg1, arg2, arg3, args, keyword_names)
    }

    pub fn ic(&self) -> &RuntimeIC {
        &self.0
    }
}

/// Shared runtime ICs cached per caller address, replaced round-robin.
pub struct RuntimeICCache<T, const N: usize> {
    entries: Mutex<Vec<(usize, std::sync::Arc<T>)>>,
    next_to_replace: Mutex<usize>,
}

impl<T, const N: usize> RuntimeICCache<T, N> {
    pub fn new() -> RuntimeICCache<T, N> {
        RuntimeICCache {
            entries: Mutex::new(Vec::new()),
            next_to_replace: Mutex::new(0),
        }
    }

    pub fn get_ic(
        &self,
        caller_addr: usize,
        make: impl FnOnce() -> Result<T, RuntimeError>,
    ) -> Result<std::sync::Arc<T>, RuntimeError> {
        assert!(caller_addr != 0);
        let mut entries = self.entries.lock().unwrap();
        for (addr, ic) in entries.iter() {
            if *addr == caller_addr {
                return Ok(ic.clone());
            }
        }
        let ic = std::sync::Arc::new(make()?);
        if entries.len() < N {
            entries.push((caller_addr, ic.clone()));
        } else {
            let mut next = self.next_to_replace.lock().unwrap();
            entries[*next] = (caller_addr, ic.clone());
            *next = (*next + 1) % N;
        }
        Ok(ic)
    }
}

impl<T, const N: usize> Default for RuntimeICCache<T, N> {
    fn default() -> Self {
        RuntimeICCache::new()
    }
}
