//! Executable code memory and unwinder glue.
//!
//! Code regions are mapped read+write+execute; the runtime patches them in
//! place under the global execution lock. `MAP_32BIT` keeps regions in the
//! low 4 GiB so rel32 call displacements from emitted code usually reach
//! runtime entry points (the emitter falls back to an indirect call when
//! they do not).

use crate::error::RuntimeError;

/// mmap a read/write/execute region of `size` bytes.
pub fn alloc_code_region(size: usize) -> Result<*mut u8, RuntimeError> {
    let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_32BIT;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let addr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if addr == libc::MAP_FAILED {
        // Retry without MAP_32BIT; the low 4 GiB can fill up.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(RuntimeError::OutOfCodeMemory);
        }
        return Ok(addr as *mut u8);
    }
    Ok(addr as *mut u8)
}

/// Flush the instruction cache over `[addr, addr + size)`.
///
/// x86-64 keeps instruction fetch coherent with data stores on the same
/// core, and the execution model here is single-threaded, so this is a
/// compiler fence only. The call sites are kept explicit: every patch of
/// live code must be followed by one.
pub fn flush_instruction_cache(_addr: *const u8, _size: usize) {
    #[cfg(target_arch = "x86_64")]
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);

    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        // Non-x86 targets need a real flush; clear_cache is what libgcc
        // exposes for this.
        extern "C" {
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }
        __clear_cache(
            _addr as *mut core::ffi::c_char,
            (_addr as usize + _size) as *mut core::ffi::c_char,
        );
    }
}

extern "C" {
    fn __register_frame(fde: *const u8);
    fn __deregister_frame(fde: *const u8);
}

/// Register a hand-written EH frame with the process unwinder so panics
/// and backtraces can walk through trampoline frames.
///
/// `eh_frame_addr` points at the CIE; the FDE follows it. libgcc's
/// `__register_frame` takes a pointer to a single FDE.
pub fn register_eh_frame(eh_frame_addr: *const u8, cie_size: usize) {
    unsafe { __register_frame(eh_frame_addr.add(cie_size)) }
}

pub fn deregister_eh_frame(eh_frame_addr: *const u8, cie_size: usize) {
    unsafe { __deregister_frame(eh_frame_addr.add(cie_size)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_region_is_writable() {
        let region = alloc_code_region(4096).unwrap();
        unsafe {
            // ret
            region.write(0xc3);
            assert_eq!(region.read(), 0xc3);
        }
        flush_instruction_cache(region, 1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn code_region_is_executable() {
        let region = alloc_code_region(4096).unwrap();
        unsafe {
            // mov eax, 42; ret
            let code: [u8; 6] = [0xb8, 42, 0, 0, 0, 0xc3];
            std::ptr::copy_nonoverlapping(code.as_ptr(), region, code.len());
            flush_instruction_cache(region, code.len());
            let f: extern "C" fn() -> i32 = std::mem::transmute(region);
            assert_eq!(f(), 42);
        }
    }
}
