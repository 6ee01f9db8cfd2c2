//! Cache maintenance after patching instruction memory.
//!
//! Instruction fetch does not look at the data cache, so a patched opcode only becomes visible
//! once it has been cleaned out of the d-cache to the point of unification and the i-cache line
//! and branch predictor entries covering it have been invalidated.

/// The memory a cache operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTarget {
    /// The cache line containing the given address.
    ///
    /// Cache lines are 32 bytes wide, so the CPU ignores the lower 5 bits of the address.
    Address(usize),
}

/// Ensures an instruction update is visible on a uniprocessor.
pub fn sync_instruction(target: CacheTarget) {
    clean_dcache_to_unification(target);
    invalidate_icache(target);
}

#[cfg(target_arch = "arm")]
#[inline]
fn clean_dcache_to_unification(target: CacheTarget) {
    unsafe {
        match target {
            CacheTarget::Address(addr) => {
                // DCCMVAU
                core::arch::asm!(
                    "mcr p15, 0, {mva}, c7, c11, 1",
                    "dsb",
                    mva = in(reg) addr,
                    options(nostack, preserves_flags),
                );
            }
        }
    }
}

#[cfg(target_arch = "arm")]
#[inline]
fn invalidate_icache(target: CacheTarget) {
    unsafe {
        match target {
            CacheTarget::Address(addr) => {
                core::arch::asm!(
                    "mcr p15, 0, {mva}, c7, c5, 1", // ICIMVAU
                    "mcr p15, 0, {mva}, c7, c5, 7", // BPIMVA
                    "dsb",
                    "isb",
                    mva = in(reg) addr,
                    options(nostack, preserves_flags),
                );
            }
        }
    }
}

// Host builds have coherent caches as far as these tests are concerned.
#[cfg(not(target_arch = "arm"))]
const fn clean_dcache_to_unification(_target: CacheTarget) {}

#[cfg(not(target_arch = "arm"))]
const fn invalidate_icache(_target: CacheTarget) {}
