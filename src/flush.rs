//! Evicting one cache line from the local hierarchy

/// Proof that this CPU can flush a cache line from userspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheFlush {
    _private: (),
}

impl CacheFlush {
    /// Detect the flush instruction; `None` when the platform has none.
    pub fn detect() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            // CPUID.01H:EDX.CLFSH[bit 19]
            let cpuid_1 = unsafe { core::arch::x86_64::__cpuid(1) };
            ((cpuid_1.edx & (1 << 19)) != 0).then_some(Self { _private: () })
        }

        #[cfg(target_arch = "aarch64")]
        {
            Some(Self { _private: () })
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            None
        }
    }

    /// Evict the line holding the first byte of `line`, then fence loads.
    ///
    /// Does nothing for an empty slice.
    #[inline]
    pub fn flush_line(&self, line: &[u8]) {
        if line.is_empty() {
            return;
        }
        let addr = line.as_ptr();

        #[cfg(target_arch = "x86_64")]
        unsafe {
            use core::arch::x86_64::{_mm_clflush, _mm_lfence};
            _mm_clflush(addr);
            _mm_lfence();
        }

        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(
                "dc civac, {addr}",
                "dsb ish",
                "isb",
                addr = in(reg) addr,
                options(nostack, preserves_flags),
            );
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        let _ = addr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_keeps_contents() {
        let Some(flush) = CacheFlush::detect() else {
            return;
        };
        let line = [0x5au8; 64];
        flush.flush_line(&line);
        flush.flush_line(&[]);
        assert!(line.iter().all(|&b| b == 0x5a));
    }
}
