#![cfg_attr(not(test), no_std)]

//! Timing-payload inspection and stamping shared by the XDP datapath and the
//! userspace agent.
//!
//! Everything here operates on a borrowed frame buffer and never allocates,
//! blocks or fails: a frame either carries a timing payload and gets stamped
//! ([`StampResult::Modified`]) or is left byte-for-byte untouched
//! ([`StampResult::Pass`]).

mod frame;
mod payload;
mod stamp;

pub use frame::{
    inspect, payload_mut, validate, PayloadOffset, ETH_P_IP, HEADER_STACK_LEN, IPPROTO_UDP,
    MIN_FRAME_LEN,
};
pub use payload::{TimingPayloadMut, TimingRecord, PAYLOAD_LEN};
pub use stamp::{stamp_egress, stamp_ingress, StampResult, StampState};

/// Source of monotonic nanosecond timestamps.
///
/// Stamps taken at the two observation points are subtracted from each other,
/// so implementations must read a clock that is never stepped by wall-clock
/// adjustments (`CLOCK_MONOTONIC`, or `bpf_ktime_get_ns` in the kernel).
pub trait Clock {
    fn now_ns(&self) -> u64;
}

impl<F: Fn() -> u64> Clock for F {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        self()
    }
}
