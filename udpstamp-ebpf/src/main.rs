#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::PerCpuArray,
    programs::XdpContext,
};
use core::slice;
use udpstamp_common::{stamp_egress, stamp_ingress, Clock, StampResult, MIN_FRAME_LEN};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// PASS / MODIFIED counts for the ingress program, indexed by `StampResult`.
#[map]
static INGRESS_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(StampResult::COUNT, 0);

/// PASS / MODIFIED counts for the egress program, indexed by `StampResult`.
#[map]
static EGRESS_STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(StampResult::COUNT, 0);

/// CLOCK_MONOTONIC as seen by the kernel.
struct KtimeClock;

impl Clock for KtimeClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

/// Attached to the physical (entry) interface.
#[xdp]
pub fn udp_timestamp_ingress(ctx: XdpContext) -> u32 {
    let result = match frame(&ctx) {
        Some(frame) => stamp_ingress(frame, &KtimeClock),
        None => StampResult::Pass,
    };
    count(&INGRESS_STATS, result);
    xdp_action::XDP_PASS
}

/// Attached to the veth end facing the simulated workload.
#[xdp]
pub fn udp_timestamp_egress(ctx: XdpContext) -> u32 {
    let result = match frame(&ctx) {
        Some(frame) => stamp_egress(frame, &KtimeClock),
        None => StampResult::Pass,
    };
    count(&EGRESS_STATS, result);
    xdp_action::XDP_PASS
}

/// The first `MIN_FRAME_LEN` bytes of packet memory, or `None` if the packet
/// is shorter.
///
/// The verifier only accepts packet accesses dominated by a `data + N >
/// data_end` comparison, so the bound is checked here on raw addresses
/// before the slice exists. Everything past the timing payload is irrelevant
/// to the stampers and stays out of the slice.
#[inline(always)]
fn frame(ctx: &XdpContext) -> Option<&mut [u8]> {
    let data = ctx.data();
    let data_end = ctx.data_end();

    if data + MIN_FRAME_LEN > data_end {
        return None;
    }
    Some(unsafe { slice::from_raw_parts_mut(data as *mut u8, MIN_FRAME_LEN) })
}

#[inline(always)]
fn count(stats: &PerCpuArray<u64>, result: StampResult) {
    if let Some(counter) = stats.get_ptr_mut(result.index()) {
        unsafe { *counter += 1 };
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
