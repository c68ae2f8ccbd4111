use crate::{frame::payload_mut, payload::TimingRecord, Clock};

/// Outcome of one stamp invocation.
///
/// The discriminant doubles as the index into the per-CPU outcome counters
/// kept by the XDP programs.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "lowercase"))]
pub enum StampResult {
    /// Not a timing frame; left untouched.
    Pass = 0,
    /// A timestamp field was written.
    Modified = 1,
}

impl StampResult {
    pub const COUNT: u32 = 2;
    pub const ALL: [StampResult; 2] = [StampResult::Pass, StampResult::Modified];

    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u32
    }
}

/// Ingress observation point: record entry time and reset the egress stamp.
///
/// Running this twice on the same frame before egress discards an egress stamp
/// that was already written.
#[inline(always)]
pub fn stamp_ingress<C: Clock + ?Sized>(frame: &mut [u8], clock: &C) -> StampResult {
    let Some(mut payload) = payload_mut(frame) else {
        return StampResult::Pass;
    };
    payload.set_ingress_ts(clock.now_ns());
    payload.set_egress_ts(0);
    StampResult::Modified
}

/// Egress observation point: record exit time.
///
/// Stamps even when `ingress_ts` is zero; a zero ingress stamp next to a
/// non-zero egress stamp is how a missed ingress shows up downstream.
#[inline(always)]
pub fn stamp_egress<C: Clock + ?Sized>(frame: &mut [u8], clock: &C) -> StampResult {
    let Some(mut payload) = payload_mut(frame) else {
        return StampResult::Pass;
    };
    payload.set_egress_ts(clock.now_ns());
    StampResult::Modified
}

/// Where a logical packet is in `Unseen -> IngressStamped -> EgressStamped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "snake_case"))]
pub enum StampState {
    Unseen,
    IngressStamped,
    EgressStamped,
}

impl StampState {
    pub fn of(record: &TimingRecord) -> Self {
        match (record.ingress_ts, record.egress_ts) {
            (0, 0) => StampState::Unseen,
            (_, 0) => StampState::IngressStamped,
            _ => StampState::EgressStamped,
        }
    }
}
