use udpstamp_common::Clock;

/// `CLOCK_MONOTONIC` read from userspace.
///
/// Same time base as `bpf_ktime_get_ns`, so readings here can be compared
/// with the stamps the XDP programs write.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Cannot fail for CLOCK_MONOTONIC with a valid pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use udpstamp_common::{inspect, stamp_egress, stamp_ingress, StampResult, MIN_FRAME_LEN};

    /// Minimal Ethernet/IPv4/UDP frame carrying packet id 42.
    fn timing_frame() -> Vec<u8> {
        let mut frame = vec![0u8; MIN_FRAME_LEN];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = 17;
        frame[42..50].copy_from_slice(&42u64.to_be_bytes());
        frame
    }

    #[test]
    fn test_monotonic_never_decreases() {
        let clock = MonotonicClock;
        let mut last = clock.now_ns();
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_stamps_fall_between_readings() {
        let clock = MonotonicClock;
        let mut frame = timing_frame();

        let before = clock.now_ns();
        assert_eq!(stamp_ingress(&mut frame, &clock), StampResult::Modified);
        let after = clock.now_ns();

        let ingress = inspect(&frame).unwrap();
        assert_eq!(ingress.packet_id, 42);
        assert!(ingress.ingress_ts >= before && ingress.ingress_ts <= after);
        assert_eq!(ingress.egress_ts, 0);

        let before = clock.now_ns();
        assert_eq!(stamp_egress(&mut frame, &clock), StampResult::Modified);
        let after = clock.now_ns();

        let egress = inspect(&frame).unwrap();
        assert_eq!(egress.packet_id, 42);
        assert_eq!(egress.ingress_ts, ingress.ingress_ts);
        assert!(egress.egress_ts >= before && egress.egress_ts <= after);
        assert!(egress.latency_ns().is_some());
    }
}
