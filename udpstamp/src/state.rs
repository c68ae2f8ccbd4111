use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use udpstamp_common::TimingRecord;

/// One timing payload received by the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    /// Wall-clock receive time, milliseconds since the epoch.
    pub received_at: i64,
    /// Monotonic receive time, same time base as the stamps.
    pub received_ns: u64,
    pub pkt_id: u64,
    pub ingress_ts: u64,
    pub egress_ts: u64,
    /// `egress_ts - ingress_ts`, unfiltered.
    pub delta: i64,
    pub dst_port: u16,
    pub src_ip: String,
    pub src_port: u16,
}

impl LatencySample {
    pub fn new(record: TimingRecord, dst_port: u16, src: SocketAddr, received_ns: u64) -> Self {
        Self {
            received_at: chrono::Utc::now().timestamp_millis(),
            received_ns,
            pkt_id: record.packet_id,
            ingress_ts: record.ingress_ts,
            egress_ts: record.egress_ts,
            delta: record.delta_ns(),
            dst_port,
            src_ip: src.ip().to_string(),
            src_port: src.port(),
        }
    }

    pub fn record(&self) -> TimingRecord {
        TimingRecord {
            packet_id: self.pkt_id,
            ingress_ts: self.ingress_ts,
            egress_ts: self.egress_ts,
        }
    }
}

/// Latency aggregates for one collector port.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortStats {
    pub samples: u64,
    /// Samples whose stamps cannot form a latency (missing or reversed).
    pub malformed: u64,
    pub min_ns: Option<u64>,
    pub max_ns: Option<u64>,
    #[serde(skip)]
    sum_ns: u64,
}

impl PortStats {
    fn observe(&mut self, sample: &LatencySample) {
        self.samples += 1;
        match sample.record().latency_ns() {
            Some(ns) => {
                self.min_ns = Some(self.min_ns.map_or(ns, |min| min.min(ns)));
                self.max_ns = Some(self.max_ns.map_or(ns, |max| max.max(ns)));
                self.sum_ns = self.sum_ns.saturating_add(ns);
            }
            None => self.malformed += 1,
        }
    }

    pub fn mean_ns(&self) -> Option<f64> {
        let valid = self.samples - self.malformed;
        (valid > 0).then(|| self.sum_ns as f64 / valid as f64)
    }
}

/// PASS / MODIFIED totals for one observation point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointCounters {
    pub pass: u64,
    pub modified: u64,
}

/// Kernel-side outcome counters, summed across CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StampCounters {
    pub ingress: PointCounters,
    pub egress: PointCounters,
}

pub struct LatencyState {
    pub ports: DashMap<u16, PortStats>,
    pub total_samples: AtomicU64,
    pub malformed_samples: AtomicU64,
    pub short_datagrams: AtomicU64,
    ingress_pass: AtomicU64,
    ingress_modified: AtomicU64,
    egress_pass: AtomicU64,
    egress_modified: AtomicU64,
}

impl LatencyState {
    pub fn new() -> Self {
        Self {
            ports: DashMap::new(),
            total_samples: AtomicU64::new(0),
            malformed_samples: AtomicU64::new(0),
            short_datagrams: AtomicU64::new(0),
            ingress_pass: AtomicU64::new(0),
            ingress_modified: AtomicU64::new(0),
            egress_pass: AtomicU64::new(0),
            egress_modified: AtomicU64::new(0),
        }
    }

    pub fn update(&self, sample: &LatencySample) {
        self.ports
            .entry(sample.dst_port)
            .or_default()
            .observe(sample);

        self.total_samples.fetch_add(1, Ordering::Relaxed);
        if sample.record().latency_ns().is_none() {
            self.malformed_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_short_datagram(&self) {
        self.short_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_stamps(&self, counters: &StampCounters) {
        self.ingress_pass
            .store(counters.ingress.pass, Ordering::Relaxed);
        self.ingress_modified
            .store(counters.ingress.modified, Ordering::Relaxed);
        self.egress_pass
            .store(counters.egress.pass, Ordering::Relaxed);
        self.egress_modified
            .store(counters.egress.modified, Ordering::Relaxed);
    }

    pub fn stamps(&self) -> StampCounters {
        StampCounters {
            ingress: PointCounters {
                pass: self.ingress_pass.load(Ordering::Relaxed),
                modified: self.ingress_modified.load(Ordering::Relaxed),
            },
            egress: PointCounters {
                pass: self.egress_pass.load(Ordering::Relaxed),
                modified: self.egress_modified.load(Ordering::Relaxed),
            },
        }
    }
}
