use anyhow::Context as _;
use aya::maps::PerCpuArray;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use std::path::Path;

use udpstamp_common::StampResult;

use crate::config::XdpMode;
use crate::state::{PointCounters, StampCounters};

/// Which observation point a program implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    Ingress,
    Egress,
}

impl Point {
    pub fn program(self) -> &'static str {
        match self {
            Point::Ingress => "udp_timestamp_ingress",
            Point::Egress => "udp_timestamp_egress",
        }
    }

    fn stats_map(self) -> &'static str {
        match self {
            Point::Ingress => "INGRESS_STATS",
            Point::Egress => "EGRESS_STATS",
        }
    }
}

/// The loaded XDP object. Dropping it detaches every attached program.
pub struct Stamper {
    bpf: Ebpf,
}

impl Stamper {
    /// Load the compiled XDP object (`cargo xtask build-ebpf` output).
    pub fn load(object: &Path) -> anyhow::Result<Self> {
        let bpf = Ebpf::load_file(object)
            .with_context(|| format!("failed to load eBPF object {}", object.display()))?;
        Ok(Self { bpf })
    }

    pub fn attach(&mut self, point: Point, iface: &str, mode: XdpMode) -> anyhow::Result<()> {
        let name = point.program();
        let program: &mut Xdp = self
            .bpf
            .program_mut(name)
            .with_context(|| format!("program {name} not found in eBPF object"))?
            .try_into()?;
        program.load()?;

        match mode {
            XdpMode::Skb => {
                program
                    .attach(iface, XdpFlags::SKB_MODE)
                    .with_context(|| format!("failed to attach {name} to {iface}"))?;
                tracing::info!("{} attached to {} (skb mode)", name, iface);
            }
            XdpMode::Drv => match program.attach(iface, XdpFlags::DRV_MODE) {
                Ok(_) => tracing::info!("{} attached to {} (drv mode)", name, iface),
                Err(e) => {
                    tracing::warn!("drv mode attach on {} failed: {}, trying skb mode", iface, e);
                    program
                        .attach(iface, XdpFlags::SKB_MODE)
                        .with_context(|| format!("failed to attach {name} to {iface}"))?;
                    tracing::info!("{} attached to {} (skb mode)", name, iface);
                }
            },
        }
        Ok(())
    }

    /// Current PASS / MODIFIED totals of both programs, summed over CPUs.
    pub fn counters(&self) -> anyhow::Result<StampCounters> {
        Ok(StampCounters {
            ingress: self.point_counters(Point::Ingress)?,
            egress: self.point_counters(Point::Egress)?,
        })
    }

    fn point_counters(&self, point: Point) -> anyhow::Result<PointCounters> {
        let map = self
            .bpf
            .map(point.stats_map())
            .with_context(|| format!("map {} not found in eBPF object", point.stats_map()))?;
        let stats = PerCpuArray::<_, u64>::try_from(map)?;

        let mut counters = PointCounters::default();
        for result in StampResult::ALL {
            let total: u64 = stats.get(&result.index(), 0)?.iter().sum();
            match result {
                StampResult::Pass => counters.pass = total,
                StampResult::Modified => counters.modified = total,
            }
        }
        Ok(counters)
    }
}
