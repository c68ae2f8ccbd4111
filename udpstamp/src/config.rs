use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// How the XDP programs are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Native driver mode, falling back to generic mode if the driver lacks XDP support.
    Drv,
    /// Generic (SKB) mode. Works on any interface, including veth.
    Skb,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interface where packets enter the measured path.
    #[serde(default)]
    pub ingress_interface: Option<String>,

    /// Interface where packets leave the measured path (e.g. a veth end).
    #[serde(default)]
    pub egress_interface: Option<String>,

    #[serde(default = "default_xdp_mode")]
    pub xdp_mode: XdpMode,

    /// Compiled XDP object holding both stamper programs.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// Interface whose IPv4 address the collector binds to.
    #[serde(default)]
    pub collector_interface: Option<String>,

    /// Explicit collector bind address; overrides `collector_interface`.
    #[serde(default)]
    pub bind_address: Option<Ipv4Addr>,

    /// UDP ports the collector listens on. Empty disables the collector.
    #[serde(default = "default_collector_ports")]
    pub collector_ports: Vec<u16>,

    /// Requested SO_RCVBUF for collector sockets; the kernel clamps it.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory for the JSON sample export written on shutdown.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Data retention in seconds (None = keep forever).
    #[serde(default)]
    pub data_retention_seconds: Option<u64>,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_xdp_mode() -> XdpMode {
    XdpMode::Drv
}

fn default_ebpf_object() -> String {
    concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../udpstamp-ebpf/target/bpfel-unknown-none/debug/udpstamp"
    )
    .to_string()
}

fn default_collector_ports() -> Vec<u16> {
    (2100..=2180).step_by(10).collect()
}

fn default_recv_buffer_bytes() -> usize {
    2_073_741_824
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "latency.db".to_string()
}

fn default_output_dir() -> String {
    "delay-entries".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingress_interface: None,
            egress_interface: None,
            xdp_mode: default_xdp_mode(),
            ebpf_object: default_ebpf_object(),
            collector_interface: None,
            bind_address: None,
            collector_ports: default_collector_ports(),
            recv_buffer_bytes: default_recv_buffer_bytes(),
            port: default_port(),
            db_path: default_db_path(),
            output_dir: default_output_dir(),
            quiet: false,
            data_retention_seconds: None,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.ingress_interface.is_some() {
            self.ingress_interface = cli.ingress_interface.clone();
        }
        if cli.egress_interface.is_some() {
            self.egress_interface = cli.egress_interface.clone();
        }
        if let Some(mode) = cli.xdp_mode {
            self.xdp_mode = mode;
        }
        if let Some(ref object) = cli.ebpf_object {
            self.ebpf_object = object.clone();
        }
        if cli.collector_interface.is_some() {
            self.collector_interface = cli.collector_interface.clone();
        }
        if cli.bind_address.is_some() {
            self.bind_address = cli.bind_address;
        }
        if !cli.collector_ports.is_empty() {
            self.collector_ports = cli.collector_ports.clone();
        }
        if cli.no_collector {
            self.collector_ports.clear();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(ref db_path) = cli.db_path {
            self.db_path = db_path.clone();
        }
        if let Some(ref output_dir) = cli.output_dir {
            self.output_dir = output_dir.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.data_retention.is_some() {
            self.data_retention_seconds = cli.data_retention;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// udpstamp: XDP timestamping of UDP probes and one-way latency collection
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Interface to attach the ingress stamper to (e.g., eth0).
    #[arg(long)]
    pub ingress_interface: Option<String>,

    /// Interface to attach the egress stamper to (e.g., xdp_veth).
    #[arg(long)]
    pub egress_interface: Option<String>,

    /// XDP attach mode.
    #[arg(long, value_enum)]
    pub xdp_mode: Option<XdpMode>,

    /// Path to the compiled XDP object (defaults to the `cargo xtask build-ebpf` output).
    #[arg(long)]
    pub ebpf_object: Option<String>,

    /// Interface whose IPv4 address the collector binds to.
    #[arg(long)]
    pub collector_interface: Option<String>,

    /// Collector bind address (overrides --collector-interface).
    #[arg(long)]
    pub bind_address: Option<Ipv4Addr>,

    /// UDP port to collect timing payloads on. Repeat for multiple.
    #[arg(long = "collector-port")]
    pub collector_ports: Vec<u16>,

    /// Do not start the collector.
    #[arg(long)]
    pub no_collector: bool,

    /// Port to serve the API on [default: 3000].
    #[arg(short, long)]
    pub port: Option<u16>,

    /// SQLite database path [default: latency.db].
    #[arg(long)]
    pub db_path: Option<String>,

    /// Directory for the JSON sample export written on shutdown [default: delay-entries].
    #[arg(long)]
    pub output_dir: Option<String>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Data retention in seconds (delete samples older than this).
    #[arg(long)]
    pub data_retention: Option<u64>,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
