use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

/// Build and run helpers for the udpstamp XDP timestamping workspace.
#[derive(Parser)]
enum Cli {
    /// Build the `udp_timestamp_ingress` and `udp_timestamp_egress` XDP
    /// programs into one object for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything: the XDP object first, then the collector agent.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the agent with sudo (attaching XDP needs
    /// CAP_NET_ADMIN), e.g. `-- --ingress-interface eth0 --egress-interface xdp_veth`.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the frame validator and stamper tests under Miri.
    Miri,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run(release, &args)
        }
        Cli::Miri => miri(),
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../udpstamp-ebpf"));
    cmd.args([
        "+nightly",
        "build",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for eBPF")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--workspace"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for workspace")?;
    anyhow::ensure!(status.success(), "workspace build failed");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = if release { "release" } else { "debug" };
    let bin = format!("target/{profile}/udpstamp");

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.args(extra_args);
    let status = cmd.status().context("failed to run udpstamp")?;
    anyhow::ensure!(status.success(), "udpstamp exited with error");
    Ok(())
}

fn miri() -> anyhow::Result<()> {
    let status = Command::new("cargo")
        .args(["+nightly", "miri", "test", "-p", "udpstamp-common"])
        .status()
        .context("failed to run cargo miri")?;
    anyhow::ensure!(status.success(), "miri tests failed");
    Ok(())
}
