use anyhow::Context as _;
use pnet::datalink;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use udpstamp_common::{Clock, TimingRecord};

use crate::clock::MonotonicClock;
use crate::state::{LatencySample, LatencyState};

/// Largest datagram read per receive; anything beyond is truncated.
const MAX_DATAGRAM: usize = 1500;
/// Pause after a transient receive error.
const RECV_RETRY: Duration = Duration::from_millis(100);

/// Collector identity derived from its address: `pod` + last character of the
/// dotted quad (10.0.0.3 -> `pod3`).
pub fn pod_id(ip: Ipv4Addr) -> String {
    let ip = ip.to_string();
    let last = ip.chars().last().unwrap_or('0');
    format!("pod{last}")
}

/// First IPv4 address assigned to interface `name`.
pub fn interface_ipv4(name: &str) -> anyhow::Result<Ipv4Addr> {
    datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.name == name)
        .flat_map(|iface| iface.ips)
        .find_map(|net| match net.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("no IPv4 address on interface {name}"))
}

/// Bind one UDP socket per port on `ip`.
pub fn bind(ip: Ipv4Addr, ports: &[u16], recv_buffer: usize) -> anyhow::Result<Vec<(u16, UdpSocket)>> {
    ports
        .iter()
        .map(|&port| -> anyhow::Result<(u16, UdpSocket)> {
            let socket = std::net::UdpSocket::bind(SocketAddrV4::new(ip, port))
                .with_context(|| format!("failed to bind {ip}:{port}"))?;
            if let Err(e) = set_recv_buffer(&socket, recv_buffer) {
                tracing::warn!("SO_RCVBUF on port {} not applied: {}", port, e);
            }
            socket.set_nonblocking(true)?;
            Ok((port, UdpSocket::from_std(socket)?))
        })
        .collect()
}

fn set_recv_buffer(socket: &std::net::UdpSocket, bytes: usize) -> io::Result<()> {
    let size = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive timing payloads on one port until the sample writer goes away.
pub async fn run_port(
    socket: UdpSocket,
    port: u16,
    tx: mpsc::Sender<LatencySample>,
    state: Arc<LatencyState>,
) {
    let clock = MonotonicClock;
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if is_transient(&e) => {
                tracing::warn!("recv on port {} failed: {}, retrying", port, e);
                sleep(RECV_RETRY).await;
                continue;
            }
            Err(e) => {
                tracing::error!("recv on port {} failed: {}, stopping collector", port, e);
                return;
            }
        };
        let received_ns = clock.now_ns();

        let Some(record) = TimingRecord::decode(&buf[..len]) else {
            state.record_short_datagram();
            tracing::trace!("{} byte datagram from {} on port {} ignored", len, src, port);
            continue;
        };

        let sample = LatencySample::new(record, port, src, received_ns);
        state.update(&sample);
        if tx.send(sample).await.is_err() {
            tracing::debug!("sample writer closed, stopping collector on port {}", port);
            return;
        }
    }
}

/// Errors a UDP socket can report for a single datagram (ICMP feedback,
/// signals, buffer pressure) without the socket being unusable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    ) || e.raw_os_error() == Some(libc::ENOBUFS)
        || e.raw_os_error() == Some(libc::ENOMEM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use udpstamp_common::PAYLOAD_LEN;

    #[test]
    fn test_pod_id() {
        assert_eq!(pod_id(Ipv4Addr::new(10, 0, 0, 3)), "pod3");
        assert_eq!(pod_id(Ipv4Addr::new(10, 0, 0, 12)), "pod2");
        assert_eq!(pod_id(Ipv4Addr::UNSPECIFIED), "pod0");
    }

    #[test]
    fn test_loopback_has_ipv4() {
        assert_eq!(interface_ipv4("lo").unwrap(), Ipv4Addr::LOCALHOST);
        assert!(interface_ipv4("does-not-exist0").is_err());
    }

    #[test]
    fn test_recv_error_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_collects_timing_payloads() {
        let state = Arc::new(LatencyState::new());
        let (tx, mut rx) = mpsc::channel(16);

        let mut sockets = bind(Ipv4Addr::LOCALHOST, &[0], 1 << 20).unwrap();
        let (_, socket) = sockets.remove(0);
        let addr = socket.local_addr().unwrap();
        let port = addr.port();
        let task = tokio::spawn(run_port(socket, port, tx, state.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let record = TimingRecord {
            packet_id: 42,
            ingress_ts: 1_000,
            egress_ts: 1_800,
        };
        sender.send_to(&[0u8; PAYLOAD_LEN - 1], addr).await.unwrap();
        sender.send_to(&record.encode(), addr).await.unwrap();

        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.record(), record);
        assert_eq!(sample.delta, 800);
        assert_eq!(sample.dst_port, port);
        assert_eq!(sample.src_ip, "127.0.0.1");
        assert_eq!(sample.src_port, sender.local_addr().unwrap().port());

        assert_eq!(state.short_datagrams.load(Ordering::Relaxed), 1);
        assert_eq!(state.total_samples.load(Ordering::Relaxed), 1);

        drop(rx);
        task.abort();
    }
}
