//! ICMP echo transport with native sockets and a `ping` command fallback.
//!
//! Native probes use blocking sockets in spawn_blocking for sub-millisecond
//! timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeTransport};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter so concurrent pings to one host stay distinguishable.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn next_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo probe transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcmpTransport;

#[async_trait]
impl ProbeTransport for IcmpTransport {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
        if capability == IcmpCapability::CommandOnly {
            return run_ping_command(address, timeout).await;
        }

        let ip = resolve_address(address).await?;
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
                run_ping_command(address, timeout).await
            }
            other => other,
        }
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Send one echo request and wait for the matching reply.
/// Runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // DGRAM sockets get their echo identifier rewritten to the local port by
    // the kernel, which also filters replies per socket
    let (socket, kernel_owns_id) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, false),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|socket| (socket, true))
            .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?,
    };
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = next_ping_id();
    let packet = build_echo_request(ip.is_ipv4(), identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Other sockets' replies may arrive first; keep reading until ours or timeout
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => ProbeError::Network(format!("Failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let expected_id = (!kernel_owns_id).then_some(identifier);
        if is_matching_reply(buf, ip.is_ipv4(), expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check whether a received datagram is the echo reply we are waiting for.
///
/// `identifier` is `None` when the kernel picked it (DGRAM sockets).
fn is_matching_reply(buf: &[u8], ipv4: bool, identifier: Option<u16>, sequence: u16) -> bool {
    // RAW IPv4 sockets deliver the IP header too; DGRAM sockets do not
    let offset = if ipv4 && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let expected_type = if ipv4 { ICMP_ECHO_REPLY } else { ICMPV6_ECHO_REPLY };
    icmp[0] == expected_type
        && identifier.map_or(true, |id| u16::from_be_bytes([icmp[4], icmp[5]]) == id)
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build an echo request: 8 byte header plus 56 byte payload.
///
/// The ICMPv6 checksum is left at zero, the kernel fills it in.
fn build_echo_request(ipv4: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = if ipv4 { ICMP_ECHO_REQUEST } else { ICMPV6_ECHO_REQUEST };
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if ipv4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-n", "-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Parse ping command output for the round-trip time.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, some macOS)
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let per_packet = PER_PACKET
        .get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").ok())
        .as_ref();
    let summary = SUMMARY
        .get_or_init(|| {
            Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/")
                .ok()
        })
        .as_ref();

    per_packet
        .into_iter()
        .chain(summary)
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("val")?.as_str().parse::<f64>().ok())
        .find(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
