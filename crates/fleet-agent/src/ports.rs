//! Listening TCP port discovery.
//!
//! Joins a process's socket inodes against the LISTEN rows of
//! `/proc/net/tcp{,6}`. Sockets the parent also holds are inherited and
//! dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use fleet_core::ListenAddr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AgentResult;
use crate::proc::ProcReader;

const TCP_LISTEN: &str = "0A";

/// Delays between discovery attempts; about two minutes in total.
pub const DISCOVERY_BACKOFF: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(50),
];

fn parse_addr(raw: &str) -> Option<ListenAddr> {
    let (ip_hex, port_hex) = raw.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = match ip_hex.len() {
        8 => Ipv4Addr::from(u32::from_str_radix(ip_hex, 16).ok()?.to_le_bytes()).to_string(),
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(ip_hex.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Ipv6Addr::from(bytes).to_string()
        }
        _ => return None,
    };
    Some(ListenAddr { ip, port })
}

/// LISTEN rows of a `/proc/net/tcp` style table, keyed by socket inode.
pub fn parse_listen_table(content: &str) -> BTreeMap<u64, ListenAddr> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            Some((inode, parse_addr(fields[1])?))
        })
        .collect()
}

/// Addresses `pid` listens on itself.
pub fn listening(reader: &ProcReader, pid: i32, ppid: i32) -> AgentResult<Vec<ListenAddr>> {
    let mut table = parse_listen_table(&reader.read_host_file("net/tcp")?);
    if let Ok(v6) = reader.read_host_file("net/tcp6") {
        table.extend(parse_listen_table(&v6));
    }
    let own = reader.socket_inodes(pid)?;
    let inherited = if ppid > 1 {
        reader.socket_inodes(ppid).unwrap_or_default()
    } else {
        BTreeSet::new()
    };
    let found: BTreeSet<ListenAddr> = own
        .difference(&inherited)
        .filter_map(|inode| table.get(inode).cloned())
        .collect();
    Ok(found.into_iter().collect())
}

/// Retry [`listening`] on the backoff schedule until something shows up.
pub async fn discover(reader: ProcReader, pid: i32, ppid: i32, cancel: CancellationToken) -> Vec<ListenAddr> {
    for delay in DISCOVERY_BACKOFF {
        tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            _ = tokio::time::sleep(delay) => {}
        }
        match listening(&reader, pid, ppid) {
            Ok(found) if !found.is_empty() => return found,
            Ok(_) => {}
            Err(e) => debug!(pid, error = %e, "port discovery attempt failed"),
        }
    }
    debug!(pid, "no listening ports found");
    Vec::new()
}
