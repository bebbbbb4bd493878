use crate::collectors::{ConnStatus, Connection, ProbeError};
#[cfg(target_os = "linux")]
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Tcp,
    Udp,
}

#[cfg(target_os = "linux")]
const PROC_NET_TABLES: [(&str, Transport); 4] = [
    ("/proc/net/tcp", Transport::Tcp),
    ("/proc/net/tcp6", Transport::Tcp),
    ("/proc/net/udp", Transport::Udp),
    ("/proc/net/udp6", Transport::Udp),
];

/// Enumerates internet sockets from procfs and attributes them to processes
/// through `/proc/<pid>/fd`. Sockets owned by processes we cannot inspect
/// come back with `pid: None`.
#[cfg(target_os = "linux")]
pub fn read_inet_connections() -> Result<Vec<Connection>, ProbeError> {
    let owners = socket_owners();
    let mut out = Vec::new();
    let mut readable = 0_usize;
    let mut last_err = None;

    for (path, transport) in PROC_NET_TABLES {
        match fs::read_to_string(path) {
            Ok(text) => {
                readable += 1;
                out.extend(parse_proc_net_table(&text, transport, &owners));
            }
            Err(err) => {
                tracing::debug!(path, error = %err, "socket table unreadable");
                last_err = Some(err);
            }
        }
    }

    match (readable, last_err) {
        (0, Some(err)) => Err(ProbeError::Io(err)),
        _ => Ok(out),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn read_inet_connections() -> Result<Vec<Connection>, ProbeError> {
    Err(ProbeError::Unsupported("socket enumeration"))
}

#[cfg(target_os = "linux")]
fn socket_owners() -> HashMap<u64, u32> {
    let mut owners = HashMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return owners;
    };

    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = target.to_str().and_then(parse_socket_link) {
                owners.entry(inode).or_insert(pid);
            }
        }
    }
    owners
}

fn parse_socket_link(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(target_os = "linux")]
fn parse_proc_net_table(
    text: &str,
    transport: Transport,
    owners: &HashMap<u64, u32>,
) -> Vec<Connection> {
    text.lines()
        .skip(1)
        .filter_map(|line| parse_proc_net_line(line, transport, |inode| owners.get(&inode).copied()))
        .collect()
}

fn parse_proc_net_line(
    line: &str,
    transport: Transport,
    owner_of: impl Fn(u64) -> Option<u32>,
) -> Option<Connection> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let local = parse_hex_socket_addr(fields[1]);
    let remote = parse_hex_socket_addr(fields[2]).filter(|addr| addr.port() != 0);
    let status = match transport {
        Transport::Udp => ConnStatus::None,
        Transport::Tcp => match fields[3] {
            "0A" => ConnStatus::Listen,
            "01" => ConnStatus::Established,
            _ => ConnStatus::Other,
        },
    };
    let inode = fields[9].parse::<u64>().ok()?;
    let pid = if inode == 0 { None } else { owner_of(inode) };

    Some(Connection {
        status,
        pid,
        local,
        remote,
    })
}

/// Parses `0100007F:0035` (IPv4) or the 32-digit IPv6 form. Address words are
/// printed in host byte order by the kernel.
fn parse_hex_socket_addr(raw: &str) -> Option<SocketAddr> {
    let (addr_hex, port_hex) = raw.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = match addr_hex.len() {
        8 => {
            let word = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut bytes = [0_u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(all(test, target_endian = "little"))]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_loopback() {
        let addr = parse_hex_socket_addr("0100007F:0035").unwrap();
        assert_eq!(addr, "127.0.0.1:53".parse().unwrap());
    }

    #[test]
    fn parses_ipv6_loopback() {
        let addr = parse_hex_socket_addr("00000000000000000000000001000000:1F90").unwrap();
        assert_eq!(addr, "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn socket_link_extracts_inode() {
        assert_eq!(parse_socket_link("socket:[4242]"), Some(4242));
        assert_eq!(parse_socket_link("pipe:[4242]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
    }

    #[test]
    fn listening_tcp_line_has_no_remote() {
        let line = "   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31337 1 0000000000000000 100 0 0 10 0";
        let conn = parse_proc_net_line(line, Transport::Tcp, |inode| {
            (inode == 31337).then_some(812)
        })
        .unwrap();
        assert_eq!(conn.status, ConnStatus::Listen);
        assert_eq!(conn.remote, None);
        assert_eq!(conn.pid, Some(812));
        assert_eq!(conn.local, Some("127.0.0.1:631".parse().unwrap()));
    }

    #[test]
    fn established_tcp_line_keeps_remote() {
        let line = "   1: 0F02000A:C350 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0000000000000000 20 4 30 10 -1";
        let conn = parse_proc_net_line(line, Transport::Tcp, |_| None).unwrap();
        assert_eq!(conn.status, ConnStatus::Established);
        assert_eq!(conn.remote, Some("93.184.216.34:443".parse().unwrap()));
        assert_eq!(conn.pid, None);
    }

    #[test]
    fn udp_sockets_have_no_status() {
        let line = "  7: 00000000:14E9 00000000:0000 07 00000000:00000000 00:00000000 00000000   104        0 2222 2 0000000000000000 0";
        let conn = parse_proc_net_line(line, Transport::Udp, |_| Some(1)).unwrap();
        assert_eq!(conn.status, ConnStatus::None);
    }

    #[test]
    fn short_lines_are_skipped() {
        assert!(parse_proc_net_line("garbage", Transport::Tcp, |_| None).is_none());
    }
}
