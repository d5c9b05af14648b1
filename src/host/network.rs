//! Network interface enumeration from /sys and /proc.
//!
//! The parsers take file contents as strings so they can be exercised with
//! captured fixtures; only [`enumerate`] touches the live system.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    pub mac: Option<String>,
    /// Link speed in Mbit/s, if the driver reports one.
    pub speed: Option<u64>,
    pub actual_ip: Option<String>,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
    /// WiFi signal level in dBm.
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Lan,
    Wifi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub interface: String,
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// Parse `/proc/net/route`. Addresses there are little-endian hex words.
pub fn parse_routes(text: &str) -> Vec<RouteEntry> {
    let mut routes = Vec::new();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Some(destination), Some(gateway), Some(mask)) = (
            parse_hex_ipv4(fields[1]),
            parse_hex_ipv4(fields[2]),
            parse_hex_ipv4(fields[7]),
        ) else {
            continue;
        };
        routes.push(RouteEntry {
            interface: fields[0].to_string(),
            destination,
            mask,
            gateway: (gateway != Ipv4Addr::UNSPECIFIED).then_some(gateway),
        });
    }
    routes
}

fn parse_hex_ipv4(raw: &str) -> Option<Ipv4Addr> {
    let value = u32::from_str_radix(raw, 16).ok()?;
    Some(Ipv4Addr::from(value.to_le_bytes()))
}

/// Parse `/proc/net/wireless` into per-interface signal levels (dBm).
pub fn parse_wireless(text: &str) -> HashMap<String, i32> {
    let mut signals = HashMap::new();
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        if let Ok(level) = fields[2].trim_end_matches('.').parse::<f64>() {
            signals.insert(name.trim().to_string(), level as i32);
        }
    }
    signals
}

/// Parse `/etc/resolv.conf` nameserver entries.
pub fn parse_resolv(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("nameserver")
                .map(|rest| rest.trim().to_string())
        })
        .filter(|server| !server.is_empty())
        .collect()
}

/// Extract local IPv4 addresses from `/proc/net/fib_trie` (entries whose
/// following line marks them `host LOCAL`).
pub fn parse_local_addresses(text: &str) -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    for window in lines.windows(2) {
        let Some(candidate) = window[0].trim().strip_prefix("|-- ") else {
            continue;
        };
        if window[1].contains("host LOCAL") {
            if let Ok(address) = candidate.trim().parse::<Ipv4Addr>() {
                if !address.is_loopback() && !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
        }
    }
    addresses
}

fn in_subnet(address: Ipv4Addr, route: &RouteEntry) -> bool {
    let addr = u32::from(address);
    let dest = u32::from(route.destination);
    let mask = u32::from(route.mask);
    mask != 0 && (addr & mask) == (dest & mask)
}

/// Enumerate non-loopback interfaces from the live system.
pub fn enumerate() -> Vec<Interface> {
    let routes = std::fs::read_to_string("/proc/net/route")
        .map(|text| parse_routes(&text))
        .unwrap_or_default();
    let wireless = std::fs::read_to_string("/proc/net/wireless")
        .map(|text| parse_wireless(&text))
        .unwrap_or_default();
    let dns = std::fs::read_to_string("/etc/resolv.conf")
        .map(|text| parse_resolv(&text))
        .unwrap_or_default();
    let locals = std::fs::read_to_string("/proc/net/fib_trie")
        .map(|text| parse_local_addresses(&text))
        .unwrap_or_default();

    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    let mut interfaces = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let sys = Path::new("/sys/class/net").join(&name);
        let mac = std::fs::read_to_string(sys.join("address"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != "00:00:00:00:00:00");
        let speed = std::fs::read_to_string(sys.join("speed"))
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|speed| *speed > 0)
            .map(|speed| speed as u64);

        let kind = if name.starts_with('w') {
            InterfaceKind::Wifi
        } else {
            InterfaceKind::Lan
        };

        let own_routes: Vec<&RouteEntry> =
            routes.iter().filter(|r| r.interface == name).collect();
        let actual_ip = locals
            .iter()
            .find(|address| own_routes.iter().any(|route| in_subnet(**address, route)))
            .map(Ipv4Addr::to_string);
        let subnet = own_routes
            .iter()
            .find(|route| u32::from(route.mask) != 0)
            .map(|route| route.mask.to_string());
        let gateway = own_routes
            .iter()
            .find_map(|route| route.gateway)
            .map(|gateway| gateway.to_string());

        debug!(%name, ?kind, "found network interface");
        interfaces.push(Interface {
            signal: wireless.get(&name).copied(),
            dns_servers: dns.clone(),
            name,
            kind,
            mac,
            speed,
            actual_ip,
            subnet,
            gateway,
        });
    }
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn routes_decode_little_endian_hex() {
        let routes = parse_routes(ROUTES);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(routes[1].destination, Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(routes[1].mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(routes[1].gateway, None);
    }

    #[test]
    fn wireless_levels_are_parsed() {
        let text = "\
Inter-| sta-|   Quality        |   Discarded packets               | Missed | WE
 face | tus | link level noise |  nwid  crypt   frag  retry   misc | beacon | 22
 wlan0: 0000   54.  -56.  -256        0      0      0      0      0        0
";
        let signals = parse_wireless(text);
        assert_eq!(signals.get("wlan0"), Some(&-56));
    }

    #[test]
    fn resolv_conf_nameservers() {
        let text = "# comment\nnameserver 8.8.8.8\nsearch lan\nnameserver 1.1.1.1\n";
        assert_eq!(parse_resolv(text), vec!["8.8.8.8", "1.1.1.1"]);
    }

    #[test]
    fn fib_trie_local_hosts() {
        let text = "\
Main:
  +-- 0.0.0.0/0 3 0 5
     +-- 192.168.0.0/24 2 0 2
        |-- 192.168.0.10
           /32 host LOCAL
        |-- 192.168.0.255
           /32 link BROADCAST
     |-- 127.0.0.1
        /32 host LOCAL
";
        let locals = parse_local_addresses(text);
        assert_eq!(locals, vec![Ipv4Addr::new(192, 168, 0, 10)]);
    }

    #[test]
    fn subnet_membership() {
        let route = RouteEntry {
            interface: "eth0".to_string(),
            destination: Ipv4Addr::new(192, 168, 0, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: None,
        };
        assert!(in_subnet(Ipv4Addr::new(192, 168, 0, 10), &route));
        assert!(!in_subnet(Ipv4Addr::new(10, 0, 0, 1), &route));
    }
}
