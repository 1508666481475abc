//! ARP table lookup using system commands.
//!
//! Used to find a box again after a factory reset, when DHCP may have handed
//! it a different address.

use super::hidden_command_sync;
use crate::validate::MacAddress;
use anyhow::{Context, Result};
use std::net::Ipv4Addr;

/// One IP/MAC pairing from the neighbour table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

/// Source of IP/MAC pairings for hosts on the local segment.
pub trait NeighborTable: Send + Sync {
    fn entries(&self) -> Result<Vec<NeighborEntry>>;

    /// IPv4 address currently bound to `mac`, if the table knows it.
    fn find_by_mac(&self, mac: &MacAddress) -> Result<Option<Ipv4Addr>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.mac == *mac)
            .map(|entry| entry.ip))
    }
}

/// The operating system's ARP cache, read through the `arp` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemArp;

impl NeighborTable for SystemArp {
    fn entries(&self) -> Result<Vec<NeighborEntry>> {
        #[cfg(target_os = "linux")]
        let args: &[&str] = &["-n"];
        #[cfg(not(target_os = "linux"))]
        let args: &[&str] = &["-a"];

        let output = hidden_command_sync("arp")
            .args(args)
            .output()
            .context("Failed to run arp")?;
        let output_str = String::from_utf8_lossy(&output.stdout);

        #[cfg(target_os = "windows")]
        let entries = parse_windows(&output_str);
        #[cfg(target_os = "macos")]
        let entries = parse_macos(&output_str);
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let entries = parse_linux(&output_str);

        tracing::debug!("ARP table has {} entries", entries.len());
        Ok(entries)
    }
}

const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Skip multicast, broadcast and all-zero placeholder entries.
///
/// A subnet's broadcast address is only recognisable by its all-ones MAC; an
/// address ending in `.255` is a real host on networks wider than /24.
fn usable(ip: Ipv4Addr, mac: &MacAddress) -> bool {
    !ip.is_multicast()
        && !ip.is_broadcast()
        && mac.octets() != BROADCAST_MAC
        && mac.octets() != [0; 6]
}

/// `arp -n` on Linux:
/// `192.168.1.1  ether  aa:bb:cc:dd:ee:ff  C  eth0`
pub fn parse_linux(output: &str) -> Vec<NeighborEntry> {
    let mut entries = Vec::new();

    for line in output.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }
        let (Ok(ip), Some(mac)) = (parts[0].parse::<Ipv4Addr>(), MacAddress::parse_loose(parts[2]))
        else {
            continue;
        };
        if usable(ip, &mac) {
            entries.push(NeighborEntry { ip, mac });
        }
    }

    entries
}

/// `arp -a` on macOS:
/// `? (192.168.1.1) at 0:1a:2b:3c:4d:5e on en0 ifscope [ethernet]`
pub fn parse_macos(output: &str) -> Vec<NeighborEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let (Some(ip_start), Some(ip_end)) = (line.find('('), line.find(')')) else {
            continue;
        };
        if ip_end <= ip_start {
            continue;
        }
        let Ok(ip) = line[ip_start + 1..ip_end].parse::<Ipv4Addr>() else {
            continue;
        };
        let Some(at_pos) = line.find(" at ") else {
            continue;
        };
        let mac = line[at_pos + 4..].split_whitespace().next().unwrap_or("");
        if let Some(mac) = MacAddress::parse_loose(mac) {
            if usable(ip, &mac) {
                entries.push(NeighborEntry { ip, mac });
            }
        }
    }

    entries
}

/// `arp -a` on Windows:
/// `  192.168.1.1           aa-bb-cc-dd-ee-ff     dynamic`
pub fn parse_windows(output: &str) -> Vec<NeighborEntry> {
    let mut entries: Vec<NeighborEntry> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Interface") || line.contains("Internet Address") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let (Ok(ip), Some(mac)) = (parts[0].parse::<Ipv4Addr>(), MacAddress::parse_loose(parts[1]))
        else {
            continue;
        };
        // The same host is listed once per interface.
        if usable(ip, &mac) && !entries.iter().any(|e| e.ip == ip) {
            entries.push(NeighborEntry { ip, mac });
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux() {
        let out = "\
Address                  HWtype  HWaddress           Flags Mask            Iface
192.168.1.1              ether   a0:b1:c2:d3:e4:f5   C                     eth0
192.168.1.23                     (incomplete)                              eth0
192.168.1.40             ether   00:00:00:00:00:00   C                     eth0
192.168.1.57             ether   3c:da:2a:01:02:03   C                     eth0
";
        let entries = parse_linux(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].ip, Ipv4Addr::new(192, 168, 1, 57));
        assert_eq!(entries[1].mac.plain(), "3CDA2A010203");
    }

    #[test]
    fn test_host_ending_in_255_is_kept() {
        let out = "\
Address                  HWtype  HWaddress           Flags Mask            Iface
10.0.1.255               ether   3c:da:2a:01:02:03   C                     eth0
10.0.3.255               ether   ff:ff:ff:ff:ff:ff   CM                    eth0
";
        let entries = parse_linux(out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, Ipv4Addr::new(10, 0, 1, 255));

        let table = Fixed(entries);
        let mac: MacAddress = "3C:DA:2A:01:02:03".parse().unwrap();
        assert_eq!(
            table.find_by_mac(&mac).unwrap(),
            Some(Ipv4Addr::new(10, 0, 1, 255))
        );
    }

    #[test]
    fn test_parse_macos_unpadded() {
        let out = "\
? (192.168.1.1) at a0:b1:c2:d3:e4:f5 on en0 ifscope [ethernet]
? (192.168.1.9) at (incomplete) on en0 ifscope [ethernet]
? (192.168.1.57) at 3c:da:2a:1:2:3 on en0 ifscope [ethernet]
? (224.0.0.251) at 1:0:5e:0:0:fb on en0 ifscope permanent [ethernet]
";
        let entries = parse_macos(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mac.colon(), "3C:DA:2A:01:02:03");
    }

    #[test]
    fn test_parse_windows() {
        let out = "
Interface: 192.168.1.100 --- 0x4
  Internet Address      Physical Address      Type
  192.168.1.1           a0-b1-c2-d3-e4-f5     dynamic
  192.168.1.57          3c-da-2a-01-02-03     dynamic
  192.168.1.255         ff-ff-ff-ff-ff-ff     static
  224.0.0.22            01-00-5e-00-00-16     static
";
        let entries = parse_windows(out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    struct Fixed(Vec<NeighborEntry>);

    impl NeighborTable for Fixed {
        fn entries(&self) -> Result<Vec<NeighborEntry>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_find_by_mac_ignores_spelling() {
        let table = Fixed(parse_windows("  192.168.1.57   3c-da-2a-01-02-03   dynamic"));
        let mac: MacAddress = "3C:DA:2A:01:02:03".parse().unwrap();
        assert_eq!(
            table.find_by_mac(&mac).unwrap(),
            Some(Ipv4Addr::new(192, 168, 1, 57))
        );
        let other: MacAddress = "3CDA2A010204".parse().unwrap();
        assert_eq!(table.find_by_mac(&other).unwrap(), None);
    }
}
