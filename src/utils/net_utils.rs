//! IPv4 interface helpers for UDP discovery.

use std::net::Ipv4Addr;

use tracing::warn;

/// Directed broadcast address of a subnet: `ip | !mask`, componentwise.
pub fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let ip = ip.octets();
    let mask = netmask.octets();
    Ipv4Addr::new(
        ip[0] | !mask[0],
        ip[1] | !mask[1],
        ip[2] | !mask[2],
        ip[3] | !mask[3],
    )
}

/// Broadcast targets for the discovery announcer: the directed broadcast
/// address of every broadcast-capable, non-loopback IPv4 interface, plus the
/// global broadcast address. Enumeration failure degrades to the global
/// address alone; discovery never aborts over it.
pub fn broadcast_targets() -> Vec<Ipv4Addr> {
    let mut targets = Vec::new();

    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let if_addrs::IfAddr::V4(v4) = iface.addr {
                    // A missing broadcast address marks a point-to-point or
                    // otherwise broadcast-incapable interface.
                    if v4.broadcast.is_none() {
                        continue;
                    }
                    let addr = directed_broadcast(v4.ip, v4.netmask);
                    if !targets.contains(&addr) {
                        targets.push(addr);
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
        }
    }

    targets.push(Ipv4Addr::BROADCAST);
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_broadcast_for_common_masks() {
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(10, 20, 30, 40), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(172, 16, 5, 9), Ipv4Addr::new(255, 255, 240, 0)),
            Ipv4Addr::new(172, 16, 15, 255)
        );
    }

    #[test]
    fn full_mask_broadcasts_to_host_itself() {
        assert_eq!(
            directed_broadcast(
                Ipv4Addr::new(100, 64, 0, 1),
                Ipv4Addr::new(255, 255, 255, 255)
            ),
            Ipv4Addr::new(100, 64, 0, 1)
        );
    }

    #[test]
    fn targets_always_include_global_broadcast() {
        let targets = broadcast_targets();
        assert!(targets.contains(&Ipv4Addr::BROADCAST));
    }
}
