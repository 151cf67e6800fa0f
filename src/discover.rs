//! Active host discovery via ARP sweep.
//!
//! Broadcasts an ARP request for every address in a CIDR range on the
//! selected interface, then collects replies for a fixed window and returns
//! the `{ip, mac}` pairs that answered. Runs before a capture session so
//! the operator can pick target IPs to monitor.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, MacAddr};
use pnet::ipnetwork::IpNetwork;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::{MutablePacket, Packet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A host that answered the ARP sweep.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredHost {
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Sweeps `range` (e.g. "192.168.1.0/24") on `iface_name`, collecting
/// replies for `timeout` after the last request goes out.
pub fn discover_hosts(
    range: &str,
    iface_name: &str,
    timeout: Duration,
) -> Result<Vec<DiscoveredHost>> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == iface_name)
        .ok_or_else(|| anyhow!("interface '{}' not found", iface_name))?;

    let my_mac = interface
        .mac
        .ok_or_else(|| anyhow!("interface '{}' has no MAC address", iface_name))?;
    let my_ip = interface
        .ips
        .iter()
        .find_map(|net| match net {
            IpNetwork::V4(v4) => Some(v4.ip()),
            _ => None,
        })
        .ok_or_else(|| anyhow!("interface '{}' has no IPv4 address", iface_name))?;

    let network: IpNetwork = range
        .parse()
        .with_context(|| format!("invalid IP range '{}'", range))?;
    let network = match network {
        IpNetwork::V4(v4) => v4,
        IpNetwork::V6(_) => bail!("ARP discovery supports IPv4 ranges only"),
    };

    let config = datalink::Config {
        read_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(&interface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => bail!("unsupported datalink channel type on '{}'", iface_name),
        Err(e) => {
            return Err(anyhow!(e)
                .context(format!("failed to open datalink channel on '{}'", iface_name)))
        }
    };

    info!("ARP sweep of {} on {}", network, iface_name);

    let mut requested = 0usize;
    for target in network.iter() {
        if target == my_ip {
            continue;
        }
        if let Err(e) = send_arp_request(&mut tx, my_mac, my_ip, target) {
            warn!("ARP send failed for {}: {}", target, e);
            continue;
        }
        requested += 1;
        // Keep the burst gentle on the LAN.
        std::thread::sleep(Duration::from_millis(1));
    }
    debug!("sent {} ARP requests", requested);

    Ok(collect_replies(&mut rx, my_ip, timeout))
}

/// Builds and sends one broadcast ARP request frame.
fn send_arp_request(
    tx: &mut Box<dyn DataLinkSender>,
    my_mac: MacAddr,
    my_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Result<()> {
    let mut buffer = [0u8; 42];
    {
        let mut eth = MutableEthernetPacket::new(&mut buffer)
            .ok_or_else(|| anyhow!("ethernet buffer too small"))?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(my_mac);
        eth.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(eth.payload_mut())
            .ok_or_else(|| anyhow!("ARP buffer too small"))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(my_mac);
        arp.set_sender_proto_addr(my_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }

    match tx.send_to(&buffer, None) {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow!("datalink sender refused the frame")),
    }
}

/// Reads ARP replies until the collection window closes. Duplicate
/// (ip, mac) pairs are dropped; a proxy-ARP device answering for several
/// addresses keeps one entry per pair.
fn collect_replies(
    rx: &mut Box<dyn DataLinkReceiver>,
    my_ip: Ipv4Addr,
    timeout: Duration,
) -> Vec<DiscoveredHost> {
    let mut hosts = Vec::new();
    let mut seen: HashSet<(Ipv4Addr, String)> = HashSet::new();
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        let frame = match rx.next() {
            Ok(frame) => frame,
            // Read timeouts just re-check the deadline.
            Err(_) => continue,
        };

        let Some(eth) = EthernetPacket::new(frame) else {
            continue;
        };
        if eth.get_ethertype() != EtherTypes::Arp {
            continue;
        }
        let Some(arp) = ArpPacket::new(eth.payload()) else {
            continue;
        };
        if arp.get_operation() != ArpOperations::Reply {
            continue;
        }

        let ip = arp.get_sender_proto_addr();
        if ip == my_ip {
            continue;
        }
        let mac = arp.get_sender_hw_addr().to_string().to_uppercase();
        if seen.insert((ip, mac.clone())) {
            debug!("host discovered: {} at {}", ip, mac);
            hosts.push(DiscoveredHost { ip, mac });
        }
    }

    hosts.sort_by_key(|h| h.ip);
    hosts
}
