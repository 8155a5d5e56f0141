//! Protocol classification.
//!
//! Two label functions, deliberately separate: the tally label buckets a
//! packet for the protocol statistics, the display label names it for the
//! packet preview. They can diverge — a DNS-over-UDP query tallies as UDP
//! but previews as DNS.

use super::containers::PacketRecord;
use lazy_static::lazy_static;

lazy_static! {
    /// Well-known service ports checked, in order, when naming a TCP packet
    /// for display.
    static ref SERVICE_PORTS: Vec<(u16, &'static str)> = vec![
        (80, "HTTP"),
        (443, "HTTPS"),
        (22, "SSH"),
    ];
}

/// Label a packet counts under in the protocol tally.
///
/// First layer match wins: TCP > UDP > ICMP > ARP > DNS > Other. The order is
/// a deliberate tie-break — a packet carrying both TCP and DNS layers is a
/// TCP packet here, never DNS.
pub fn tally_label(record: &PacketRecord) -> &'static str {
    let layers = record.layers;
    if layers.tcp {
        "TCP"
    } else if layers.udp {
        "UDP"
    } else if layers.icmp {
        "ICMP"
    } else if layers.arp {
        "ARP"
    } else if layers.dns {
        "DNS"
    } else {
        "Other"
    }
}

/// Label shown for a packet in the preview.
///
/// Same layer precedence as [tally_label], but TCP and UDP packets are named
/// by well-known port where one is in use on either side.
pub fn display_label(record: &PacketRecord) -> &'static str {
    if record.layers.tcp {
        for &(port, service) in SERVICE_PORTS.iter() {
            if record.port_in_use(port) {
                return service;
            }
        }
        return "TCP";
    }
    if record.layers.udp {
        if record.port_in_use(53) {
            return "DNS";
        }
        return "UDP";
    }
    if record.layers.icmp {
        return "ICMP";
    }
    if record.layers.arp {
        return "ARP";
    }
    "Other"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::containers::LayerSet;

    fn record(layers: LayerSet, src_port: Option<u16>, dst_port: Option<u16>) -> PacketRecord {
        PacketRecord {
            timestamp: 0.0,
            wire_len: 60,
            layers,
            src_ip: None,
            dst_ip: None,
            src_port,
            dst_port,
            tcp_flags: None,
        }
    }

    #[test]
    fn tcp_beats_dns_in_the_tally() {
        // DNS over TCP: both layers present, the tally must say TCP.
        let rec = record(
            LayerSet {
                ip: true,
                tcp: true,
                dns: true,
                ..LayerSet::default()
            },
            Some(33000),
            Some(53),
        );
        assert_eq!(tally_label(&rec), "TCP");
    }

    #[test]
    fn dns_over_udp_tallies_as_udp_but_displays_as_dns() {
        let rec = record(
            LayerSet {
                ip: true,
                udp: true,
                dns: true,
                ..LayerSet::default()
            },
            Some(40000),
            Some(53),
        );
        assert_eq!(tally_label(&rec), "UDP");
        assert_eq!(display_label(&rec), "DNS");
    }

    #[test]
    fn display_names_tcp_services_by_port() {
        let web = record(
            LayerSet {
                ip: true,
                tcp: true,
                ..LayerSet::default()
            },
            Some(51000),
            Some(443),
        );
        assert_eq!(display_label(&web), "HTTPS");
        assert_eq!(tally_label(&web), "TCP");

        // Port match works on the source side too.
        let ssh = record(
            LayerSet {
                ip: true,
                tcp: true,
                ..LayerSet::default()
            },
            Some(22),
            Some(50123),
        );
        assert_eq!(display_label(&ssh), "SSH");

        let plain = record(
            LayerSet {
                ip: true,
                tcp: true,
                ..LayerSet::default()
            },
            Some(51000),
            Some(8443),
        );
        assert_eq!(display_label(&plain), "TCP");
    }

    #[test]
    fn a_lone_dns_layer_still_has_a_tally_bucket() {
        // The loader never emits DNS without a transport layer, but the
        // precedence contract keeps the branch; records are constructible.
        let rec = record(
            LayerSet {
                dns: true,
                ..LayerSet::default()
            },
            None,
            None,
        );
        assert_eq!(tally_label(&rec), "DNS");
    }

    #[test]
    fn layerless_packets_fall_through_to_other() {
        let rec = record(LayerSet::default(), None, None);
        assert_eq!(tally_label(&rec), "Other");
        assert_eq!(display_label(&rec), "Other");
    }

    #[test]
    fn icmp_and_arp_label_both_ways() {
        let icmp = record(
            LayerSet {
                ip: true,
                icmp: true,
                ..LayerSet::default()
            },
            None,
            None,
        );
        assert_eq!(tally_label(&icmp), "ICMP");
        assert_eq!(display_label(&icmp), "ICMP");

        let arp = record(
            LayerSet {
                arp: true,
                ..LayerSet::default()
            },
            None,
            None,
        );
        assert_eq!(tally_label(&arp), "ARP");
        assert_eq!(display_label(&arp), "ARP");
    }
}
