#![forbid(unsafe_code)]

use packet_parser::{
    parse_tcp_segment, parse_udp_datagram, IpProtocol, Ipv4Packet, Ipv6Packet,
};
use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Canonical TCP flag rendering order. Scan order inside the packet never
/// changes the output order.
const TCP_FLAGS: [(u16, char); 8] = [
    (0x01, 'F'),
    (0x02, 'S'),
    (0x04, 'R'),
    (0x08, 'P'),
    (0x10, 'A'),
    (0x20, 'U'),
    (0x40, 'E'),
    (0x80, 'C'),
];

pub fn tcp_flag_string(flags: u16) -> String {
    TCP_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, c)| *c)
        .collect()
}

fn proto_name(protocol: IpProtocol) -> String {
    match protocol {
        IpProtocol::Icmpv4 => "icmp".to_string(),
        IpProtocol::Tcp => "tcp".to_string(),
        IpProtocol::Udp => "udp".to_string(),
        IpProtocol::Icmpv6 => "icmpv6".to_string(),
        IpProtocol::Other(v) => format!("{v}"),
    }
}

/// Transport detail shared by the v4 and v6 renderers: ports when the
/// transport header is reachable, plus TCP flag characters.
fn transport_detail(
    protocol: IpProtocol,
    payload: &[u8],
    offset_fragment: bool,
) -> (Option<(u16, u16)>, Option<String>) {
    if offset_fragment {
        // continuation fragments carry no transport header
        return (None, None);
    }
    match protocol {
        IpProtocol::Tcp => match parse_tcp_segment(payload) {
            Ok(tcp) => (
                Some((tcp.source_port, tcp.destination_port)),
                Some(tcp_flag_string(tcp.flags)),
            ),
            Err(_) => (None, None),
        },
        IpProtocol::Udp => match parse_udp_datagram(payload) {
            Ok(udp) => (Some((udp.source_port, udp.destination_port)), None),
            Err(_) => (None, None),
        },
        _ => (None, None),
    }
}

fn push_endpoints(
    line: &mut String,
    src: &str,
    dst: &str,
    ports: Option<(u16, u16)>,
) {
    match ports {
        Some((sport, dport)) => {
            let _ = write!(line, " {src},{sport} > {dst},{dport}");
        }
        None => {
            let _ = write!(line, " {src} > {dst}");
        }
    }
}

/// One greppable line for an IPv4 packet:
/// `ip <len>(<hdrlen>) <proto> [@<fragoffset>] <src>[,<sport>] > <dst>[,<dport>] [<flags>]`
pub fn print_ipv4(packet: &Ipv4Packet<'_>) -> String {
    let mut line = format!(
        "ip {}({}) {}",
        packet.total_length,
        packet.header_len(),
        proto_name(packet.protocol)
    );
    if packet.fragment_offset != 0 {
        let _ = write!(line, " @{}", packet.fragment_offset);
    }
    let (ports, flags) = transport_detail(
        packet.protocol,
        packet.payload,
        packet.fragment_offset != 0,
    );
    let src = Ipv4Addr::from(packet.source).to_string();
    let dst = Ipv4Addr::from(packet.destination).to_string();
    push_endpoints(&mut line, &src, &dst, ports);
    if let Some(flags) = flags {
        if !flags.is_empty() {
            let _ = write!(line, " {flags}");
        }
    }
    line
}

/// Delegate renderer for IPv6 packets; same shape with an `ip6` tag.
pub fn print_ipv6(packet: &Ipv6Packet<'_>) -> String {
    let mut line = format!(
        "ip6 {} {}",
        packet.payload_length,
        proto_name(packet.next_header)
    );
    let mut offset_fragment = false;
    if let Some(frag) = packet.fragment {
        if frag.offset != 0 {
            let _ = write!(line, " @{}", frag.offset);
            offset_fragment = true;
        }
    }
    let (ports, flags) = transport_detail(packet.next_header, packet.payload, offset_fragment);
    let src = Ipv6Addr::from(packet.source).to_string();
    let dst = Ipv6Addr::from(packet.destination).to_string();
    push_endpoints(&mut line, &src, &dst, ports);
    if let Some(flags) = flags {
        if !flags.is_empty() {
            let _ = write!(line, " {flags}");
        }
    }
    line
}

/// Raw dump: two lowercase hex digits per byte, space separated, wrapped
/// every `width` bytes, newline terminated.
pub fn hex_dump(data: &[u8], width: usize) -> String {
    let width = width.max(1);
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            if i % width == 0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        let _ = write!(out, "{byte:02x}");
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_parser::parse_ipv4_packet;

    fn tcp_packet(flags: u8) -> Vec<u8> {
        let mut buf = vec![
            0x45, 0x00, 0x00, 0x28, // ihl 5, total 40
            0x10, 0x92, 0x00, 0x00, // id, no fragment
            0x40, 0x06, 0x00, 0x00, // ttl, tcp, checksum
            10, 0, 0, 1, // src
            10, 0, 0, 2, // dst
        ];
        buf.extend_from_slice(&[
            0x00, 0x50, 0x01, 0xbb, // 80 -> 443
            0x00, 0x00, 0x00, 0x01, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, flags, 0x72, 0x10, // data offset 5
            0x00, 0x00, 0x00, 0x00,
        ]);
        buf
    }

    #[test]
    fn syn_ack_renders_s_before_a() {
        let raw = tcp_packet(0x12);
        let packet = parse_ipv4_packet(&raw).unwrap();
        let line = print_ipv4(&packet);
        assert_eq!(line, "ip 40(20) tcp 10.0.0.1,80 > 10.0.0.2,443 SA");
    }

    #[test]
    fn all_flags_render_in_canonical_order() {
        assert_eq!(tcp_flag_string(0xFF), "FSRPAUEC");
        assert_eq!(tcp_flag_string(0x00), "");
        assert_eq!(tcp_flag_string(0x11), "FA");
    }

    #[test]
    fn continuation_fragment_prints_offset_no_ports() {
        let raw = vec![
            0x45, 0x00, 0x00, 0x1c, // total 28
            0x10, 0x92, 0x20, 0x05, // MF set, offset 5
            0x40, 0x11, 0x00, 0x00, // udp
            10, 0, 0, 1, //
            10, 0, 0, 2, //
            1, 2, 3, 4, 5, 6, 7, 8,
        ];
        let packet = parse_ipv4_packet(&raw).unwrap();
        let line = print_ipv4(&packet);
        assert_eq!(line, "ip 28(20) udp @5 10.0.0.1 > 10.0.0.2");
    }

    #[test]
    fn udp_prints_ports_without_flags() {
        let raw = vec![
            0x45, 0x00, 0x00, 0x1c, // total 28
            0x10, 0x92, 0x00, 0x00, //
            0x40, 0x11, 0x00, 0x00, // udp
            10, 0, 0, 1, //
            10, 0, 0, 2, //
            0x13, 0x89, 0x00, 0x35, // 5001 -> 53
            0x00, 0x08, 0x00, 0x00, // length 8
        ];
        let packet = parse_ipv4_packet(&raw).unwrap();
        let line = print_ipv4(&packet);
        assert_eq!(line, "ip 28(20) udp 10.0.0.1,5001 > 10.0.0.2,53");
    }

    #[test]
    fn hex_dump_wraps_at_width() {
        let data: Vec<u8> = (0..6).collect();
        assert_eq!(hex_dump(&data, 4), "00 01 02 03\n04 05\n");
        assert_eq!(hex_dump(&[0xde, 0xad], 16), "de ad\n");
        assert_eq!(hex_dump(&[], 8), "\n");
    }
}
