#![forbid(unsafe_code)]

use packet_parser::{IpProtocol, Ipv4Packet, Ipv6Packet, ParseError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

mod frag;
mod lock;
mod pool;
mod printer;
mod rules;

pub use frag::*;
pub use lock::*;
pub use pool::*;
pub use printer::*;
pub use rules::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cidr {
    V4 { addr: Ipv4Addr, prefix: u8 },
    V6 { addr: Ipv6Addr, prefix: u8 },
}

impl Cidr {
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (Cidr::V4 { addr: net, prefix }, IpAddr::V4(ip)) => {
                let net = u32::from_be_bytes(net.octets());
                let ip = u32::from_be_bytes(ip.octets());
                let mask = mask_v4(*prefix);
                (net & mask) == (ip & mask)
            }
            (Cidr::V6 { addr: net, prefix }, IpAddr::V6(ip)) => {
                let net = u128::from_be_bytes(net.octets());
                let ip = u128::from_be_bytes(ip.octets());
                let mask = mask_v6(*prefix);
                (net & mask) == (ip & mask)
            }
            _ => false,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Cidr::V4 { prefix, .. } => *prefix,
            Cidr::V6 { prefix, .. } => *prefix,
        }
    }
}

pub fn parse_cidr(input: &str) -> Result<Cidr, ParseError> {
    let parts: Vec<&str> = input.split('/').collect();
    if parts.len() != 2 {
        return Err(ParseError::Invalid("cidr format"));
    }
    let ip: IpAddr = parts[0].parse().map_err(|_| ParseError::Invalid("ip"))?;
    let prefix: u8 = parts[1]
        .parse()
        .map_err(|_| ParseError::Invalid("prefix"))?;
    match ip {
        IpAddr::V4(v4) => {
            if prefix > 32 {
                return Err(ParseError::Invalid("prefix >32"));
            }
            Ok(Cidr::V4 { addr: v4, prefix })
        }
        IpAddr::V6(v6) => {
            if prefix > 128 {
                return Err(ParseError::Invalid("prefix >128"));
            }
            Ok(Cidr::V6 { addr: v6, prefix })
        }
    }
}

pub fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

pub fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    /// Matched a rule directly.
    Rule,
    /// Continuation fragment resolved through the fragment cache.
    FragCache,
    /// Continuation fragment with no cache entry; dropped fail-closed.
    FragMiss,
    /// No rule matched; dropped fail-closed.
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub rule: Option<u64>,
    pub source: VerdictSource,
    pub duplicate: bool,
}

/// Composes the rule set, the fragment cache, and the pool engine into one
/// data-plane entry point.
#[derive(Debug)]
pub struct FilterManager {
    rules: RuleSet,
    frags: FragmentCache,
    pools: PoolEngine,
}

impl FilterManager {
    pub fn new(frag_config: FragConfig) -> Result<Self, String> {
        let discipline = frag_config.discipline;
        Ok(FilterManager {
            rules: RuleSet::new(),
            frags: FragmentCache::new(frag_config)?,
            pools: PoolEngine::new(discipline),
        })
    }

    pub fn add_rule(&mut self, rule: FilterRule) -> u64 {
        self.rules.add_rule(rule)
    }

    /// Remove a rule and invalidate every fragment-cache entry that still
    /// references it. Returns (removed, entries forgotten).
    pub fn remove_rule(&mut self, id: u64) -> (bool, usize) {
        let removed = self.rules.remove_rule(id);
        let forgotten = if removed { self.frags.forget(id) } else { 0 };
        (removed, forgotten)
    }

    pub fn rules(&self) -> &[(u64, FilterRule)] {
        self.rules.list()
    }

    pub fn pools(&self) -> &PoolEngine {
        &self.pools
    }

    pub fn frag_stats(&self) -> FragStats {
        self.frags.stats()
    }

    /// One timer tick: age the fragment cache and the pool tables.
    /// Returns (fragments expired, pool nodes expired).
    pub fn expire(&self) -> (usize, usize) {
        (self.frags.expire_all(), self.pools.expire_tick())
    }

    pub fn unload(&self) {
        self.frags.unload();
    }

    pub fn evaluate_ipv4(&mut self, packet: &Ipv4Packet<'_>) -> Verdict {
        let frag = packet.fragment();
        let key = FragKey {
            src: IpAddr::V4(Ipv4Addr::from(packet.source)),
            dst: IpAddr::V4(Ipv4Addr::from(packet.destination)),
            protocol: packet.protocol.as_u8(),
            id: packet.identification,
            tos: packet.tos,
        };
        let end = frag.end_offset(packet.payload.len());
        if frag.offset != 0 {
            return self.continuation(key, end, frag.more_fragments);
        }
        self.first_packet(key, end, frag.is_first(), packet.protocol)
    }

    pub fn evaluate_ipv6(&mut self, packet: &Ipv6Packet<'_>) -> Verdict {
        let src = IpAddr::V6(Ipv6Addr::from(packet.source));
        let dst = IpAddr::V6(Ipv6Addr::from(packet.destination));
        let key = FragKey {
            src,
            dst,
            protocol: packet.next_header.as_u8(),
            id: packet.fragment.map(|f| f.identification).unwrap_or(0),
            tos: packet.traffic_class,
        };
        match packet.fragment {
            Some(frag) if frag.offset != 0 => {
                let end = frag.end_offset(packet.payload.len());
                self.continuation(key, end, frag.more_fragments)
            }
            Some(frag) => {
                let end = frag.end_offset(packet.payload.len());
                self.first_packet(key, end, frag.is_first(), packet.next_header)
            }
            None => self.first_packet(key, 0, false, packet.next_header),
        }
    }

    fn first_packet(
        &mut self,
        key: FragKey,
        end: u16,
        first_fragment: bool,
        protocol: IpProtocol,
    ) -> Verdict {
        match self.rules.match_packet(&key.src, &key.dst, protocol) {
            Some((id, rule)) => {
                let action = rule.action;
                if rule.keep_frags && first_fragment {
                    // Exists and NoMemory are counted in the cache stats;
                    // the verdict for this packet stands either way.
                    let _ = self.frags.new_fragment(key, end, id);
                }
                Verdict {
                    action,
                    rule: Some(id),
                    source: VerdictSource::Rule,
                    duplicate: false,
                }
            }
            None => Verdict {
                action: Action::Deny,
                rule: None,
                source: VerdictSource::NoMatch,
                duplicate: false,
            },
        }
    }

    fn continuation(&mut self, key: FragKey, end: u16, more_fragments: bool) -> Verdict {
        match self.frags.known_fragment(key, end, more_fragments) {
            Some(hit) => {
                let action = self
                    .rules
                    .get(hit.rule)
                    .map(|r| r.action)
                    .unwrap_or(Action::Deny);
                Verdict {
                    action,
                    rule: Some(hit.rule),
                    source: VerdictSource::FragCache,
                    duplicate: hit.duplicate,
                }
            }
            None => Verdict {
                action: Action::Deny,
                rule: None,
                source: VerdictSource::FragMiss,
                duplicate: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_parser::parse_ipv4_packet;

    fn manager() -> FilterManager {
        FilterManager::new(FragConfig {
            capacity: 64,
            default_ttl: 5,
            discipline: LockDiscipline::Strict,
            ..FragConfig::default()
        })
        .unwrap()
    }

    fn keep_rule(network: &str) -> FilterRule {
        FilterRule {
            action: Action::Allow,
            subject: RuleSubject::Cidr {
                network: parse_cidr(network).unwrap(),
            },
            keep_frags: true,
        }
    }

    fn ipv4_fragment(id: u16, flags_frag: u16, payload_len: usize) -> Vec<u8> {
        let total = 20 + payload_len;
        let mut buf = vec![
            0x45,
            0x00,
            (total >> 8) as u8,
            total as u8,
            (id >> 8) as u8,
            id as u8,
            (flags_frag >> 8) as u8,
            flags_frag as u8,
            0x40,
            6, // tcp
            0x00,
            0x00,
            10,
            0,
            0,
            1,
            10,
            0,
            0,
            2,
        ];
        buf.extend(std::iter::repeat(0).take(payload_len));
        buf
    }

    #[test]
    fn fragment_flow_end_to_end() {
        let mut mgr = manager();
        let rule = mgr.add_rule(keep_rule("10.0.0.0/8"));

        // first fragment: admitted by the rule, seeds the cache
        let raw = ipv4_fragment(4242, 0x2000, 24);
        let first = parse_ipv4_packet(&raw).unwrap();
        let verdict = mgr.evaluate_ipv4(&first);
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.source, VerdictSource::Rule);
        assert_eq!(mgr.frag_stats().in_use, 1);

        // continuation resolves through the cache, not the rules
        let raw = ipv4_fragment(4242, 0x2003, 24);
        let cont = parse_ipv4_packet(&raw).unwrap();
        let verdict = mgr.evaluate_ipv4(&cont);
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.rule, Some(rule));
        assert_eq!(verdict.source, VerdictSource::FragCache);

        // final fragment completes the datagram
        let raw = ipv4_fragment(4242, 0x0006, 24);
        let last = parse_ipv4_packet(&raw).unwrap();
        let verdict = mgr.evaluate_ipv4(&last);
        assert_eq!(verdict.source, VerdictSource::FragCache);
        assert_eq!(mgr.frag_stats().in_use, 0);
    }

    #[test]
    fn continuation_without_entry_is_dropped() {
        let mut mgr = manager();
        mgr.add_rule(keep_rule("10.0.0.0/8"));
        let raw = ipv4_fragment(7, 0x2003, 24);
        let cont = parse_ipv4_packet(&raw).unwrap();
        let verdict = mgr.evaluate_ipv4(&cont);
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.source, VerdictSource::FragMiss);
        assert_eq!(mgr.frag_stats().misses, 1);
    }

    #[test]
    fn rule_removal_forgets_cached_fragments() {
        let mut mgr = manager();
        let rule = mgr.add_rule(keep_rule("10.0.0.0/8"));

        let raw = ipv4_fragment(1, 0x2000, 24);
        mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        let raw = ipv4_fragment(2, 0x2000, 24);
        mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(mgr.frag_stats().in_use, 2);

        let (removed, forgotten) = mgr.remove_rule(rule);
        assert!(removed);
        assert_eq!(forgotten, 2);
        assert_eq!(mgr.frag_stats().in_use, 0);

        // continuation fragments of either datagram now miss
        let raw = ipv4_fragment(1, 0x2003, 24);
        let verdict = mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(verdict.source, VerdictSource::FragMiss);
        assert_ne!(verdict.rule, Some(rule));
    }

    #[test]
    fn lookup_refresh_then_full_expiry_cycle() {
        // insert key id=4242 with rule R1, ttl 5; a lookup refreshes the
        // ttl; five sweeps with no further lookups evict the entry with
        // exactly one expiry counted and no hits counted.
        let mut mgr = manager();
        let r1 = mgr.add_rule(keep_rule("10.0.0.0/8"));

        let raw = ipv4_fragment(4242, 0x2000, 24);
        mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());

        let raw = ipv4_fragment(4242, 0x2003, 24);
        let verdict = mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(verdict.rule, Some(r1));

        let hits_before = mgr.frag_stats().hits;
        let expired_before = mgr.frag_stats().expired;
        for _ in 0..5 {
            mgr.expire();
        }
        let stats = mgr.frag_stats();
        assert_eq!(stats.expired, expired_before + 1);
        assert_eq!(stats.hits, hits_before);

        let raw = ipv4_fragment(4242, 0x2006, 24);
        let verdict = mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(verdict.source, VerdictSource::FragMiss);
    }

    #[test]
    fn plain_packets_never_touch_the_cache() {
        let mut mgr = manager();
        mgr.add_rule(keep_rule("10.0.0.0/8"));
        let raw = ipv4_fragment(5, 0x0000, 24);
        let verdict = mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(mgr.frag_stats().in_use, 0);
        assert_eq!(mgr.frag_stats().new, 0);
    }

    #[test]
    fn no_rule_means_deny_and_no_cache_entry() {
        let mut mgr = manager();
        let raw = ipv4_fragment(5, 0x2000, 24);
        let verdict = mgr.evaluate_ipv4(&parse_ipv4_packet(&raw).unwrap());
        assert_eq!(verdict.action, Action::Deny);
        assert_eq!(verdict.source, VerdictSource::NoMatch);
        assert_eq!(mgr.frag_stats().in_use, 0);
    }

    #[test]
    fn cidr_containment() {
        let cidr = parse_cidr("10.1.0.0/16").unwrap();
        assert!(cidr.contains(&"10.1.200.3".parse().unwrap()));
        assert!(!cidr.contains(&"10.2.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"2001:db8::1".parse().unwrap()));

        let v6 = parse_cidr("2001:db8::/32").unwrap();
        assert!(v6.contains(&"2001:db8:1::1".parse().unwrap()));
        assert!(!v6.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn parse_cidr_rejects_garbage() {
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("2001:db8::/129").is_err());
        assert!(parse_cidr("hosts/8").is_err());
    }
}
