#![forbid(unsafe_code)]

use crate::Cidr;
use packet_parser::IpProtocol;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSubject {
    Cidr { network: Cidr },
    Protocol { protocol: IpProtocol },
    Any,
}

/// One filter rule. `keep_frags` marks the rule as fragment-tracking: a
/// first fragment admitted by it seeds the fragment cache so continuation
/// fragments inherit the same decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: Action,
    pub subject: RuleSubject,
    pub keep_frags: bool,
}

impl FilterRule {
    fn matches(&self, src: &IpAddr, dst: &IpAddr, protocol: IpProtocol) -> bool {
        match &self.subject {
            RuleSubject::Cidr { network } => network.contains(src) || network.contains(dst),
            RuleSubject::Protocol {
                protocol: rule_proto,
            } => *rule_proto == protocol,
            RuleSubject::Any => true,
        }
    }
}

/// Ordered rule list, first match wins.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<(u64, FilterRule)>,
    next_id: u64,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet {
            rules: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add_rule(&mut self, rule: FilterRule) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.rules.push((id, rule));
        id
    }

    pub fn remove_rule(&mut self, id: u64) -> bool {
        if let Some(pos) = self.rules.iter().position(|(rid, _)| *rid == id) {
            self.rules.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn list(&self) -> &[(u64, FilterRule)] {
        &self.rules
    }

    pub fn get(&self, id: u64) -> Option<&FilterRule> {
        self.rules
            .iter()
            .find(|(rid, _)| *rid == id)
            .map(|(_, rule)| rule)
    }

    pub fn match_packet(
        &self,
        src: &IpAddr,
        dst: &IpAddr,
        protocol: IpProtocol,
    ) -> Option<(u64, &FilterRule)> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.matches(src, dst, protocol))
            .map(|(id, rule)| (*id, rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_cidr;

    fn cidr_rule(network: &str, action: Action) -> FilterRule {
        FilterRule {
            action,
            subject: RuleSubject::Cidr {
                network: parse_cidr(network).unwrap(),
            },
            keep_frags: false,
        }
    }

    #[test]
    fn first_match_wins() {
        let mut rules = RuleSet::new();
        rules.add_rule(cidr_rule("10.1.0.0/16", Action::Deny));
        rules.add_rule(cidr_rule("10.0.0.0/8", Action::Allow));

        let src: IpAddr = "10.1.2.3".parse().unwrap();
        let dst: IpAddr = "192.168.1.1".parse().unwrap();
        let (_, rule) = rules.match_packet(&src, &dst, IpProtocol::Tcp).unwrap();
        assert_eq!(rule.action, Action::Deny);
    }

    #[test]
    fn removal_frees_the_id() {
        let mut rules = RuleSet::new();
        let id = rules.add_rule(cidr_rule("10.0.0.0/8", Action::Allow));
        assert!(rules.remove_rule(id));
        assert!(!rules.remove_rule(id));
        assert!(rules.get(id).is_none());
    }

    #[test]
    fn protocol_and_any_subjects() {
        let mut rules = RuleSet::new();
        rules.add_rule(FilterRule {
            action: Action::Deny,
            subject: RuleSubject::Protocol {
                protocol: IpProtocol::Udp,
            },
            keep_frags: false,
        });
        rules.add_rule(FilterRule {
            action: Action::Allow,
            subject: RuleSubject::Any,
            keep_frags: false,
        });

        let src: IpAddr = "172.16.0.1".parse().unwrap();
        let dst: IpAddr = "172.16.0.2".parse().unwrap();
        let (_, udp) = rules.match_packet(&src, &dst, IpProtocol::Udp).unwrap();
        assert_eq!(udp.action, Action::Deny);
        let (_, tcp) = rules.match_packet(&src, &dst, IpProtocol::Tcp).unwrap();
        assert_eq!(tcp.action, Action::Allow);
    }
}
