#![forbid(unsafe_code)]

use packet_parser::{parse_ipv4_packet, parse_ipv6_packet, IpProtocol};
use rampart_config::{ConfigManager, ConfigPaths};
use rampart_core::{
    describe_pool_failure, format_node_addr, hex_dump, print_ipv4, print_ipv6, Action,
    FilterManager, FilterRule, FragConfig, PoolOp, RuleSubject, Verdict, VerdictSource,
};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

mod control;
use control::ControlLease;
mod runtime_config;
use runtime_config::load_runtime_config;
use utils::{config_root, hex_to_bytes, resolve_config_path};

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage_and_exit();
        return;
    };

    let result = match cmd.as_str() {
        "create-table" => cmd_create_table(args.collect()),
        "destroy-table" => cmd_destroy_table(args.collect()),
        "add-node" => cmd_add_node(args.collect()),
        "delete-node" => cmd_delete_node(args.collect()),
        "list-nodes" => cmd_list_nodes(args.collect()),
        "add-rule" => cmd_add_rule(args.collect()),
        "remove-rule" => cmd_remove_rule(args.collect()),
        "list-rules" => cmd_list_rules(args.collect()),
        "eval" => cmd_eval(args.collect()),
        "eval-batch" => cmd_eval_batch(args.collect()),
        "expire" => cmd_expire(args.collect()),
        "metrics" => cmd_metrics(args.collect()),
        "print-packet" => cmd_print_packet(args.collect()),
        "audit-status" => cmd_audit_status(),
        "show-config-root" => {
            println!("{}", config_root().display());
            Ok(())
        }
        _ => Err(format!("Unknown command: {}", cmd)),
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn default_paths() -> ConfigPaths {
    ConfigPaths::new(config_root())
}

fn frag_config() -> Result<FragConfig, String> {
    let runtime = load_runtime_config(&config_root())?;
    Ok(runtime.frag.to_frag_config())
}

// ---------------------------------------------------------------------------
// line formats

fn parse_proto(token: &str) -> Result<IpProtocol, String> {
    match token {
        "tcp" => Ok(IpProtocol::Tcp),
        "udp" => Ok(IpProtocol::Udp),
        "icmp" => Ok(IpProtocol::Icmpv4),
        "icmpv6" => Ok(IpProtocol::Icmpv6),
        other => other
            .parse::<u8>()
            .map(IpProtocol::from_raw)
            .map_err(|_| format!("unknown protocol '{other}'")),
    }
}

fn proto_token(protocol: IpProtocol) -> String {
    match protocol {
        IpProtocol::Tcp => "tcp".to_string(),
        IpProtocol::Udp => "udp".to_string(),
        IpProtocol::Icmpv4 => "icmp".to_string(),
        IpProtocol::Icmpv6 => "icmpv6".to_string(),
        IpProtocol::Other(v) => format!("{v}"),
    }
}

/// `<allow|deny> <any | cidr X | proto X> [keep-frags]`
fn parse_rule_line(line: &str) -> Result<FilterRule, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut iter = tokens.iter();
    let action = match iter.next() {
        Some(&"allow") => Action::Allow,
        Some(&"deny") => Action::Deny,
        other => return Err(format!("expected allow/deny, got {:?}", other)),
    };
    let subject = match iter.next() {
        Some(&"any") => RuleSubject::Any,
        Some(&"cidr") => {
            let cidr = iter.next().ok_or("cidr subject needs an address")?;
            RuleSubject::Cidr {
                network: rampart_core::parse_cidr(cidr)
                    .map_err(|e| format!("bad cidr '{cidr}': {e:?}"))?,
            }
        }
        Some(&"proto") => {
            let proto = iter.next().ok_or("proto subject needs a protocol")?;
            RuleSubject::Protocol {
                protocol: parse_proto(proto)?,
            }
        }
        other => return Err(format!("expected any/cidr/proto, got {:?}", other)),
    };
    let keep_frags = match iter.next() {
        None => false,
        Some(&"keep-frags") => true,
        Some(other) => return Err(format!("unexpected trailing token '{other}'")),
    };
    if iter.next().is_some() {
        return Err("trailing tokens after rule".into());
    }
    Ok(FilterRule {
        action,
        subject,
        keep_frags,
    })
}

fn format_rule_line(rule: &FilterRule) -> String {
    let action = match rule.action {
        Action::Allow => "allow",
        Action::Deny => "deny",
    };
    let subject = match &rule.subject {
        RuleSubject::Any => "any".to_string(),
        RuleSubject::Cidr { network } => format!(
            "cidr {}/{}",
            match network {
                rampart_core::Cidr::V4 { addr, .. } => addr.to_string(),
                rampart_core::Cidr::V6 { addr, .. } => addr.to_string(),
            },
            network.prefix_len()
        ),
        RuleSubject::Protocol { protocol } => format!("proto {}", proto_token(*protocol)),
    };
    if rule.keep_frags {
        format!("{action} {subject} keep-frags")
    } else {
        format!("{action} {subject}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolLine {
    Table {
        name: String,
        unit: u32,
    },
    Node {
        name: String,
        unit: u32,
        cidr: rampart_core::Cidr,
        group: String,
        ttl: u64,
    },
}

/// `table <name> <unit>` or `node <name> <unit> <cidr> <group> <ttl>`
fn parse_pool_line(line: &str) -> Result<PoolLine, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["table", name, unit] => Ok(PoolLine::Table {
            name: name.to_string(),
            unit: unit.parse().map_err(|_| "invalid unit".to_string())?,
        }),
        ["node", name, unit, cidr, group, ttl] => Ok(PoolLine::Node {
            name: name.to_string(),
            unit: unit.parse().map_err(|_| "invalid unit".to_string())?,
            cidr: rampart_core::parse_cidr(cidr)
                .map_err(|e| format!("bad cidr '{cidr}': {e:?}"))?,
            group: group.to_string(),
            ttl: ttl.parse().map_err(|_| "invalid ttl".to_string())?,
        }),
        _ => Err(format!("unrecognized pool line: {line}")),
    }
}

// ---------------------------------------------------------------------------
// config file plumbing

fn read_config_lines(path: &Path) -> Result<Vec<String>, String> {
    let file = File::open(path).map_err(|e| format!("open {}: {e}", path.display()))?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| format!("read {}: {e}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push(trimmed.to_string());
    }
    Ok(lines)
}

fn append_config_line(path: &Path, line: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("create dir {}: {e}", parent.display()))?;
    }
    let mut file = File::options()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    writeln!(file, "{line}").map_err(|e| format!("write {}: {e}", path.display()))
}

fn rewrite_config_lines(path: &Path, lines: &[String]) -> Result<(), String> {
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    std::fs::write(path, body).map_err(|e| format!("write {}: {e}", path.display()))
}

fn append_audit(paths: &ConfigPaths, op: &str, detail: &str) -> Result<(), String> {
    if let Some(parent) = paths.logs_audit.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("create dir {}: {e}", parent.display()))?;
    }
    let mut file = File::options()
        .create(true)
        .append(true)
        .open(&paths.logs_audit)
        .map_err(|e| format!("open audit log: {e}"))?;
    writeln!(
        file,
        "ts={} op={} {}",
        chrono::Utc::now().to_rfc3339(),
        op,
        detail
    )
    .map_err(|e| format!("write audit log: {e}"))
}

fn load_engine(
    filter_path: Option<&Path>,
    pools_path: Option<&Path>,
    frag: FragConfig,
) -> Result<FilterManager, String> {
    let mut mgr = FilterManager::new(frag)?;
    if let Some(path) = filter_path {
        if path.exists() {
            for (idx, line) in read_config_lines(path)?.iter().enumerate() {
                let rule = parse_rule_line(line)
                    .map_err(|e| format!("{}:{}: {e}", path.display(), idx + 1))?;
                mgr.add_rule(rule);
            }
        }
    }
    if let Some(path) = pools_path {
        if path.exists() {
            for (idx, line) in read_config_lines(path)?.iter().enumerate() {
                let parsed = parse_pool_line(line)
                    .map_err(|e| format!("{}:{}: {e}", path.display(), idx + 1))?;
                let (name, unit, op) = match parsed {
                    PoolLine::Table { name, unit } => (name, unit, PoolOp::CreateTable),
                    PoolLine::Node {
                        name,
                        unit,
                        cidr,
                        group,
                        ttl,
                    } => (name, unit, PoolOp::AddNode { cidr, group, ttl }),
                };
                mgr.pools().apply(&name, unit, op.clone()).map_err(|e| {
                    format!(
                        "{}:{}: {}",
                        path.display(),
                        idx + 1,
                        describe_pool_failure(&op, &name, e)
                    )
                })?;
            }
        }
    }
    Ok(mgr)
}

fn verdict_line(verdict: &Verdict) -> String {
    let action = match verdict.action {
        Action::Allow => "allow",
        Action::Deny => "deny",
    };
    let source = match verdict.source {
        VerdictSource::Rule => "rule",
        VerdictSource::FragCache => "frag-cache",
        VerdictSource::FragMiss => "frag-miss",
        VerdictSource::NoMatch => "no-match",
    };
    let mut line = format!("{action} source={source}");
    if let Some(id) = verdict.rule {
        line.push_str(&format!(" rule={id}"));
    }
    if verdict.duplicate {
        line.push_str(" duplicate");
    }
    line
}

fn evaluate_bytes(mgr: &mut FilterManager, bytes: &[u8]) -> Result<(Verdict, String), String> {
    match bytes.first().map(|b| *b >> 4) {
        Some(4) => {
            let packet = parse_ipv4_packet(bytes).map_err(|e| format!("parse ipv4: {e:?}"))?;
            let verdict = mgr.evaluate_ipv4(&packet);
            Ok((verdict, print_ipv4(&packet)))
        }
        Some(6) => {
            let packet = parse_ipv6_packet(bytes).map_err(|e| format!("parse ipv6: {e:?}"))?;
            let verdict = mgr.evaluate_ipv6(&packet);
            Ok((verdict, print_ipv6(&packet)))
        }
        Some(v) => Err(format!("unsupported ip version {v}")),
        None => Err("empty packet".into()),
    }
}

fn frag_stats_line(mgr: &FilterManager) -> String {
    let stats = mgr.frag_stats();
    format!(
        "Frag stats exists={} nomem={} new={} hits={} misses={} expired={} in_use={}",
        stats.exists, stats.nomem, stats.new, stats.hits, stats.misses, stats.expired, stats.in_use
    )
}

// ---------------------------------------------------------------------------
// pool control plane

struct PoolTarget {
    path: PathBuf,
    paths: ConfigPaths,
    _lease: ControlLease,
}

fn open_pool_target(pools_flag: Option<String>) -> Result<PoolTarget, String> {
    let paths = default_paths();
    let path = match pools_flag {
        Some(p) => resolve_config_path(&p, true)?,
        None => {
            let p = paths.pool_rules.to_string_lossy().to_string();
            resolve_config_path(&p, true)?
        }
    };
    let lease = ControlLease::acquire(&paths.control_lock)?;
    Ok(PoolTarget {
        path,
        paths,
        _lease: lease,
    })
}

fn cmd_create_table(args: Vec<String>) -> Result<(), String> {
    let mut name: Option<String> = None;
    let mut unit = 0u32;
    let mut pools: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => name = iter.next().cloned(),
            "--unit" => {
                unit = iter
                    .next()
                    .ok_or("Missing value for --unit")?
                    .parse()
                    .map_err(|_| "invalid unit")?
            }
            "--pools" => pools = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let name = name.ok_or("Missing --name <table>")?;
    let target = open_pool_target(pools)?;
    let mgr = load_engine(None, Some(&target.path), frag_config()?)?;
    mgr.pools()
        .apply(&name, unit, PoolOp::CreateTable)
        .map_err(|e| describe_pool_failure(&PoolOp::CreateTable, &name, e))?;
    append_config_line(&target.path, &format!("table {name} {unit}"))?;
    append_audit(&target.paths, "create-table", &format!("table={name} unit={unit}"))?;
    println!("Created table {name} unit {unit}");
    Ok(())
}

fn cmd_destroy_table(args: Vec<String>) -> Result<(), String> {
    let mut name: Option<String> = None;
    let mut unit = 0u32;
    let mut pools: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => name = iter.next().cloned(),
            "--unit" => {
                unit = iter
                    .next()
                    .ok_or("Missing value for --unit")?
                    .parse()
                    .map_err(|_| "invalid unit")?
            }
            "--pools" => pools = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let name = name.ok_or("Missing --name <table>")?;
    let target = open_pool_target(pools)?;
    let mgr = load_engine(None, Some(&target.path), frag_config()?)?;
    mgr.pools()
        .apply(&name, unit, PoolOp::DestroyTable)
        .map_err(|e| describe_pool_failure(&PoolOp::DestroyTable, &name, e))?;

    let mut lines = Vec::new();
    if target.path.exists() {
        for line in read_config_lines(&target.path)? {
            let keep = match parse_pool_line(&line)? {
                PoolLine::Table { name: n, unit: u } => !(n == name && u == unit),
                PoolLine::Node { name: n, unit: u, .. } => !(n == name && u == unit),
            };
            if keep {
                lines.push(line);
            }
        }
    }
    rewrite_config_lines(&target.path, &lines)?;
    append_audit(&target.paths, "destroy-table", &format!("table={name} unit={unit}"))?;
    println!("Destroyed table {name} unit {unit}");
    Ok(())
}

fn cmd_add_node(args: Vec<String>) -> Result<(), String> {
    let mut table: Option<String> = None;
    let mut unit = 0u32;
    let mut addr: Option<String> = None;
    let mut group: Option<String> = None;
    let mut ttl = 0u64;
    let mut pools: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--table" => table = iter.next().cloned(),
            "--unit" => {
                unit = iter
                    .next()
                    .ok_or("Missing value for --unit")?
                    .parse()
                    .map_err(|_| "invalid unit")?
            }
            "--addr" => addr = iter.next().cloned(),
            "--group" => group = iter.next().cloned(),
            "--ttl" => {
                ttl = iter
                    .next()
                    .ok_or("Missing value for --ttl")?
                    .parse()
                    .map_err(|_| "invalid ttl")?
            }
            "--pools" => pools = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let table = table.ok_or("Missing --table <name>")?;
    let addr = addr.ok_or("Missing --addr <cidr>")?;
    let group = group.ok_or("Missing --group <tag>")?;
    let cidr =
        rampart_core::parse_cidr(&addr).map_err(|e| format!("bad cidr '{addr}': {e:?}"))?;

    let target = open_pool_target(pools)?;
    let mgr = load_engine(None, Some(&target.path), frag_config()?)?;
    let op = PoolOp::AddNode {
        cidr: cidr.clone(),
        group: group.clone(),
        ttl,
    };
    mgr.pools()
        .apply(&table, unit, op.clone())
        .map_err(|e| describe_pool_failure(&op, &table, e))?;
    append_config_line(
        &target.path,
        &format!("node {table} {unit} {}/{} {group} {ttl}", cidr_addr(&cidr), cidr.prefix_len()),
    )?;
    append_audit(
        &target.paths,
        "add-node",
        &format!("table={table} unit={unit} node={} group={group}", format_node_addr(&cidr)),
    )?;
    println!("Added {} to table {table}", format_node_addr(&cidr));
    Ok(())
}

fn cmd_delete_node(args: Vec<String>) -> Result<(), String> {
    let mut table: Option<String> = None;
    let mut unit = 0u32;
    let mut addr: Option<String> = None;
    let mut group: Option<String> = None;
    let mut pools: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--table" => table = iter.next().cloned(),
            "--unit" => {
                unit = iter
                    .next()
                    .ok_or("Missing value for --unit")?
                    .parse()
                    .map_err(|_| "invalid unit")?
            }
            "--addr" => addr = iter.next().cloned(),
            "--group" => group = iter.next().cloned(),
            "--pools" => pools = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let table = table.ok_or("Missing --table <name>")?;
    let addr = addr.ok_or("Missing --addr <cidr>")?;
    let group = group.ok_or("Missing --group <tag>")?;
    let cidr =
        rampart_core::parse_cidr(&addr).map_err(|e| format!("bad cidr '{addr}': {e:?}"))?;

    let target = open_pool_target(pools)?;
    let mgr = load_engine(None, Some(&target.path), frag_config()?)?;
    let op = PoolOp::DeleteNode {
        cidr: cidr.clone(),
        group: group.clone(),
    };
    mgr.pools()
        .apply(&table, unit, op.clone())
        .map_err(|e| describe_pool_failure(&op, &table, e))?;

    let mut removed = false;
    let mut lines = Vec::new();
    for line in read_config_lines(&target.path)? {
        let keep = match parse_pool_line(&line)? {
            PoolLine::Node {
                name: n,
                unit: u,
                cidr: c,
                group: g,
                ..
            } if !removed && n == table && u == unit && c == cidr && g == group => {
                removed = true;
                false
            }
            _ => true,
        };
        if keep {
            lines.push(line);
        }
    }
    rewrite_config_lines(&target.path, &lines)?;
    append_audit(
        &target.paths,
        "delete-node",
        &format!("table={table} unit={unit} node={} group={group}", format_node_addr(&cidr)),
    )?;
    println!("Deleted {} from table {table}", format_node_addr(&cidr));
    Ok(())
}

fn cmd_list_nodes(args: Vec<String>) -> Result<(), String> {
    let mut table: Option<String> = None;
    let mut unit = 0u32;
    let mut pools: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--table" => table = iter.next().cloned(),
            "--unit" => {
                unit = iter
                    .next()
                    .ok_or("Missing value for --unit")?
                    .parse()
                    .map_err(|_| "invalid unit")?
            }
            "--pools" => pools = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let table = table.ok_or("Missing --table <name>")?;
    let paths = default_paths();
    let path = match pools {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.pool_rules.clone(),
    };
    let mgr = load_engine(None, Some(&path), frag_config()?)?;
    let nodes = mgr
        .pools()
        .list_nodes(&table, unit)
        .map_err(|e| format!("list table '{table}': {e}"))?;
    for (idx, node) in nodes.iter().enumerate() {
        let ttl = match node.die {
            Some(die) => format!("ttl={die}"),
            None => "permanent".to_string(),
        };
        println!(
            "{}: {} group={} {}",
            idx + 1,
            format_node_addr(&node.cidr),
            node.group,
            ttl
        );
    }
    Ok(())
}

fn cidr_addr(cidr: &rampart_core::Cidr) -> String {
    match cidr {
        rampart_core::Cidr::V4 { addr, .. } => addr.to_string(),
        rampart_core::Cidr::V6 { addr, .. } => addr.to_string(),
    }
}

// ---------------------------------------------------------------------------
// filter rules

fn cmd_add_rule(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut rule_line: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--rule" => rule_line = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, true)?,
        None => resolve_config_path(&paths.filter_rules.to_string_lossy(), true)?,
    };
    let rule_line = rule_line.ok_or("Missing --rule \"<rule line>\"")?;
    let _lease = ControlLease::acquire(&paths.control_lock)?;
    let rule = parse_rule_line(&rule_line).map_err(|e| format!("Invalid rule: {e}"))?;
    append_config_line(&rules_path, &format_rule_line(&rule))?;
    append_audit(&paths, "add-rule", &format!("rule=\"{rule_line}\""))?;
    println!("Added rule to {}", rules_path.display());
    Ok(())
}

fn cmd_remove_rule(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut id: Option<usize> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--id" => {
                id = iter
                    .next()
                    .map(|s| s.parse::<usize>().map_err(|_| "invalid id".to_string()))
                    .transpose()?
            }
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, true)?,
        None => resolve_config_path(&paths.filter_rules.to_string_lossy(), true)?,
    };
    let id = id.ok_or("Missing --id <number>")?;
    let _lease = ControlLease::acquire(&paths.control_lock)?;
    let mut lines = read_config_lines(&rules_path)?;
    if id == 0 || id > lines.len() {
        return Err(format!("no rule with id {id}"));
    }
    lines.remove(id - 1);
    rewrite_config_lines(&rules_path, &lines)?;
    append_audit(&paths, "remove-rule", &format!("id={id}"))?;
    println!("Removed rule {id}");
    Ok(())
}

fn cmd_list_rules(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.filter_rules.clone(),
    };
    if !rules_path.exists() {
        return Ok(());
    }
    for (idx, line) in read_config_lines(&rules_path)?.iter().enumerate() {
        println!("{}: {}", idx + 1, line);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// data plane

fn cmd_eval(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut pools_path: Option<String> = None;
    let mut hex: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--pools" => pools_path = iter.next().cloned(),
            "--hex" => hex = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let hex = hex.ok_or("Missing --hex <packet bytes>")?;
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.filter_rules.clone(),
    };
    let pools_path = match pools_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.pool_rules.clone(),
    };
    let mut mgr = load_engine(Some(&rules_path), Some(&pools_path), frag_config()?)?;
    let bytes = hex_to_bytes(&hex)?;
    let (verdict, line) = evaluate_bytes(&mut mgr, &bytes)?;
    println!("{line}");
    println!("{}", verdict_line(&verdict));
    Ok(())
}

fn cmd_eval_batch(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut pools_path: Option<String> = None;
    let mut file: Option<String> = None;
    let mut expire_every: Option<usize> = None;
    let mut quiet = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--pools" => pools_path = iter.next().cloned(),
            "--file" => file = iter.next().cloned(),
            "--expire-every" => {
                expire_every = Some(
                    iter.next()
                        .ok_or("Missing value for --expire-every")?
                        .parse()
                        .map_err(|_| "invalid expire interval")?,
                )
            }
            "--quiet" => quiet = true,
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let file = file.ok_or("Missing --file <hex lines>")?;
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.filter_rules.clone(),
    };
    let pools_path = match pools_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.pool_rules.clone(),
    };
    let mut mgr = load_engine(Some(&rules_path), Some(&pools_path), frag_config()?)?;

    let reader = BufReader::new(
        File::open(&file).map_err(|e| format!("open {file}: {e}"))?,
    );
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("read {file}: {e}"))?
        .into_iter()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .collect();

    // decode in parallel, evaluate in arrival order
    let decoded: Vec<Result<Vec<u8>, String>> =
        lines.par_iter().map(|l| hex_to_bytes(l)).collect();

    let mut allowed = 0usize;
    let mut dropped = 0usize;
    let mut errors = 0usize;
    for (idx, bytes) in decoded.iter().enumerate() {
        let outcome = match bytes {
            Ok(bytes) => evaluate_bytes(&mut mgr, bytes),
            Err(e) => Err(e.clone()),
        };
        match outcome {
            Ok((verdict, _)) => {
                match verdict.action {
                    Action::Allow => allowed += 1,
                    Action::Deny => dropped += 1,
                }
                if !quiet {
                    println!("{}: {}", idx + 1, verdict_line(&verdict));
                }
            }
            Err(e) => {
                errors += 1;
                if !quiet {
                    println!("{}: error {e}", idx + 1);
                }
            }
        }
        if let Some(every) = expire_every {
            if every > 0 && (idx + 1) % every == 0 {
                mgr.expire();
            }
        }
    }
    println!(
        "Processed {} packets: allowed={} dropped={} errors={}",
        decoded.len(),
        allowed,
        dropped,
        errors
    );
    println!("{}", frag_stats_line(&mgr));
    Ok(())
}

fn cmd_expire(args: Vec<String>) -> Result<(), String> {
    let mut pools: Option<String> = None;
    let mut ticks = 1u64;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--pools" => pools = iter.next().cloned(),
            "--ticks" => {
                ticks = iter
                    .next()
                    .ok_or("Missing value for --ticks")?
                    .parse()
                    .map_err(|_| "invalid tick count")?
            }
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let target = open_pool_target(pools)?;
    let mgr = load_engine(None, Some(&target.path), frag_config()?)?;
    let mut removed = 0usize;
    for _ in 0..ticks {
        removed += mgr.pools().expire_tick();
    }

    // persist the survivors with their remaining lifetime
    let now = mgr.pools().tick();
    let mut lines = Vec::new();
    for (id, _) in mgr.pools().summary() {
        lines.push(format!("table {} {}", id.name, id.unit));
        for node in mgr
            .pools()
            .list_nodes(&id.name, id.unit)
            .map_err(|e| format!("list table '{}': {e}", id.name))?
        {
            let ttl = match node.die {
                Some(die) => die - now,
                None => 0,
            };
            lines.push(format!(
                "node {} {} {}/{} {} {}",
                id.name,
                id.unit,
                cidr_addr(&node.cidr),
                node.cidr.prefix_len(),
                node.group,
                ttl
            ));
        }
    }
    rewrite_config_lines(&target.path, &lines)?;
    append_audit(
        &target.paths,
        "expire",
        &format!("ticks={ticks} removed={removed}"),
    )?;
    println!("Expired {removed} pool nodes over {ticks} ticks");
    Ok(())
}

// ---------------------------------------------------------------------------
// diagnostics

fn cmd_metrics(args: Vec<String>) -> Result<(), String> {
    let mut rules_path: Option<String> = None;
    let mut pools_path: Option<String> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--rules" => rules_path = iter.next().cloned(),
            "--pools" => pools_path = iter.next().cloned(),
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let paths = default_paths();
    let rules_path = match rules_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.filter_rules.clone(),
    };
    let pools_path = match pools_path {
        Some(p) => resolve_config_path(&p, false)?,
        None => paths.pool_rules.clone(),
    };
    let frag = frag_config()?;
    println!(
        "Frag cache capacity={} buckets={} default_ttl={}",
        frag.capacity, frag.buckets, frag.default_ttl
    );
    let mgr = load_engine(Some(&rules_path), Some(&pools_path), frag)?;
    println!("{}", frag_stats_line(&mgr));
    println!("Rules loaded={}", mgr.rules().len());
    for (id, count) in mgr.pools().summary() {
        println!("Pool table {} unit {}: {} nodes", id.name, id.unit, count);
    }
    let config = ConfigManager::new(config_root())?;
    let snap = config.snapshot();
    println!(
        "Config version={} tampered={}",
        snap.version, snap.tampered
    );
    Ok(())
}

fn cmd_print_packet(args: Vec<String>) -> Result<(), String> {
    let mut hex: Option<String> = None;
    let mut mode = "symbolic".to_string();
    let mut width = 16usize;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--hex" => hex = iter.next().cloned(),
            "--mode" => {
                if let Some(m) = iter.next() {
                    mode = m.clone();
                }
            }
            "--width" => {
                width = iter
                    .next()
                    .ok_or("Missing value for --width")?
                    .parse()
                    .map_err(|_| "invalid width")?
            }
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let hex = hex.ok_or("Missing --hex <packet bytes>")?;
    let bytes = hex_to_bytes(&hex)?;
    match mode.as_str() {
        "hex" => print!("{}", hex_dump(&bytes, width)),
        "symbolic" => match bytes.first().map(|b| *b >> 4) {
            Some(4) => {
                let packet =
                    parse_ipv4_packet(&bytes).map_err(|e| format!("parse ipv4: {e:?}"))?;
                println!("{}", print_ipv4(&packet));
            }
            Some(6) => {
                let packet =
                    parse_ipv6_packet(&bytes).map_err(|e| format!("parse ipv6: {e:?}"))?;
                println!("{}", print_ipv6(&packet));
            }
            Some(v) => return Err(format!("unsupported ip version {v}")),
            None => return Err("empty packet".into()),
        },
        other => return Err(format!("unknown mode '{other}' (symbolic|hex)")),
    }
    Ok(())
}

fn cmd_audit_status() -> Result<(), String> {
    let config = ConfigManager::new(config_root())?;
    let snap = config.snapshot();
    println!("Config root: {}", snap.paths.root.display());
    println!("Version: {}", snap.version);
    println!("Hash: {}", snap.hash_hex);
    println!("Tampered: {}", snap.tampered);
    Ok(())
}

fn print_usage_and_exit() {
    eprintln!("Usage: rampart <command> [flags]");
    eprintln!();
    eprintln!("Pool control plane:");
    eprintln!("  create-table --name <t> [--unit <n>] [--pools <file>]");
    eprintln!("  destroy-table --name <t> [--unit <n>] [--pools <file>]");
    eprintln!("  add-node --table <t> --addr <cidr> --group <g> [--ttl <n>] [--unit <n>]");
    eprintln!("  delete-node --table <t> --addr <cidr> --group <g> [--unit <n>]");
    eprintln!("  list-nodes --table <t> [--unit <n>]");
    eprintln!();
    eprintln!("Filter rules:");
    eprintln!("  add-rule --rule \"<allow|deny> <any|cidr X|proto X> [keep-frags]\"");
    eprintln!("  remove-rule --id <n>");
    eprintln!("  list-rules");
    eprintln!();
    eprintln!("Data plane and diagnostics:");
    eprintln!("  eval --hex <bytes>");
    eprintln!("  eval-batch --file <hex lines> [--expire-every <n>] [--quiet]");
    eprintln!("  expire [--ticks <n>]");
    eprintln!("  metrics");
    eprintln!("  print-packet --hex <bytes> [--mode symbolic|hex] [--width <n>]");
    eprintln!("  audit-status");
    eprintln!("  show-config-root");
    std::process::exit(1);
}
