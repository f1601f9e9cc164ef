#![forbid(unsafe_code)]

use crate::lock::{CheckedMutex, LockDiscipline};
use crate::{mask_v4, Cidr};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Longest table name accepted by the control plane.
pub const POOL_NAME_MAX: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Cidr {
    pub fn family(&self) -> Family {
        match self {
            Cidr::V4 { .. } => Family::V4,
            Cidr::V6 { .. } => Family::V6,
        }
    }
}

/// One entry of a lookup table. `die` is the absolute engine tick at which
/// the node expires; `None` means permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolNode {
    pub cidr: Cidr,
    pub group: String,
    pub die: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub name: String,
    pub unit: u32,
}

#[derive(Debug, Default)]
struct PoolTable {
    family: Option<Family>,
    nodes: Vec<PoolNode>,
}

/// Control-plane mutations. Tables and nodes are only ever changed through
/// these; the data-plane side of the engine is `lookup` alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOp {
    CreateTable,
    DestroyTable,
    AddNode { cidr: Cidr, group: String, ttl: u64 },
    DeleteNode { cidr: Cidr, group: String },
}

impl PoolOp {
    pub fn verb(&self) -> &'static str {
        match self {
            PoolOp::CreateTable => "create",
            PoolOp::DestroyTable => "destroy",
            PoolOp::AddNode { .. } => "add",
            PoolOp::DeleteNode { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    NoSuchTable,
    TableExists,
    Exists,
    NotFound,
    BadName,
    FamilyMismatch,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PoolError::NoSuchTable => "no such table",
            PoolError::TableExists => "table already exists",
            PoolError::Exists => "node already exists",
            PoolError::NotFound => "node not found",
            PoolError::BadName => "bad table name",
            PoolError::FamilyMismatch => "address family does not match table",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
struct PoolState {
    tables: HashMap<TableId, PoolTable>,
    tick: u64,
}

/// Named, unit-scoped lookup tables of address/mask/group entries.
#[derive(Debug)]
pub struct PoolEngine {
    state: CheckedMutex<PoolState>,
}

impl PoolEngine {
    pub fn new(discipline: LockDiscipline) -> Self {
        PoolEngine {
            state: CheckedMutex::new(
                "pool-engine",
                discipline,
                PoolState {
                    tables: HashMap::new(),
                    tick: 0,
                },
            ),
        }
    }

    /// Apply one control-plane operation to the named table.
    pub fn apply(&self, name: &str, unit: u32, op: PoolOp) -> Result<(), PoolError> {
        if name.is_empty() || name.len() > POOL_NAME_MAX {
            return Err(PoolError::BadName);
        }
        let id = TableId {
            name: name.to_string(),
            unit,
        };
        let mut state = self.state.enter();
        match op {
            PoolOp::CreateTable => {
                if state.tables.contains_key(&id) {
                    return Err(PoolError::TableExists);
                }
                state.tables.insert(id, PoolTable::default());
                Ok(())
            }
            PoolOp::DestroyTable => match state.tables.remove(&id) {
                Some(_) => Ok(()),
                None => Err(PoolError::NoSuchTable),
            },
            PoolOp::AddNode { cidr, group, ttl } => {
                let tick = state.tick;
                let table = state.tables.get_mut(&id).ok_or(PoolError::NoSuchTable)?;
                if let Some(family) = table.family {
                    if family != cidr.family() {
                        return Err(PoolError::FamilyMismatch);
                    }
                }
                if table
                    .nodes
                    .iter()
                    .any(|n| n.cidr == cidr && n.group == group)
                {
                    return Err(PoolError::Exists);
                }
                table.family = Some(cidr.family());
                table.nodes.push(PoolNode {
                    cidr,
                    group,
                    die: if ttl == 0 { None } else { Some(tick + ttl) },
                });
                Ok(())
            }
            PoolOp::DeleteNode { cidr, group } => {
                let table = state.tables.get_mut(&id).ok_or(PoolError::NoSuchTable)?;
                match table
                    .nodes
                    .iter()
                    .position(|n| n.cidr == cidr && n.group == group)
                {
                    Some(pos) => {
                        table.nodes.remove(pos);
                        Ok(())
                    }
                    None => Err(PoolError::NotFound),
                }
            }
        }
    }

    /// Longest-prefix match of `addr` in the named table.
    pub fn lookup(&self, name: &str, unit: u32, addr: &IpAddr) -> Option<String> {
        let id = TableId {
            name: name.to_string(),
            unit,
        };
        let state = self.state.enter();
        let table = state.tables.get(&id)?;
        table
            .nodes
            .iter()
            .filter(|n| n.cidr.contains(addr))
            .max_by_key(|n| n.cidr.prefix_len())
            .map(|n| n.group.clone())
    }

    pub fn list_nodes(&self, name: &str, unit: u32) -> Result<Vec<PoolNode>, PoolError> {
        let id = TableId {
            name: name.to_string(),
            unit,
        };
        let state = self.state.enter();
        state
            .tables
            .get(&id)
            .map(|t| t.nodes.clone())
            .ok_or(PoolError::NoSuchTable)
    }

    /// Advance the expiry clock one tick and drop nodes whose time has
    /// come. Returns the number removed.
    pub fn expire_tick(&self) -> usize {
        let mut state = self.state.enter();
        state.tick += 1;
        let now = state.tick;
        let mut removed = 0;
        for table in state.tables.values_mut() {
            let before = table.nodes.len();
            table.nodes.retain(|n| match n.die {
                Some(die) => die > now,
                None => true,
            });
            removed += before - table.nodes.len();
        }
        removed
    }

    pub fn tick(&self) -> u64 {
        self.state.enter().tick
    }

    /// (table id, live node count) pairs, sorted by name then unit.
    pub fn summary(&self) -> Vec<(TableId, usize)> {
        let state = self.state.enter();
        let mut out: Vec<(TableId, usize)> = state
            .tables
            .iter()
            .map(|(id, t)| (id.clone(), t.nodes.len()))
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name).then(a.0.unit.cmp(&b.0.unit)));
        out
    }
}

/// Render an address/mask pair the way operators expect to grep for it:
/// IPv4 masks as dotted quads, IPv6 masks as a prefix length.
pub fn format_node_addr(cidr: &Cidr) -> String {
    match cidr {
        Cidr::V4 { addr, prefix } => {
            let mask = Ipv4Addr::from(mask_v4(*prefix));
            format!("{addr}/{mask}")
        }
        Cidr::V6 { addr, prefix } => format!("{addr}/{prefix}"),
    }
}

/// Operator-facing diagnostic for a failed control operation.
pub fn describe_pool_failure(op: &PoolOp, name: &str, err: PoolError) -> String {
    match op {
        PoolOp::AddNode { cidr, group, .. } | PoolOp::DeleteNode { cidr, group } => format!(
            "{} {} group '{}' in table '{}': {}",
            op.verb(),
            format_node_addr(cidr),
            group,
            name,
            err
        ),
        PoolOp::CreateTable | PoolOp::DestroyTable => {
            format!("{} table '{}': {}", op.verb(), name, err)
        }
    }
}
