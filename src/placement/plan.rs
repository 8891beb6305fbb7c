//! The placement plan: which devices each role runs on.
//!
//! Built once at startup, before any process launches. Validation is
//! deliberately strict: a plan that does not fit the budget, or a colocated
//! plan whose role shapes do not line up, fails construction immediately
//! rather than surfacing as a launch error minutes later.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PlacementConfig;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// A process role competing for devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The sharded trainable policy model.
    Policy,
    /// The frozen reference model.
    Reference,
    /// One inference engine replica (tensor-parallel shards included).
    Engine(usize),
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Policy => write!(f, "policy"),
            Role::Reference => write!(f, "reference"),
            Role::Engine(i) => write!(f, "engine[{i}]"),
        }
    }
}

/// A single accelerator, identified by node and local index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceId {
    pub node: u32,
    pub index: u32,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}/gpu{}", self.node, self.index)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Immutable map from role to device set.
///
/// Invariant: the device sets of any two roles are either fully disjoint or
/// fully identical (the colocated case). Partial overlap cannot be
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementPlan {
    assignments: BTreeMap<Role, BTreeSet<DeviceId>>,
    colocated: bool,
    num_engines: usize,
    engine_tp_size: usize,
}

impl PlacementPlan {
    /// Build and validate a plan from the placement configuration.
    pub fn build(cfg: &PlacementConfig) -> Result<Self> {
        validate_shapes(cfg)?;

        if cfg.colocate_all {
            Self::build_colocated(cfg)
        } else {
            Self::build_disjoint(cfg)
        }
    }

    /// Devices assigned to a role, if the role exists in this plan.
    pub fn devices(&self, role: &Role) -> Option<&BTreeSet<DeviceId>> {
        self.assignments.get(role)
    }

    /// All roles in this plan, in deterministic order.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.assignments.keys()
    }

    /// Whether every role shares the identical device set.
    pub fn is_colocated(&self) -> bool {
        self.colocated
    }

    /// Number of engine replicas placed.
    pub fn num_engines(&self) -> usize {
        self.num_engines
    }

    /// Tensor-parallel degree of each engine replica.
    pub fn engine_tp_size(&self) -> usize {
        self.engine_tp_size
    }

    /// Count of distinct devices used by the whole plan.
    pub fn total_devices(&self) -> usize {
        let mut all = BTreeSet::new();
        for set in self.assignments.values() {
            all.extend(set.iter().copied());
        }
        all.len()
    }

    /// Multi-line human-readable rendering, used by the CLI.
    pub fn render(&self) -> String {
        let mode = if self.colocated { "colocated" } else { "disjoint" };
        let mut out = format!(
            "placement plan ({} devices, {mode})\n",
            self.total_devices()
        );
        for (role, set) in &self.assignments {
            out.push_str(&format!("  {:<12} {}\n", role.to_string(), render_devices(set)));
        }
        out
    }

    fn build_disjoint(cfg: &PlacementConfig) -> Result<Self> {
        let budget = (cfg.nodes * cfg.gpus_per_node) as usize;
        let demand = total_demand(cfg);
        if demand > budget {
            return Err(Error::Configuration(format!(
                "requested {demand} GPUs exceeds the cluster budget of {budget} \
                 ({} nodes x {} GPUs)",
                cfg.nodes, cfg.gpus_per_node
            )));
        }

        let mut cursor = Cursor::new(cfg.nodes, cfg.gpus_per_node);
        let mut assignments = BTreeMap::new();

        let mut policy = BTreeSet::new();
        for _ in 0..cfg.policy_nodes {
            policy.extend(cursor.take_packed(cfg.policy_gpus_per_node, "policy")?);
        }
        assignments.insert(Role::Policy, policy);

        if cfg.reference_nodes > 0 {
            let mut reference = BTreeSet::new();
            for _ in 0..cfg.reference_nodes {
                reference.extend(cursor.take_packed(cfg.reference_gpus_per_node, "reference")?);
            }
            assignments.insert(Role::Reference, reference);
        }

        for replica in 0..cfg.num_engines {
            let shards = cursor.take_packed(cfg.engine_tp_size as u32, "engine")?;
            assignments.insert(Role::Engine(replica), shards.into_iter().collect());
        }

        Ok(Self {
            assignments,
            colocated: false,
            num_engines: cfg.num_engines,
            engine_tp_size: cfg.engine_tp_size,
        })
    }

    fn build_colocated(cfg: &PlacementConfig) -> Result<Self> {
        let policy = (cfg.policy_nodes * cfg.policy_gpus_per_node) as usize;
        let engines = cfg.num_engines * cfg.engine_tp_size;
        let reference = (cfg.reference_nodes * cfg.reference_gpus_per_node) as usize;

        // Every colocated role alternates on the identical device set, so
        // their total shapes must line up exactly.
        let mut mismatched = engines != policy;
        if cfg.reference_nodes > 0 {
            mismatched |= reference != policy;
        }
        if mismatched {
            return Err(Error::Configuration(format!(
                "colocate_all requires matching role shapes: policy wants {policy} GPUs, \
                 reference {reference}, engines {engines} ({} x tp{})",
                cfg.num_engines, cfg.engine_tp_size
            )));
        }

        let budget = (cfg.nodes * cfg.gpus_per_node) as usize;
        if policy > budget {
            return Err(Error::Configuration(format!(
                "requested {policy} GPUs exceeds the cluster budget of {budget} \
                 ({} nodes x {} GPUs)",
                cfg.nodes, cfg.gpus_per_node
            )));
        }

        let mut cursor = Cursor::new(cfg.nodes, cfg.gpus_per_node);
        let mut shared = BTreeSet::new();
        for _ in 0..cfg.policy_nodes {
            shared.extend(cursor.take_packed(cfg.policy_gpus_per_node, "policy")?);
        }

        let mut assignments = BTreeMap::new();
        assignments.insert(Role::Policy, shared.clone());
        if cfg.reference_nodes > 0 {
            assignments.insert(Role::Reference, shared.clone());
        }
        for replica in 0..cfg.num_engines {
            assignments.insert(Role::Engine(replica), shared.clone());
        }

        Ok(Self {
            assignments,
            colocated: true,
            num_engines: cfg.num_engines,
            engine_tp_size: cfg.engine_tp_size,
        })
    }
}

fn total_demand(cfg: &PlacementConfig) -> usize {
    (cfg.policy_nodes * cfg.policy_gpus_per_node) as usize
        + (cfg.reference_nodes * cfg.reference_gpus_per_node) as usize
        + cfg.num_engines * cfg.engine_tp_size
}

fn validate_shapes(cfg: &PlacementConfig) -> Result<()> {
    if cfg.nodes == 0 || cfg.gpus_per_node == 0 {
        return Err(Error::Configuration(
            "cluster must have at least one node with at least one GPU".into(),
        ));
    }
    if cfg.policy_nodes == 0 || cfg.policy_gpus_per_node == 0 {
        return Err(Error::Configuration(
            "policy role must request at least one GPU".into(),
        ));
    }
    if cfg.reference_nodes > 0 && cfg.reference_gpus_per_node == 0 {
        return Err(Error::Configuration(
            "reference role requests nodes but zero GPUs per node".into(),
        ));
    }
    if cfg.num_engines == 0 {
        return Err(Error::Configuration(
            "at least one inference engine replica is required".into(),
        ));
    }
    if cfg.engine_tp_size == 0 {
        return Err(Error::Configuration(
            "engine tensor-parallel size must be at least 1".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Packed allocation
// ---------------------------------------------------------------------------

/// Walks the cluster in (node, index) order handing out contiguous device
/// runs. A run never straddles nodes; when the current node lacks room the
/// cursor skips to the next one.
struct Cursor {
    node: u32,
    index: u32,
    nodes: u32,
    gpus_per_node: u32,
}

impl Cursor {
    fn new(nodes: u32, gpus_per_node: u32) -> Self {
        Self {
            node: 0,
            index: 0,
            nodes,
            gpus_per_node,
        }
    }

    fn take_packed(&mut self, count: u32, role: &str) -> Result<Vec<DeviceId>> {
        if count > self.gpus_per_node {
            return Err(Error::Configuration(format!(
                "{role} requests {count} GPUs on one node but nodes only have {}",
                self.gpus_per_node
            )));
        }
        if self.index + count > self.gpus_per_node {
            self.node += 1;
            self.index = 0;
        }
        if self.node >= self.nodes {
            return Err(Error::Configuration(format!(
                "no contiguous room left to place {role} ({count} GPUs on one node); \
                 the budget is too fragmented for this shape"
            )));
        }

        let devices = (0..count)
            .map(|i| DeviceId {
                node: self.node,
                index: self.index + i,
            })
            .collect();
        self.index += count;
        Ok(devices)
    }
}

/// Compact per-node rendering, e.g. `node0[0-3] node1[0-1]`.
fn render_devices(set: &BTreeSet<DeviceId>) -> String {
    let mut by_node: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for d in set {
        by_node.entry(d.node).or_default().push(d.index);
    }
    by_node
        .into_iter()
        .map(|(node, indices)| {
            let lo = indices.first().copied().unwrap_or(0);
            let hi = indices.last().copied().unwrap_or(0);
            if lo == hi {
                format!("node{node}[{lo}]")
            } else {
                format!("node{node}[{lo}-{hi}]")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
