// 🧑‍⚕️ Entity Node - One row per distinct participant in the billing graph
//
// "The natural key is IDENTITY, the aggregates are VALUES"
//
// - Identity: (kind, natural key), e.g. provider "1234567890"
// - Surrogate id: derived from the identity, so rebuilds reuse it
// - Values: claim and paid totals, recomputed on every build

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Surrogate node identifier (non-negative, fits an SQLite INTEGER)
pub type NodeId = i64;

// ============================================================================
// ENTITY KIND
// ============================================================================

/// Variant order matches the ordering of `as_str()`, so the derived `Ord`
/// agrees with a string comparison of the kind names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Billed procedure (HCPCS code)
    Procedure,

    /// Billing or servicing provider (NPI)
    Provider,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Procedure => "procedure",
            EntityKind::Provider => "provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "procedure" => Some(EntityKind::Procedure),
            "provider" => Some(EntityKind::Provider),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// NODE KEY (identity)
// ============================================================================

/// Qualified natural key of a node.
///
/// Ordering is `(kind name, natural key)`; every lexicographic tie-break in
/// the traversal engine and ring normalization goes through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub kind: EntityKind,
    pub key: String,
}

impl NodeKey {
    pub fn new(kind: EntityKind, key: &str) -> Self {
        NodeKey {
            kind,
            key: key.trim().to_string(),
        }
    }

    pub fn provider(key: &str) -> Self {
        NodeKey::new(EntityKind::Provider, key)
    }

    pub fn procedure(key: &str) -> Self {
        NodeKey::new(EntityKind::Procedure, key)
    }

    /// Human-readable identifier, e.g. `provider:1234567890`
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.key)
    }

    /// Deterministic surrogate id: top 63 bits of SHA-256 over the identifier.
    /// Same key → same id on every run and on every backend.
    pub fn node_id(&self) -> NodeId {
        let mut hasher = Sha256::new();
        hasher.update(self.identifier().as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) >> 1) as NodeId
    }
}

impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.key)
    }
}

// ============================================================================
// ENTITY NODE (node table row)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    /// Surrogate id derived from (kind, natural_key)
    pub id: NodeId,

    pub kind: EntityKind,

    /// Natural key (NPI or HCPCS code), trimmed
    pub natural_key: String,

    // ========================================================================
    // DERIVED AGGREGATES
    // ========================================================================
    /// Claims on records where this node is the source
    pub claims_out: u64,

    /// Claims on records where this node is the target
    pub claims_in: u64,

    pub paid_out: f64,
    pub paid_in: f64,
}

impl EntityNode {
    pub fn new(key: &NodeKey) -> Self {
        EntityNode {
            id: key.node_id(),
            kind: key.kind,
            natural_key: key.key.clone(),
            claims_out: 0,
            claims_in: 0,
            paid_out: 0.0,
            paid_in: 0.0,
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey {
            kind: self.kind,
            key: self.natural_key.clone(),
        }
    }

    /// Total claim volume touching this node
    pub fn claim_volume(&self) -> u64 {
        self.claims_out + self.claims_in
    }
}
