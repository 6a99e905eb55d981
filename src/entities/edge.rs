// 🔗 Relationship Edge - Aggregated billing relationship between two nodes
//
// One row per (source, target, relation, time bucket). Every claim record
// that shares those four values folds into the same row.

use super::node::{EntityKind, NodeId};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// RELATION TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// provider → procedure
    BilledFor,

    /// billing provider → servicing provider
    ReferredTo,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::BilledFor => "billed_for",
            RelationType::ReferredTo => "referred_to",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "billed_for" => Some(RelationType::BilledFor),
            "referred_to" => Some(RelationType::ReferredTo),
            _ => None,
        }
    }

    /// (source kind, target kind) fixed by the relation
    pub fn endpoint_kinds(&self) -> (EntityKind, EntityKind) {
        match self {
            RelationType::BilledFor => (EntityKind::Provider, EntityKind::Procedure),
            RelationType::ReferredTo => (EntityKind::Provider, EntityKind::Provider),
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TIME BUCKETS
// ============================================================================

/// Bucket label for records without a service month (and for granularity `All`)
pub const ALL_TIME_BUCKET: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketGranularity {
    All,
    Year,
    #[default]
    Month,
}

impl BucketGranularity {
    /// "all", "2024" or "2024-01"
    pub fn bucket_for(&self, service_month: Option<NaiveDate>) -> String {
        match (self, service_month) {
            (_, None) | (BucketGranularity::All, _) => ALL_TIME_BUCKET.to_string(),
            (BucketGranularity::Year, Some(date)) => format!("{:04}", date.year()),
            (BucketGranularity::Month, Some(date)) => {
                format!("{:04}-{:02}", date.year(), date.month())
            }
        }
    }
}

// ============================================================================
// RELATIONSHIP EDGE (edge table row)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub relation: RelationType,
    pub time_bucket: String,

    /// Summed claim count of the folded records
    pub weight: u64,

    pub paid: f64,
    pub beneficiaries: u64,

    /// Number of input records folded into this row
    pub row_count: u64,
}

impl RelationshipEdge {
    pub fn new(source_id: NodeId, target_id: NodeId, relation: RelationType, time_bucket: &str) -> Self {
        RelationshipEdge {
            source_id,
            target_id,
            relation,
            time_bucket: time_bucket.to_string(),
            weight: 0,
            paid: 0.0,
            beneficiaries: 0,
            row_count: 0,
        }
    }

    /// Identity of the row: (source, target, relation, bucket)
    pub fn grouping_key(&self) -> (NodeId, NodeId, RelationType, &str) {
        (self.source_id, self.target_id, self.relation, self.time_bucket.as_str())
    }
}
