// Entity Models - node and edge tables of the claims graph
// "Identity persists, values change"
//
// Each node has:
// - Stable identity (kind + natural key) that NEVER changes
// - A surrogate id derived from that identity
// - Aggregates recomputed from the current record set on every build

pub mod edge;
pub mod node;

pub use edge::{BucketGranularity, RelationType, RelationshipEdge, ALL_TIME_BUCKET};
pub use node::{EntityKind, EntityNode, NodeId, NodeKey};
