// 🗄️ Graph tables in SQLite - schema, rebuild and lookup helpers
//
// graph_nodes: one row per (entity_type, natural_key), upserted by natural key
// graph_edges: one row per (source, target, edge_type, time_bucket), rebuilt fully

use crate::builder::GraphTables;
use crate::entities::{EntityKind, EntityNode, NodeId, NodeKey, RelationType, RelationshipEdge};
use crate::error::{GraphError, GraphResult};
use crate::traversal::Deadline;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::debug;

/// Upper bound on `?` placeholders per statement
const ID_CHUNK: usize = 500;

pub fn setup_database(conn: &Connection) -> GraphResult<()> {
    // WAL for file databases; in-memory databases report "memory"
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    // ==========================================================================
    // Node table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS graph_nodes (
            node_id INTEGER PRIMARY KEY,
            entity_type TEXT NOT NULL,
            natural_key TEXT NOT NULL,
            claims_out INTEGER NOT NULL DEFAULT 0,
            claims_in INTEGER NOT NULL DEFAULT 0,
            paid_out REAL NOT NULL DEFAULT 0,
            paid_in REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            UNIQUE (entity_type, natural_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Edge table
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS graph_edges (
            source_id INTEGER NOT NULL,
            target_id INTEGER NOT NULL,
            edge_type TEXT NOT NULL,
            time_bucket TEXT NOT NULL,
            weight INTEGER NOT NULL,
            paid REAL NOT NULL DEFAULT 0,
            beneficiaries INTEGER NOT NULL DEFAULT 0,
            row_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (source_id, target_id, edge_type, time_bucket)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes (source side is covered by the primary key)
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges(target_id, source_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graph_edges_type ON graph_edges(edge_type)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// REBUILD
// ============================================================================

/// Persist a freshly built graph in one transaction.
///
/// Nodes are upserted by natural key and nodes absent from the new build are
/// deleted; edges are truncated and regenerated. If the deadline passes
/// before commit the transaction rolls back and the previous graph stays.
pub fn write_graph(conn: &mut Connection, tables: &GraphTables, deadline: &Deadline) -> GraphResult<()> {
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();

    tx.execute(
        "CREATE TEMP TABLE IF NOT EXISTS build_keys (node_id INTEGER PRIMARY KEY)",
        [],
    )?;
    tx.execute("DELETE FROM temp.build_keys", [])?;

    {
        let mut upsert = tx.prepare(
            "INSERT INTO graph_nodes (
                node_id, entity_type, natural_key, claims_out, claims_in, paid_out, paid_in, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(entity_type, natural_key) DO UPDATE SET
                claims_out = excluded.claims_out,
                claims_in = excluded.claims_in,
                paid_out = excluded.paid_out,
                paid_in = excluded.paid_in,
                updated_at = excluded.updated_at",
        )?;
        let mut keep = tx.prepare("INSERT OR IGNORE INTO temp.build_keys (node_id) VALUES (?1)")?;

        for node in &tables.nodes {
            upsert.execute(params![
                node.id,
                node.kind.as_str(),
                node.natural_key,
                node.claims_out as i64,
                node.claims_in as i64,
                node.paid_out,
                node.paid_in,
                now,
            ])?;
            keep.execute(params![node.id])?;
        }
    }

    let stale = tx.execute(
        "DELETE FROM graph_nodes WHERE node_id NOT IN (SELECT node_id FROM temp.build_keys)",
        [],
    )?;

    tx.execute("DELETE FROM graph_edges", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO graph_edges (
                source_id, target_id, edge_type, time_bucket, weight, paid, beneficiaries, row_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for edge in &tables.edges {
            insert.execute(params![
                edge.source_id,
                edge.target_id,
                edge.relation.as_str(),
                edge.time_bucket,
                edge.weight as i64,
                edge.paid,
                edge.beneficiaries as i64,
                edge.row_count as i64,
            ])?;
        }
    }

    if deadline.expired() {
        // Dropping the transaction rolls it back
        return Err(GraphError::BuildTimeout {
            limit_ms: deadline.limit_ms(),
        });
    }
    tx.commit()?;

    conn.execute_batch("ANALYZE")?;
    debug!(
        nodes = tables.nodes.len(),
        edges = tables.edges.len(),
        stale_nodes = stale,
        "Graph tables rewritten"
    );
    Ok(())
}

// ============================================================================
// READS
// ============================================================================

pub fn graph_counts(conn: &Connection) -> GraphResult<(u64, u64)> {
    let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?;
    let edges: i64 = conn.query_row("SELECT COUNT(*) FROM graph_edges", [], |row| row.get(0))?;
    Ok((nodes as u64, edges as u64))
}

pub fn lookup_node(conn: &Connection, key: &NodeKey) -> GraphResult<Option<NodeId>> {
    let id = conn
        .query_row(
            "SELECT node_id FROM graph_nodes WHERE entity_type = ?1 AND natural_key = ?2",
            params![key.kind.as_str(), key.key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Map node ids to keys; ids without a row are absent from the result
pub fn resolve_nodes(conn: &Connection, ids: &[NodeId]) -> GraphResult<HashMap<NodeId, NodeKey>> {
    let mut resolved = HashMap::with_capacity(ids.len());

    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT node_id, entity_type, natural_key FROM graph_nodes WHERE node_id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        for row in rows {
            let (id, kind, key) = row?;
            let kind = parse_kind(&kind)?;
            resolved.insert(id, NodeKey { kind, key });
        }
    }

    Ok(resolved)
}

pub fn all_node_ids(conn: &Connection) -> GraphResult<Vec<NodeId>> {
    let mut stmt = conn.prepare("SELECT node_id FROM graph_nodes ORDER BY node_id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<NodeId>, _>>()?;
    Ok(ids)
}

pub fn load_nodes(conn: &Connection) -> GraphResult<Vec<EntityNode>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, entity_type, natural_key, claims_out, claims_in, paid_out, paid_in
         FROM graph_nodes ORDER BY node_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, f64>(6)?,
        ))
    })?;

    let mut nodes = Vec::new();
    for row in rows {
        let (id, kind, natural_key, claims_out, claims_in, paid_out, paid_in) = row?;
        nodes.push(EntityNode {
            id,
            kind: parse_kind(&kind)?,
            natural_key,
            claims_out: claims_out as u64,
            claims_in: claims_in as u64,
            paid_out,
            paid_in,
        });
    }
    Ok(nodes)
}

pub fn load_edges(conn: &Connection) -> GraphResult<Vec<RelationshipEdge>> {
    let mut stmt = conn.prepare(
        "SELECT source_id, target_id, edge_type, time_bucket, weight, paid, beneficiaries, row_count
         FROM graph_edges ORDER BY source_id, target_id, edge_type, time_bucket",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, i64>(7)?,
        ))
    })?;

    let mut edges = Vec::new();
    for row in rows {
        let (source_id, target_id, edge_type, time_bucket, weight, paid, beneficiaries, row_count) = row?;
        let relation = RelationType::parse(&edge_type).ok_or_else(|| {
            GraphError::InvalidParameter(format!("unknown edge_type in graph_edges: {}", edge_type))
        })?;
        edges.push(RelationshipEdge {
            source_id,
            target_id,
            relation,
            time_bucket,
            weight: weight as u64,
            paid,
            beneficiaries: beneficiaries as u64,
            row_count: row_count as u64,
        });
    }
    Ok(edges)
}

fn parse_kind(value: &str) -> GraphResult<EntityKind> {
    EntityKind::parse(value).ok_or_else(|| {
        GraphError::InvalidParameter(format!("unknown entity_type in graph_nodes: {}", value))
    })
}
