//! Inspect command implementation.

use super::OpenOptions;
use serde::Serialize;
use shiftsync_core::{StoreStats, SyncStatus};
use shiftsync_protocol::EntityType;
use std::path::Path;

/// Replica inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Replica path.
    pub path: String,
    /// Device the replica was opened as.
    pub device_id: String,
    /// Current logical clock.
    pub logical_clock: u64,
    /// Store counters.
    pub stats: StoreStats,
    /// Sync status.
    pub status: SyncStatus,
    /// Pull cursor per entity type.
    pub cursors: Vec<CursorInfo>,
}

/// Pull cursor of one entity type.
#[derive(Debug, Serialize)]
pub struct CursorInfo {
    /// Entity type.
    pub entity_type: EntityType,
    /// Authority position reached.
    pub position: u64,
    /// Last operation received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_op_id: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, open: &OpenOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let replica = open.open(path)?;

    let cursors = EntityType::ALL
        .iter()
        .map(|&entity_type| {
            let cursor = replica.cursor(entity_type);
            CursorInfo {
                entity_type,
                position: cursor.position,
                last_op_id: cursor.last_op_id.map(|id| id.to_string()),
            }
        })
        .collect();

    let result = InspectResult {
        path: path.display().to_string(),
        device_id: replica.device_id().to_string(),
        logical_clock: replica.logical_clock(),
        stats: replica.stats()?,
        status: replica.sync_status()?,
        cursors,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Replica: {}", result.path);
    println!("Device:  {}", result.device_id);
    println!("Clock:   {}", result.logical_clock);
    println!();
    println!("Op-log");
    println!("  operations:  {}", result.stats.operations);
    println!("  unpushed:    {}", result.stats.unpushed);
    println!("  devices:     {}", result.stats.devices);
    println!("  entities:    {}", result.stats.entities);
    println!("  baselines:   {}", result.stats.baselines);
    println!("  journal:     {} bytes", result.stats.journal_bytes);
    println!();
    println!("Sync");
    match result.status.last_sync_time {
        Some(ms) => println!("  last sync:   {ms} ms"),
        None => println!("  last sync:   never"),
    }
    println!("  conflicts:   {} unresolved", result.status.unresolved_conflict_count);
    if let Some(reason) = &result.status.quarantined {
        println!("  QUARANTINED: {reason}");
    }
    println!();
    println!("Cursors");
    for cursor in &result.cursors {
        match &cursor.last_op_id {
            Some(op_id) => println!("  {:8} @{} ({op_id})", cursor.entity_type.to_string(), cursor.position),
            None => println!("  {:8} start", cursor.entity_type.to_string()),
        }
    }
}
