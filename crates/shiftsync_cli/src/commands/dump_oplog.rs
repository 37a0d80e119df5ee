//! Dump oplog command implementation.

use serde::Serialize;
use shiftsync_core::{JournalRecord, ReplicaDir};
use shiftsync_protocol::{codec, Operation};
use shiftsync_storage::{frame, FileBackend};
use std::path::Path;

/// Journal record representation for output.
#[derive(Debug, Serialize)]
pub struct JournalRecordInfo {
    /// Offset of the frame in the journal file.
    pub offset: u64,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// The decoded record.
    #[serde(flatten)]
    pub record: JournalRecord,
}

/// Runs the dump-oplog command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    skip: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = ReplicaDir::open(path, false)?;
    let journal_path = dir.journal_path();
    if !journal_path.exists() {
        return Err("Journal file not found".into());
    }

    let backend = FileBackend::open(&journal_path)?;
    let scan = frame::scan_frames(&backend)?;
    let mut records = Vec::new();
    for f in scan
        .frames
        .into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
    {
        let record: JournalRecord = codec::from_cbor(&f.payload)
            .map_err(|e| format!("undecodable record at offset {}: {e}", f.offset))?;
        records.push(JournalRecordInfo {
            offset: f.offset,
            payload_size: f.payload.len(),
            record,
        });
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records, scan.torn_tail);
        }
    }

    Ok(())
}

fn describe(op: &Operation) -> String {
    let mut line = format!(
        "{} {} clock={} {}/{} {}",
        op.op_id, op.device_id, op.logical_clock, op.entity_type, op.entity_id, op.kind
    );
    if let Some(path) = &op.path {
        line.push(' ');
        line.push_str(&path.to_string());
    }
    line
}

fn print_text_output(records: &[JournalRecordInfo], torn_tail: bool) {
    println!("Journal Records ({} shown)", records.len());
    println!("================");
    println!();

    for info in records {
        print!("[{:08}] {:18}", info.offset, info.record.kind());
        match &info.record {
            JournalRecord::Append { op } => println!(" {}", describe(op)),
            JournalRecord::RemoteBatch { ops, cursor } => {
                print!(" {} ops", ops.len());
                match cursor {
                    Some((entity_type, cursor)) => println!(" cursor {entity_type}@{}", cursor.position),
                    None => println!(),
                }
                for op in ops {
                    println!("{:30}{}", "", describe(op));
                }
            }
            JournalRecord::MarkPushed { op_ids } => println!(" {} ops", op_ids.len()),
            JournalRecord::Pruned { op_ids, baselines } => {
                println!(" {} ops into {} baselines", op_ids.len(), baselines.len());
            }
            JournalRecord::CursorSet {
                entity_type,
                cursor,
            } => println!(" {entity_type}@{}", cursor.position),
            JournalRecord::CursorsReset => println!(),
            JournalRecord::ConflictResolved {
                conflict_id,
                resolution,
            } => println!(" {conflict_id} {resolution:?}"),
            JournalRecord::SyncRecorded { at } => println!(" at {at} ms"),
        }
    }

    if torn_tail {
        println!();
        println!("(journal ends in a torn frame; it is cut off on next open)");
    }
}
