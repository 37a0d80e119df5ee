//! Conflicts command implementation.

use super::OpenOptions;
use serde::Serialize;
use shiftsync_core::{rank_conflicts, ConflictScore, MergeRuleRegistry};
use shiftsync_protocol::ConflictRecord;
use std::collections::HashMap;
use std::path::Path;

/// A conflict with its risk score.
#[derive(Debug, Serialize)]
pub struct ScoredConflict {
    /// The conflict.
    pub conflict: ConflictRecord,
    /// Its score.
    pub score: ConflictScore,
}

/// Pairs each conflict with its score, riskiest first.
pub fn scored(registry: &MergeRuleRegistry, records: Vec<ConflictRecord>) -> Vec<ScoredConflict> {
    let mut by_id: HashMap<_, _> = records.into_iter().map(|r| (r.conflict_id, r)).collect();
    let scores = rank_conflicts(registry, &by_id.values().cloned().collect::<Vec<_>>());
    scores
        .into_iter()
        .filter_map(|score| {
            by_id
                .remove(&score.conflict_id)
                .map(|conflict| ScoredConflict { conflict, score })
        })
        .collect()
}

/// Runs the conflicts command.
pub fn run(
    path: &Path,
    open: &OpenOptions,
    include_settled: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let replica = open.open(path)?;
    let records = if include_settled {
        replica.conflicts()?
    } else {
        replica.unresolved_conflicts()?
    };
    let conflicts = scored(replica.registry(), records);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        _ => {
            print_text_output(&conflicts);
        }
    }

    Ok(())
}

fn print_text_output(conflicts: &[ScoredConflict]) {
    if conflicts.is_empty() {
        println!("No conflicts");
        return;
    }

    println!("Conflicts ({} total)", conflicts.len());
    println!("================");
    for ScoredConflict { conflict, score } in conflicts {
        println!();
        println!(
            "{} {}/{} {}",
            conflict.conflict_id, conflict.entity_type, conflict.entity_id, conflict.field_path
        );
        println!(
            "  {:?} under {}, {} operations by {} actors",
            conflict.cause,
            conflict.strategy,
            conflict.contending.len(),
            conflict.participants.len()
        );
        println!(
            "  score {} ({:?}), confidence {:.2}: {:?}",
            score.score, score.complexity, score.confidence, score.recommendation
        );
        if conflict.resolved {
            println!("  resolved");
        } else if conflict.requires_approval {
            println!("  awaiting approval");
        }
    }
}
