//! Verify command implementation.

use super::OpenOptions;
use shiftsync_core::CoreError;
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path, open: &OpenOptions) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying replica at {}", path.display());
    println!();

    let replica = open.open(path)?;
    let stats = replica.stats()?;
    println!(
        "Checking {} operations from {} devices...",
        stats.operations, stats.devices
    );

    match replica.verify_integrity() {
        Ok(()) => {
            println!("✓ Every chain verified");
            Ok(())
        }
        Err(CoreError::ChainIntegrityViolation(violation)) => {
            println!("✗ {violation}");
            println!("  device:    {}", violation.device_id);
            println!("  operation: {}", violation.op_id);
            println!("  affected:  {} operations", violation.rejected.len());
            Err("Verification failed".into())
        }
        Err(e) => Err(e.into()),
    }
}
