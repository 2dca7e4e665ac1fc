//! Status command implementation.

use std::path::Path;

use super::open_engine;

/// Runs the status command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path)?;
    let status = engine.status()?;

    println!("ahead:             {}", status.ahead);
    println!("behind:            {}", status.behind);
    println!("pending conflicts: {}", status.pending_conflicts);

    if status.ahead == 0 && status.behind == 0 {
        println!("✓ In sync with the last-known remote state");
    } else {
        println!("Run `weft sync` to reconcile");
    }
    Ok(())
}
