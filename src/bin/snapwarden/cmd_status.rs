use anyhow::Result;

use snapwarden::{CancelToken, Orchestrator, SnapConfig};

/// Read-only: no instance lock, no reconciliation.
pub fn exec(cfg: SnapConfig, json: bool) -> Result<()> {
    let orch = Orchestrator::from_config(&cfg, CancelToken::new())?;
    let st = orch.status()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&st)?);
        return Ok(());
    }

    println!("source:    {}", st.source);
    println!("retention: {}", st.policy);
    println!("snapshots: {}", st.snapshots.len());
    for s in &st.snapshots {
        let mut flags = Vec::new();
        if s.mounted {
            flags.push("mounted");
        }
        if s.would_prune {
            flags.push("prune");
        }
        println!(
            "  {:<24} created={} {}",
            s.handle.id,
            s.handle.created_unix,
            flags.join(",")
        );
    }
    println!("mount records: {}", st.mounts.len());
    for m in &st.mounts {
        println!(
            "  {} -> {} ({}, since {})",
            m.snapshot_id,
            m.mount_path.display(),
            m.state,
            m.mounted_unix
        );
    }
    Ok(())
}
