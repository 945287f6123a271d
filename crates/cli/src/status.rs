use anyhow::Result;

use factorflow_core::FlowConfig;
use factorflow_scheduler::DRIVER_TABLE;
use factorflow_state::{StateStore, WuStatus};

const WU_STATUSES: &[(WuStatus, &str)] = &[
    (WuStatus::Available, "available"),
    (WuStatus::Assigned, "assigned"),
    (WuStatus::NeedResubmit, "need resubmit"),
    (WuStatus::ReceivedOk, "received ok"),
    (WuStatus::ReceivedError, "received with error"),
    (WuStatus::VerifiedOk, "verified ok"),
    (WuStatus::VerifiedError, "verified with error"),
    (WuStatus::Cancelled, "cancelled"),
];

/// Print what each task has recorded so far, in pipeline order.
pub fn print(cfg: &FlowConfig, store: &StateStore) -> Result<()> {
    println!("Job {} in {}", cfg.name, cfg.workdir.display());

    for name in cfg.order() {
        println!("\n[{name}]");
        let values = store.dict(name).snapshot()?;
        if values.is_empty() {
            println!("  (not started)");
        }
        for (key, value) in values {
            println!("  {key:<24} {value}");
        }
    }

    println!("\n[work units]");
    let wus = store.workunits();
    for (status, label) in WU_STATUSES {
        let n = wus.count(*status)?;
        if n > 0 {
            println!("  {label:<24} {n}");
        }
    }

    if let Some(elapsed) = store.dict(DRIVER_TABLE).get::<f64>("elapsed")? {
        println!("\nElapsed time of finished runs: {elapsed:.1}s");
    }
    Ok(())
}
