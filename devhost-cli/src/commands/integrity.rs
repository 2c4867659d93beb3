use devhost_core::{DevhostError, Settings};
use devhost_store::state::HashStatus;

use super::state_store;

/// `devhost integrity [--accept]`
pub fn run(settings: &Settings, accept: bool) -> Result<(), DevhostError> {
    let store = state_store(settings);

    if accept {
        store.accept_all()?;
        println!("integrity baseline updated");
        return Ok(());
    }

    let report = store.verify_all()?;
    if report.is_empty() {
        println!("no tracked files");
        return Ok(());
    }

    let mut drifted = 0usize;
    for (path, status) in &report {
        println!("{status:<10} {path}");
        if *status != HashStatus::Match {
            drifted += 1;
        }
    }
    if drifted > 0 {
        return Err(DevhostError::IntegrityDrift(format!(
            "{drifted} of {} tracked files drifted (rerun with --accept to baseline)",
            report.len()
        )));
    }
    Ok(())
}
