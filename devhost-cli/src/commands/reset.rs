use devhost_core::{DevhostError, Settings};
use devhost_external::Integrator;

use super::route_store;

/// `devhost reset --yes`
///
/// Clears the state file and removes owned snippets and backups. The
/// route file and all user-owned proxy configs survive.
pub fn run(settings: &Settings, yes: bool) -> Result<(), DevhostError> {
    if !yes {
        return Err(DevhostError::Validation(
            "reset is destructive; pass --yes to confirm".into(),
        ));
    }
    Integrator::new(settings).reset()?;
    println!(
        "state cleared (route file {} untouched)",
        route_store(settings).path().display()
    );
    Ok(())
}
