use devhost_core::{DevhostError, Settings};
use devhost_store::state::Mode;

use super::state_store;

/// `devhost mode [off|gateway|system|external]`
pub fn show_or_set(settings: &Settings, mode: Option<&str>) -> Result<(), DevhostError> {
    let store = state_store(settings);
    match mode {
        None => {
            println!("{}", store.read()?.proxy.mode);
            Ok(())
        }
        Some(raw) => {
            let mode = Mode::parse(raw).ok_or_else(|| {
                DevhostError::Validation(format!(
                    "unknown mode {raw:?} (expected off, gateway, system, or external)"
                ))
            })?;
            store.set_mode(mode)?;
            println!("mode set to {mode}");
            Ok(())
        }
    }
}
