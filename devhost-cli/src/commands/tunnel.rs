use devhost_core::{DevhostError, Settings};

use super::state_store;

/// `devhost tunnel list`
pub fn list(settings: &Settings) -> Result<(), DevhostError> {
    let state = state_store(settings).read()?;
    if state.tunnels.is_empty() {
        println!("no tunnels");
        return Ok(());
    }
    for (name, info) in &state.tunnels {
        let pid = info
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{name:<20} {:<14} {:<40} pid {pid}", info.provider, info.public_url);
    }
    Ok(())
}
