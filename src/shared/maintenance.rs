// Keystone Shared — HA maintenance flag.
// A single sentinel file on the shared volume. Presence disables automatic
// failover routing in client utilities; it does NOT gate direct
// inter-service calls, so a candidate stack can still reach live
// dependencies during development.
//
// Write-rare, read-frequent; touch/rm is filesystem-atomic at this scale.

use crate::atoms::error::EngineResult;
use crate::shared::layout::SharedVolume;
use log::info;

/// Whether maintenance mode is active (fallback routing disabled).
pub fn maintenance_active(volume: &SharedVolume) -> bool {
    volume.maintenance_flag().exists()
}

/// Enable maintenance mode. Idempotent.
pub fn enable_maintenance(volume: &SharedVolume) -> EngineResult<()> {
    std::fs::write(volume.maintenance_flag(), b"")?;
    info!("[ha] maintenance mode enabled — automatic failover routing disabled");
    Ok(())
}

/// Disable maintenance mode. Idempotent.
pub fn disable_maintenance(volume: &SharedVolume) -> EngineResult<()> {
    let flag = volume.maintenance_flag();
    if flag.exists() {
        std::fs::remove_file(&flag)?;
    }
    info!("[ha] maintenance mode disabled — automatic failover routing restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let v = SharedVolume::new(tmp.path());
        assert!(!maintenance_active(&v));

        enable_maintenance(&v).unwrap();
        assert!(maintenance_active(&v));
        // Idempotent
        enable_maintenance(&v).unwrap();
        assert!(maintenance_active(&v));

        disable_maintenance(&v).unwrap();
        assert!(!maintenance_active(&v));
        disable_maintenance(&v).unwrap();
    }
}
