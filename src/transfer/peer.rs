//! Peer access negotiation for device to device transfers.

use crate::backend::{DeviceId, DeviceRuntime, PEER_ACCESS_ALREADY_ENABLED};
use crate::error::{HitsError, Locate, Result};

/// Make `device` able to access memory owned by `peer`.
///
/// Must run before any buffer of the transfer is allocated. An existing
/// mapping (another transfer over the same pair) counts as success.
///
/// # Errors
///
/// [`HitsError::PeerAccessUnsupported`] when the topology has no direct path
/// between the two devices, [`HitsError::Runtime`] when a runtime call fails.
pub fn negotiate_peer_access(
    runtime: &dyn DeviceRuntime,
    device: DeviceId,
    peer: DeviceId,
) -> Result<()> {
    if !runtime.can_access_peer(device, peer).located()? {
        return Err(HitsError::PeerAccessUnsupported { device, peer });
    }

    match runtime.enable_peer_access(device, peer).located() {
        Ok(()) => {
            crate::log_debug!(
                "peer",
                "enabled access from device {} to device {}",
                device,
                peer
            );
            Ok(())
        }
        Err(HitsError::Runtime { code, .. }) if code == PEER_ACCESS_ALREADY_ENABLED => {
            crate::log_debug!(
                "peer",
                "access from device {} to device {} already enabled",
                device,
                peer
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}
