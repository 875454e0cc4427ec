//! NUMA placement of host buffers.
//!
//! A device's NUMA node is read from the PCI bus entry in sysfs. Host buffers
//! are then placed near the device by making that node the preferred memory
//! node of the allocating thread. Every step is best effort: an unreadable
//! topology or a rejected policy leaves placement to the kernel.

use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::PciBusId;

/// View of the NUMA topology rooted at a sysfs mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaTopology {
    root: PathBuf,
}

impl Default for NumaTopology {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl NumaTopology {
    /// Topology read from the sysfs tree at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// NUMA node attached to the PCI bus of a device.
    ///
    /// Reads `class/pci_bus/<domain>:<bus>/device/numa_node`. Returns `None`
    /// when the file is missing or unparsable, or when the kernel reports `-1`
    /// (no affinity).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hits::backend::PciBusId;
    /// use hits::buffer::NumaTopology;
    ///
    /// let topology = NumaTopology::new("/nonexistent");
    /// assert_eq!(topology.device_node(&PciBusId::default()), None);
    /// ```
    pub fn device_node(&self, pci: &PciBusId) -> Option<u32> {
        let path = self
            .root
            .join("class/pci_bus")
            .join(format!("{:04x}:{:02x}", pci.domain, pci.bus))
            .join("device/numa_node");

        let text = fs::read_to_string(path).ok()?;
        let node: i64 = text.trim().parse().ok()?;
        u32::try_from(node).ok()
    }
}

/// Make `node` the preferred memory node of the calling thread.
///
/// Subsequent allocations by this thread (including pinned host allocations
/// that follow the thread policy) prefer that node and fall back to others when
/// it is full. Returns whether the kernel accepted the policy.
#[cfg(target_os = "linux")]
pub fn prefer_node(node: u32) -> bool {
    const MPOL_PREFERRED: libc::c_long = 1;
    const MAX_NODES: usize = 1024;
    const WORD_BITS: usize = libc::c_ulong::BITS as usize;

    let node = node as usize;
    if node >= MAX_NODES {
        return false;
    }

    let mut mask = [0 as libc::c_ulong; MAX_NODES / WORD_BITS];
    mask[node / WORD_BITS] |= 1 << (node % WORD_BITS);

    // SAFETY: mask is valid for MAX_NODES bits; maxnode follows the libnuma
    // convention of bit count plus one.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_PREFERRED,
            mask.as_ptr(),
            (MAX_NODES + 1) as libc::c_ulong,
        )
    };
    ret == 0
}

/// Drop any preferred node of the calling thread.
///
/// Restores the default local-allocation policy so a host buffer whose device
/// node is unknown does not inherit the node preferred for an earlier
/// transfer. Returns whether the kernel accepted the change.
#[cfg(target_os = "linux")]
pub fn reset_node_preference() -> bool {
    const MPOL_DEFAULT: libc::c_long = 0;

    // SAFETY: MPOL_DEFAULT takes no node mask.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_set_mempolicy,
            MPOL_DEFAULT,
            std::ptr::null::<libc::c_ulong>(),
            0 as libc::c_ulong,
        )
    };
    ret == 0
}

/// Drop any preferred node (non-Linux stub).
#[cfg(not(target_os = "linux"))]
pub fn reset_node_preference() -> bool {
    true
}

/// Make `node` the preferred memory node (non-Linux stub).
///
/// Always returns `false`.
#[cfg(not(target_os = "linux"))]
pub fn prefer_node(_node: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_bus(root: &Path, bus: &str, contents: &str) {
        let dir = root.join("class/pci_bus").join(bus).join("device");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("numa_node"), contents).unwrap();
    }

    #[test]
    fn reads_device_node() {
        let tmp = TempDir::new().unwrap();
        fake_bus(tmp.path(), "0000:c3", "1\n");
        let topology = NumaTopology::new(tmp.path());
        let pci = PciBusId {
            domain: 0,
            bus: 0xc3,
            device: 0,
        };
        assert_eq!(topology.device_node(&pci), Some(1));
    }

    #[test]
    fn negative_node_is_unknown() {
        let tmp = TempDir::new().unwrap();
        fake_bus(tmp.path(), "0000:03", "-1\n");
        let topology = NumaTopology::new(tmp.path());
        let pci = PciBusId {
            domain: 0,
            bus: 0x03,
            device: 0,
        };
        assert_eq!(topology.device_node(&pci), None);
    }

    #[test]
    fn garbage_is_unknown() {
        let tmp = TempDir::new().unwrap();
        fake_bus(tmp.path(), "0001:20", "node zero");
        let topology = NumaTopology::new(tmp.path());
        let pci = PciBusId {
            domain: 1,
            bus: 0x20,
            device: 0,
        };
        assert_eq!(topology.device_node(&pci), None);
    }

    #[test]
    fn out_of_range_node_is_refused() {
        assert!(!prefer_node(4096));
    }

    #[cfg(target_os = "linux")]
    fn current_policy() -> libc::c_int {
        let mut mode: libc::c_int = -1;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut mode as *mut libc::c_int,
                std::ptr::null_mut::<libc::c_ulong>(),
                0 as libc::c_ulong,
                std::ptr::null_mut::<libc::c_void>(),
                0 as libc::c_ulong,
            )
        };
        assert_eq!(ret, 0);
        mode
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn preference_can_be_reset() {
        // each test runs on its own thread, so the policy does not leak
        if prefer_node(0) {
            assert_eq!(current_policy(), 1);
        }
        assert!(reset_node_preference());
        assert_eq!(current_policy(), 0);
    }
}
