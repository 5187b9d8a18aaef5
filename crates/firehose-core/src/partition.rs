//! Partition view model shared by the GPT codec, the rawprogram loaders, and
//! the flashing session.

/// One partition as seen by the host, regardless of where it was discovered
/// (on-device GPT, backup GPT image, or a rawprogram XML).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Logical unit the partition lives on (UFS LUN, 0 for eMMC).
    pub lun: u32,
    pub name: String,
    /// Numeric start LBA when known; 0 when only the symbolic form exists.
    pub start_lba: u64,
    /// Start sector exactly as spelled in its source, possibly a loader-side
    /// formula like `NUM_DISK_SECTORS-5.`. Passed to the device verbatim.
    pub start_sector: String,
    /// Length in sectors.
    pub sectors: u64,
    pub sector_size: u32,
    /// Image file associated by a rawprogram XML, empty when none.
    pub file_name: String,
}

impl PartitionInfo {
    /// Last sector occupied, when the extent is numeric.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors.saturating_sub(1)
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors * u64::from(self.sector_size)
    }

    pub fn size_kb(&self) -> f64 {
        self.size_bytes() as f64 / 1024.0
    }

    pub fn size_mb(&self) -> f64 {
        self.size_kb() / 1024.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_accessors() {
        let p = PartitionInfo {
            lun: 0,
            name: "boot".into(),
            start_lba: 2048,
            start_sector: "2048".into(),
            sectors: 4096,
            sector_size: 512,
            file_name: String::new(),
        };
        assert_eq!(p.end_lba(), 6143);
        assert_eq!(p.size_bytes(), 2 * 1024 * 1024);
        assert_eq!(p.size_mb(), 2.0);
    }
}
