//! rawprogram / patch XML handling.
//!
//! Factory firmware packages describe a flash job as `rawprogramN.xml`
//! (which image goes to which sectors) plus `patchN.xml` (in-place fixups
//! the loader applies afterwards, mostly GPT CRC rewrites). Start sectors
//! and patch values may be loader-side formulas like `NUM_DISK_SECTORS-5.`
//! and are carried verbatim, never evaluated on the host.

use tracing::warn;

use crate::partition::PartitionInfo;
use crate::protocol::scan_elements;

/// Fallback when neither the XML nor the device supplied a sector size.
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// One `<program>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramEntry {
    pub label: String,
    /// Image file to flash, empty for bare layout entries.
    pub file_name: String,
    /// Verbatim start sector, possibly symbolic.
    pub start_sector: String,
    pub num_sectors: u64,
    /// Physical partition number, verbatim.
    pub lun: String,
    pub sector_size: u32,
    /// Sectors to skip at the start of the image file.
    pub file_sector_offset: u64,
    pub sparse: bool,
}

impl ProgramEntry {
    pub fn size_bytes(&self) -> u64 {
        self.num_sectors * u64::from(self.sector_size)
    }

    pub fn to_partition_info(&self) -> PartitionInfo {
        PartitionInfo {
            lun: self.lun.parse().unwrap_or(0),
            name: self.label.clone(),
            start_lba: self.start_sector.parse().unwrap_or(0),
            start_sector: self.start_sector.clone(),
            sectors: self.num_sectors,
            sector_size: self.sector_size,
            file_name: self.file_name.clone(),
        }
    }
}

/// One `<patch>` element. `value` may itself be a formula such as
/// `CRC32(2,92)` and is forwarded untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub start_sector: String,
    pub byte_offset: u64,
    pub value: String,
    pub size_in_bytes: u32,
    pub lun: String,
}

/// Parse a rawprogram XML document.
///
/// Unknown or malformed numeric attributes degrade to their documented
/// defaults instead of failing the whole file; factory XMLs are messy.
/// `device_sector_size` fills in when `SECTOR_SIZE_IN_BYTES` is absent.
pub fn parse_program_xml(content: &str, device_sector_size: Option<u32>) -> Vec<ProgramEntry> {
    let mut entries = Vec::new();
    for elem in scan_elements(content) {
        if !elem.name.eq_ignore_ascii_case("program") {
            continue;
        }

        let sector_size = elem
            .attr("SECTOR_SIZE_IN_BYTES")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&ss| ss > 0)
            .or(device_sector_size.filter(|&ss| ss > 0))
            .unwrap_or(DEFAULT_SECTOR_SIZE);

        let start_sector = match elem.attr("start_sector") {
            Some(v) => v.to_string(),
            // Older XMLs spell the position in bytes.
            None => elem
                .attr("start_byte_hex")
                .and_then(|v| parse_hex(v))
                .map(|bytes| (bytes / u64::from(sector_size)).to_string())
                .unwrap_or_else(|| "0".to_string()),
        };

        let num_sectors = match elem
            .attr("num_partition_sectors")
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(n) => n,
            None => elem
                .attr("size_in_KB")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|kb| (kb * 1024.0 / f64::from(sector_size)) as u64)
                .unwrap_or(0),
        };

        entries.push(ProgramEntry {
            label: elem.attr("label").unwrap_or_default().to_string(),
            file_name: elem.attr("filename").unwrap_or_default().to_string(),
            start_sector,
            num_sectors,
            lun: elem
                .attr("physical_partition_number")
                .unwrap_or("0")
                .to_string(),
            sector_size,
            file_sector_offset: elem
                .attr("file_sector_offset")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sparse: elem
                .attr("sparse")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        });
    }
    entries
}

/// Parse a patch XML document. Works on full documents and on bare stacks of
/// `<patch />` elements alike, since the scanner has no root-node notion.
pub fn parse_patch_xml(content: &str) -> Vec<PatchEntry> {
    let mut entries = Vec::new();
    for elem in scan_elements(content) {
        if !elem.name.eq_ignore_ascii_case("patch") {
            continue;
        }
        let byte_offset = match elem.attr("byte_offset").unwrap_or("0").parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    sector = elem.attr("start_sector").unwrap_or(""),
                    "Skipping patch with unparseable byte_offset"
                );
                continue;
            }
        };
        entries.push(PatchEntry {
            start_sector: elem.attr("start_sector").unwrap_or("0").to_string(),
            byte_offset,
            value: elem.attr("value").unwrap_or_default().to_string(),
            size_in_bytes: elem
                .attr("size_in_bytes")
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            lun: elem
                .attr("physical_partition_number")
                .unwrap_or("0")
                .to_string(),
        });
    }
    entries
}

/// Render a partition list back into rawprogram form, e.g. after reading a
/// device's GPT, so the layout can be re-flashed later.
pub fn generate_program_xml(partitions: &[PartitionInfo]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" ?>\n<data>\n");
    for p in partitions {
        let start_sector = if p.start_sector.is_empty() {
            p.start_lba.to_string()
        } else {
            p.start_sector.clone()
        };
        out.push_str(&format!(
            "  <program SECTOR_SIZE_IN_BYTES=\"{}\" file_sector_offset=\"0\" filename=\"{}\" \
             label=\"{}\" num_partition_sectors=\"{}\" physical_partition_number=\"{}\" \
             size_in_KB=\"{}\" sparse=\"false\" start_byte_hex=\"0x{:X}\" start_sector=\"{}\" />\n",
            p.sector_size,
            p.file_name,
            p.name,
            p.sectors,
            p.lun,
            p.size_kb(),
            p.start_lba * u64::from(p.sector_size),
            start_sector,
        ));
    }
    out.push_str("</data>\n");
    out
}

fn parse_hex(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_program() {
        let xml = r#"<?xml version="1.0" ?>
<data>
  <program SECTOR_SIZE_IN_BYTES="4096" filename="xbl.elf" label="xbl"
           num_partition_sectors="1024" physical_partition_number="1"
           start_sector="6" file_sector_offset="0" sparse="false" />
</data>"#;
        let entries = parse_program_xml(xml, None);
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.label, "xbl");
        assert_eq!(e.file_name, "xbl.elf");
        assert_eq!(e.start_sector, "6");
        assert_eq!(e.num_sectors, 1024);
        assert_eq!(e.lun, "1");
        assert_eq!(e.sector_size, 4096);
        assert!(!e.sparse);
    }

    #[test]
    fn test_symbolic_start_sector_kept_verbatim() {
        let xml = r#"<data><program label="gptbackup" filename="gpt_backup0.bin"
            num_partition_sectors="5" start_sector="NUM_DISK_SECTORS-5." /></data>"#;
        let entries = parse_program_xml(xml, Some(512));
        assert_eq!(entries[0].start_sector, "NUM_DISK_SECTORS-5.");
        assert_eq!(entries[0].sector_size, 512);
        assert_eq!(entries[0].to_partition_info().start_lba, 0);
    }

    #[test]
    fn test_start_byte_hex_and_size_kb_fallbacks() {
        let xml = r#"<data><program SECTOR_SIZE_IN_BYTES="512" label="sbl"
            start_byte_hex="0x4000" size_in_KB="64.0" /></data>"#;
        let e = &parse_program_xml(xml, None)[0];
        assert_eq!(e.start_sector, "32"); // 0x4000 / 512
        assert_eq!(e.num_sectors, 128); // 64 KiB / 512
    }

    #[test]
    fn test_sector_size_defaults() {
        let xml = r#"<data><program label="a" start_sector="0" num_partition_sectors="1" /></data>"#;
        assert_eq!(parse_program_xml(xml, Some(512))[0].sector_size, 512);
        assert_eq!(parse_program_xml(xml, None)[0].sector_size, DEFAULT_SECTOR_SIZE);
    }

    #[test]
    fn test_entries_without_filename_kept() {
        // Layout-only rows still matter for partition table display.
        let xml = r#"<data><program label="last_parti" start_sector="0"
            num_partition_sectors="0" /></data>"#;
        assert_eq!(parse_program_xml(xml, None).len(), 1);
    }

    #[test]
    fn test_parse_patch_document_and_bare_stack() {
        let doc = r#"<?xml version="1.0" ?><patches>
  <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="88" filename="DISK"
         physical_partition_number="0" size_in_bytes="4"
         start_sector="NUM_DISK_SECTORS-1." value="CRC32(NUM_DISK_SECTORS-33.,4096)" />
</patches>"#;
        let entries = parse_patch_xml(doc);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].byte_offset, 88);
        assert_eq!(entries[0].value, "CRC32(NUM_DISK_SECTORS-33.,4096)");
        assert_eq!(entries[0].start_sector, "NUM_DISK_SECTORS-1.");

        let bare = r#"<patch byte_offset="16" start_sector="2" value="0" />"#;
        assert_eq!(parse_patch_xml(bare).len(), 1);
    }

    #[test]
    fn test_generate_round_trips_through_parser() {
        let parts = vec![PartitionInfo {
            lun: 0,
            name: "boot".into(),
            start_lba: 2048,
            start_sector: "2048".into(),
            sectors: 8192,
            sector_size: 512,
            file_name: "boot.img".into(),
        }];
        let xml = generate_program_xml(&parts);
        let entries = parse_program_xml(&xml, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, "boot");
        assert_eq!(entries[0].file_name, "boot.img");
        assert_eq!(entries[0].start_sector, "2048");
        assert_eq!(entries[0].num_sectors, 8192);
    }
}
