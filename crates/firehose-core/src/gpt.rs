//! GPT partition table decoding.
//!
//! Parses the primary header and entry array from a raw dump of the first
//! sectors of a LUN. Sector size is auto-detected by probing the header
//! signature at LBA 1 for UFS (4096) then eMMC (512); a dump with neither is
//! simply not a GPT and yields an empty list rather than an error, since
//! blank LUNs are routine on factory devices.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use crate::partition::PartitionInfo;

/// "EFI PART" read as a little-endian u64.
pub const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645;

pub const GPT_HEADER_LEN: usize = 92;
const ENTRY_FIXED_LEN: usize = 128;
const NAME_LEN: usize = 72;

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    /// Parse the 92-byte header. `data` starts at the signature.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < GPT_HEADER_LEN || LittleEndian::read_u64(&data[0..8]) != GPT_SIGNATURE {
            return None;
        }
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&data[56..72]);
        Some(Self {
            revision: LittleEndian::read_u32(&data[8..12]),
            header_size: LittleEndian::read_u32(&data[12..16]),
            header_crc32: LittleEndian::read_u32(&data[16..20]),
            my_lba: LittleEndian::read_u64(&data[24..32]),
            alternate_lba: LittleEndian::read_u64(&data[32..40]),
            first_usable_lba: LittleEndian::read_u64(&data[40..48]),
            last_usable_lba: LittleEndian::read_u64(&data[48..56]),
            disk_guid,
            partition_entry_lba: LittleEndian::read_u64(&data[72..80]),
            number_of_partition_entries: LittleEndian::read_u32(&data[80..84]),
            size_of_partition_entry: LittleEndian::read_u32(&data[84..88]),
            partition_entry_array_crc32: LittleEndian::read_u32(&data[88..92]),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GptEntry {
    pub partition_type_guid: [u8; 16],
    pub unique_partition_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    /// Parse one entry record. Returns `None` for unused slots, marked by an
    /// all-zero type and unique GUID.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_FIXED_LEN {
            return None;
        }
        if data[..32].iter().all(|&b| b == 0) {
            return None;
        }
        let mut partition_type_guid = [0u8; 16];
        partition_type_guid.copy_from_slice(&data[0..16]);
        let mut unique_partition_guid = [0u8; 16];
        unique_partition_guid.copy_from_slice(&data[16..32]);
        Some(Self {
            partition_type_guid,
            unique_partition_guid,
            starting_lba: LittleEndian::read_u64(&data[32..40]),
            ending_lba: LittleEndian::read_u64(&data[40..48]),
            attributes: LittleEndian::read_u64(&data[48..56]),
            name: decode_name(&data[56..56 + NAME_LEN]),
        })
    }
}

/// UTF-16LE, NUL-trimmed partition name.
fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn signature_at(data: &[u8], offset: usize) -> bool {
    data.len() >= offset + 8 && LittleEndian::read_u64(&data[offset..offset + 8]) == GPT_SIGNATURE
}

/// Parse a GPT dump into the partitions it describes.
///
/// `lun` is recorded on each result so multi-LUN tables can be merged.
pub fn parse_gpt(data: &[u8], lun: u32) -> Vec<PartitionInfo> {
    let (sector_size, header_offset) = if signature_at(data, 4096) {
        (4096usize, 4096usize)
    } else if signature_at(data, 512) {
        (512, 512)
    } else {
        trace!(lun, "No GPT signature at LBA 1, treating as blank");
        return Vec::new();
    };

    let Some(header) = GptHeader::parse(&data[header_offset..]) else {
        return Vec::new();
    };

    // Entry array position per the header; fall back to the conventional
    // LBA 2 when the header points outside the dump or overflows.
    let entry_start = match (header.partition_entry_lba as usize).checked_mul(sector_size) {
        Some(at) if at < data.len() => at,
        _ => header_offset + sector_size,
    };

    let stride = header.size_of_partition_entry as usize;
    if stride < ENTRY_FIXED_LEN {
        debug!(lun, stride, "Entry size below minimum, treating as blank");
        return Vec::new();
    }

    let mut partitions = Vec::new();
    for i in 0..header.number_of_partition_entries as usize {
        let offset = entry_start + i * stride;
        if offset + ENTRY_FIXED_LEN > data.len() {
            break;
        }
        if let Some(entry) = GptEntry::parse(&data[offset..]) {
            // An inverted extent (last below first) is recorded as zero
            // sectors so callers can see the anomaly instead of a wrapped
            // sector count.
            let sectors = entry
                .ending_lba
                .checked_sub(entry.starting_lba)
                .map(|s| s.saturating_add(1))
                .unwrap_or_else(|| {
                    debug!(
                        lun,
                        name = %entry.name,
                        first = entry.starting_lba,
                        last = entry.ending_lba,
                        "Inverted partition extent"
                    );
                    0
                });
            partitions.push(PartitionInfo {
                lun,
                name: entry.name,
                start_lba: entry.starting_lba,
                start_sector: entry.starting_lba.to_string(),
                sectors,
                sector_size: sector_size as u32,
                file_name: String::new(),
            });
        }
    }
    debug!(lun, count = partitions.len(), sector_size, "Parsed GPT");
    partitions
}

/// CRC32 variant carried by GPT structures on Qualcomm devices.
///
/// Right-shift table form with polynomial 0x04C11DB7 taken as-is rather than
/// bit-reflected, so check values differ from the IEEE CRC. Kept
/// bit-compatible with gpttool since these checksums are written back to
/// devices when a table is patched.
pub struct Crc32 {
    table: [u32; 256],
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        const POLY: u32 = 0x04C1_1DB7;
        let mut table = [0u32; 256];
        let mut i = 0u32;
        while i < 256 {
            let mut temp = i;
            let mut j = 8;
            while j > 0 {
                if temp & 1 == 1 {
                    temp = (temp >> 1) ^ POLY;
                } else {
                    temp >>= 1;
                }
                j -= 1;
            }
            table[i as usize] = temp;
            i += 1;
        }
        Self { table }
    }

    pub fn checksum(&self, bytes: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &b in bytes {
            let index = ((crc & 0xFF) as u8 ^ b) as usize;
            crc = (crc >> 8) ^ self.table[index];
        }
        !crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn write_header(buf: &mut [u8], sector_size: usize, num_entries: u32, entry_lba: u64) {
        let h = &mut buf[sector_size..];
        LittleEndian::write_u64(&mut h[0..8], GPT_SIGNATURE);
        LittleEndian::write_u32(&mut h[8..12], 0x00010000);
        LittleEndian::write_u32(&mut h[12..16], GPT_HEADER_LEN as u32);
        LittleEndian::write_u64(&mut h[24..32], 1); // MyLBA
        LittleEndian::write_u64(&mut h[72..80], entry_lba);
        LittleEndian::write_u32(&mut h[80..84], num_entries);
        LittleEndian::write_u32(&mut h[84..88], ENTRY_FIXED_LEN as u32);
    }

    fn write_entry(buf: &mut [u8], start_lba: u64, end_lba: u64, name: &str) {
        buf[0] = 0xAA; // non-zero type GUID marks the slot used
        buf[16] = 0xBB;
        LittleEndian::write_u64(&mut buf[32..40], start_lba);
        LittleEndian::write_u64(&mut buf[40..48], end_lba);
        let mut cursor = &mut buf[56..56 + NAME_LEN];
        for unit in name.encode_utf16() {
            cursor.write_u16::<LittleEndian>(unit).unwrap();
        }
    }

    fn sample_table(sector_size: usize) -> Vec<u8> {
        // LBA 0 protective MBR (zeros), LBA 1 header, LBA 2 entries.
        let mut img = vec![0u8; sector_size * 3];
        write_header(&mut img, sector_size, 2, 2);
        // Slot 0 left all-zero (unused), slot 1 populated.
        let entries = sector_size * 2 + ENTRY_FIXED_LEN;
        write_entry(&mut img[entries..], 6, 2053, "modem");
        img
    }

    #[test]
    fn test_parse_ufs_table_skips_unused_slots() {
        let parts = parse_gpt(&sample_table(4096), 0);
        assert_eq!(parts.len(), 1);
        let p = &parts[0];
        assert_eq!(p.name, "modem");
        assert_eq!(p.start_lba, 6);
        assert_eq!(p.start_sector, "6");
        assert_eq!(p.sectors, 2048);
        assert_eq!(p.sector_size, 4096);
    }

    #[test]
    fn test_parse_emmc_sector_size_detected() {
        let parts = parse_gpt(&sample_table(512), 3);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].sector_size, 512);
        assert_eq!(parts[0].lun, 3);
    }

    #[test]
    fn test_no_signature_yields_empty() {
        assert!(parse_gpt(&vec![0u8; 8192], 0).is_empty());
        assert!(parse_gpt(&[], 0).is_empty());
    }

    #[test]
    fn test_entry_lba_out_of_range_falls_back() {
        let mut img = sample_table(512);
        // Point the entry array far past the dump; the parser should fall
        // back to LBA 2 and still find the entry.
        LittleEndian::write_u64(&mut img[512 + 72..512 + 80], 1 << 40);
        let parts = parse_gpt(&img, 0);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "modem");
    }

    #[test]
    fn test_inverted_extent_reports_zero_sectors() {
        let mut img = sample_table(512);
        let entries = 512 * 2 + ENTRY_FIXED_LEN;
        write_entry(&mut img[entries..], 100, 10, "broken");
        let parts = parse_gpt(&img, 0);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 100);
        assert_eq!(parts[0].sectors, 0);
    }

    #[test]
    fn test_entry_lba_overflow_falls_back() {
        let mut img = sample_table(512);
        // LBA so large that lba * sector_size overflows usize.
        LittleEndian::write_u64(&mut img[512 + 72..512 + 80], u64::MAX);
        let parts = parse_gpt(&img, 0);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "modem");
    }

    #[test]
    fn test_name_is_nul_trimmed() {
        let mut raw = [0u8; NAME_LEN];
        raw[0] = b'x';
        raw[2] = b'b';
        raw[4] = b'l';
        assert_eq!(decode_name(&raw), "xbl");
    }

    #[test]
    fn test_crc_is_deterministic_and_discriminating() {
        let crc = Crc32::new();
        assert_eq!(crc.checksum(b""), 0);
        let a = crc.checksum(b"EFI PART");
        assert_eq!(a, crc.checksum(b"EFI PART"));
        assert_ne!(a, crc.checksum(b"EFI PARU"));
        assert_ne!(crc.checksum(&[0u8; 92]), crc.checksum(&[0u8; 91]));
    }
}
