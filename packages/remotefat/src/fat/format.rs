use super::{dir::normalize_short_char, ATTR_VOLUME, FAT32_EOC_WRITE};
use crate::{
    error::{CorruptVolume, Error},
    SECTOR_SIZE,
};

const MEDIA_FIXED: u8 = 0xF8;

#[derive(Clone, Debug)]
pub struct FormatOptions {
    pub clusters: u32,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    /// Put an MBR in sector 0 and the volume at sector 1.
    pub with_mbr: bool,
    pub root_cluster: u32,
    pub label: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            clusters: 200,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            with_mbr: true,
            root_cluster: 2,
            label: "MEGA65".to_string(),
        }
    }
}

/// Builds a blank FAT32 image: boot sector, two tables and a root directory
/// holding only the volume label.
pub fn format_image(options: &FormatOptions) -> Result<Vec<u8>, Error> {
    let spc = options.sectors_per_cluster;
    if spc == 0 || !spc.is_power_of_two() {
        return Err(Error::CorruptVolume(
            CorruptVolume::UnsupportedSectorsPerCluster(spc),
        ));
    }
    let max_cluster = options.clusters + 1;
    if options.clusters == 0 || !(2..=max_cluster).contains(&options.root_cluster) {
        return Err(Error::CorruptVolume(
            CorruptVolume::RootOutOfRange(options.root_cluster),
        ));
    }
    let label = volume_label(&options.label)?;

    let fats = 2u32;
    let spf = ((options.clusters as usize + 2) * 4).div_ceil(SECTOR_SIZE) as u32;
    let reserved = options.reserved_sectors.max(1) as u32;
    let total_sectors = reserved + fats * spf + options.clusters * spc as u32;
    let partition_start = u32::from(options.with_mbr);

    let mut image = vec![0u8; (partition_start + total_sectors) as usize * SECTOR_SIZE];

    if options.with_mbr {
        let entry = 446;
        image[entry] = 0x80;
        image[entry + 4] = 0x0C;
        image[entry + 8..entry + 12].copy_from_slice(&partition_start.to_le_bytes());
        image[entry + 12..entry + 16].copy_from_slice(&total_sectors.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;
    }

    let boot_at = partition_start as usize * SECTOR_SIZE;
    let boot = &mut image[boot_at..boot_at + SECTOR_SIZE];
    boot[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    boot[3..11].copy_from_slice(b"M65FTP  ");
    boot[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    boot[13] = spc;
    boot[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
    boot[16] = fats as u8;
    boot[21] = MEDIA_FIXED;
    boot[28..32].copy_from_slice(&partition_start.to_le_bytes());
    boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    boot[36..40].copy_from_slice(&spf.to_le_bytes());
    boot[44..48].copy_from_slice(&options.root_cluster.to_le_bytes());
    boot[66] = 0x29;
    boot[71..82].copy_from_slice(&label);
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;

    let reserved_entries = [
        (0u32, 0x0FFF_FF00 | MEDIA_FIXED as u32),
        (1, FAT32_EOC_WRITE),
        (options.root_cluster, FAT32_EOC_WRITE),
    ];
    for copy in 0..fats {
        let table_at = (partition_start + reserved + copy * spf) as usize * SECTOR_SIZE;
        for (cluster, value) in reserved_entries {
            let at = table_at + cluster as usize * 4;
            image[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    let data_start = partition_start + reserved + fats * spf;
    let root_at =
        (data_start + (options.root_cluster - 2) * spc as u32) as usize * SECTOR_SIZE;
    image[root_at..root_at + 11].copy_from_slice(&label);
    image[root_at + 11] = ATTR_VOLUME;

    Ok(image)
}

fn volume_label(text: &str) -> Result<[u8; 11], Error> {
    let bytes = text.as_bytes();
    if bytes.len() > 11 {
        return Err(Error::InvalidName(text.to_string()));
    }
    let mut out = [b' '; 11];
    for (i, b) in bytes.iter().enumerate() {
        out[i] = match b {
            b' ' => b' ',
            _ => normalize_short_char(*b).ok_or_else(|| Error::InvalidName(text.to_string()))?,
        };
    }
    Ok(out)
}
