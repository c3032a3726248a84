use super::{le16, le32};
use crate::{block::Sector, error::CorruptVolume, SECTOR_SIZE};

const FAT_ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

/// Geometry of a FAT32 volume, read once from its boot sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootParameterBlock {
    pub partition_start: u32,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fats: u8,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub total_sectors: u32,
    pub label: [u8; 11],
}

impl BootParameterBlock {
    pub fn parse(partition_start: u32, boot: &Sector) -> Result<Self, CorruptVolume> {
        if boot[510] != 0x55 || boot[511] != 0xAA {
            return Err(CorruptVolume::BadSignature {
                sector: partition_start,
            });
        }

        let bytes_per_sector = le16(boot, 11);
        if bytes_per_sector != SECTOR_SIZE as u16 {
            return Err(CorruptVolume::UnsupportedSectorSize(bytes_per_sector));
        }

        let sectors_per_cluster = boot[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(CorruptVolume::UnsupportedSectorsPerCluster(
                sectors_per_cluster,
            ));
        }

        let reserved_sectors = le16(boot, 14);
        if reserved_sectors == 0 {
            return Err(CorruptVolume::BadGeometry("no reserved sectors"));
        }
        let fats = boot[16];
        if fats == 0 {
            return Err(CorruptVolume::BadGeometry("no allocation tables"));
        }

        // FAT32 keeps the 16-bit table size at zero.
        let fat_size_16 = le16(boot, 22);
        let sectors_per_fat = le32(boot, 36);
        if fat_size_16 != 0 || sectors_per_fat == 0 {
            return Err(CorruptVolume::BadGeometry("not a FAT32 boot sector"));
        }

        let total_16 = le16(boot, 19) as u32;
        let total_sectors = if total_16 != 0 {
            total_16
        } else {
            le32(boot, 32)
        };

        let mut label = [b' '; 11];
        label.copy_from_slice(&boot[71..82]);

        let bpb = Self {
            partition_start,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fats,
            sectors_per_fat,
            root_cluster: le32(boot, 44),
            total_sectors,
            label,
        };

        let used = (reserved_sectors as u32)
            .saturating_add(sectors_per_fat.saturating_mul(fats as u32));
        if total_sectors <= used || bpb.total_clusters() == 0 {
            return Err(CorruptVolume::BadGeometry("no room for data clusters"));
        }
        if bpb.root_cluster < 2 || bpb.root_cluster > bpb.max_cluster() {
            return Err(CorruptVolume::RootOutOfRange(bpb.root_cluster));
        }
        Ok(bpb)
    }

    pub fn fat_start(&self) -> u32 {
        self.partition_start + self.reserved_sectors as u32
    }

    pub fn data_start(&self) -> u32 {
        self.fat_start() + self.sectors_per_fat * self.fats as u32
    }

    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn total_clusters(&self) -> u32 {
        let used = (self.reserved_sectors as u32)
            .saturating_add(self.sectors_per_fat.saturating_mul(self.fats as u32));
        self.total_sectors.saturating_sub(used) / self.sectors_per_cluster as u32
    }

    /// Highest usable cluster number, bounded both by the data area and by
    /// how many entries one table copy can hold.
    pub fn max_cluster(&self) -> u32 {
        let by_data = self.total_clusters() + 1;
        let by_table = self
            .sectors_per_fat
            .saturating_mul(FAT_ENTRIES_PER_SECTOR)
            .saturating_sub(1);
        by_data.min(by_table)
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.data_start() + cluster.saturating_sub(2) * self.sectors_per_cluster as u32
    }

    pub fn label_text(&self) -> String {
        String::from_utf8_lossy(&self.label)
            .trim_end_matches([' ', '\0'])
            .to_string()
    }
}

/// One primary slot of an MBR partition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbrPartition {
    pub index: u8,
    pub bootable: bool,
    pub kind: u8,
    pub start: u32,
    pub sectors: u32,
}

impl MbrPartition {
    pub fn is_fat(&self) -> bool {
        matches!(self.kind, 0x0B | 0x0C | 0x0E | 0x06 | 0x04)
    }
}

/// Used primary slots of the MBR in sector 0, or `None` without a 55AA
/// signature.
pub fn partition_table(sector0: &Sector) -> Option<Vec<MbrPartition>> {
    if sector0[510] != 0x55 || sector0[511] != 0xAA {
        return None;
    }
    Some(
        (0..4u8)
            .map(|index| {
                let base = 446 + index as usize * 16;
                MbrPartition {
                    index,
                    bootable: sector0[base] & 0x80 != 0,
                    kind: sector0[base + 4],
                    start: le32(sector0, base + 8),
                    sectors: le32(sector0, base + 12),
                }
            })
            .filter(|part| part.kind != 0)
            .collect(),
    )
}

/// Start of the first FAT-typed primary partition in an MBR, if sector 0 is
/// one.
pub fn first_fat_partition_lba(sector0: &Sector) -> Option<u32> {
    partition_table(sector0)?
        .into_iter()
        .find(|part| part.is_fat() && part.start != 0)
        .map(|part| part.start)
}
