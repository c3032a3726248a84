use std::collections::BTreeSet;

use crate::{block::Sector, error::CorruptVolume, SECTOR_SIZE};

pub const FAT32_EOC: u32 = 0x0FFF_FFF8;
pub const FAT32_EOC_WRITE: u32 = 0x0FFF_FFFF;
pub const FAT32_BAD: u32 = 0x0FFF_FFF7;

const ENTRY_MASK: u32 = 0x0FFF_FFFF;
const RESERVED_MASK: u32 = 0xF000_0000;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Maximal run of free clusters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterRun {
    pub start: u32,
    pub len: u32,
}

impl ClusterRun {
    pub fn end(&self) -> u32 {
        self.start + self.len
    }

    pub fn clusters(&self) -> std::ops::Range<u32> {
        self.start..self.end()
    }
}

/// One pending table write: `cluster` gets `value` in its low 28 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableUpdate {
    pub cluster: u32,
    pub value: u32,
}

/// Cached copy of the allocation table, tracking which of its sectors
/// changed since the last flush.
#[derive(Clone, Debug)]
pub struct AllocationTable {
    raw: Vec<u32>,
    max_cluster: u32,
    dirty: BTreeSet<u32>,
}

impl AllocationTable {
    pub fn from_sectors(sectors: &[Sector], max_cluster: u32) -> Self {
        let mut raw = Vec::with_capacity(sectors.len() * ENTRIES_PER_SECTOR);
        for sector in sectors {
            raw.extend(
                sector
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }
        Self {
            raw,
            max_cluster,
            dirty: BTreeSet::new(),
        }
    }

    pub fn max_cluster(&self) -> u32 {
        self.max_cluster
    }

    pub fn sector_count(&self) -> u32 {
        (self.raw.len() / ENTRIES_PER_SECTOR) as u32
    }

    /// Low 28 bits of the entry; clusters past the table read as end of chain.
    pub fn entry(&self, cluster: u32) -> u32 {
        self.raw
            .get(cluster as usize)
            .map_or(FAT32_EOC_WRITE, |raw| raw & ENTRY_MASK)
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        (2..=self.max_cluster).contains(&cluster) && self.entry(cluster) == 0
    }

    pub fn set(&mut self, cluster: u32, value: u32) {
        let Some(slot) = self.raw.get_mut(cluster as usize) else {
            return;
        };
        *slot = (*slot & RESERVED_MASK) | (value & ENTRY_MASK);
        self.dirty.insert(cluster / ENTRIES_PER_SECTOR as u32);
    }

    pub fn apply(&mut self, updates: &[TableUpdate]) {
        for update in updates {
            self.set(update.cluster, update.value);
        }
    }

    pub fn free_runs(&self) -> Vec<ClusterRun> {
        let mut runs = Vec::new();
        let mut current: Option<ClusterRun> = None;
        for cluster in 2..=self.max_cluster {
            if self.entry(cluster) == 0 {
                match current.as_mut() {
                    Some(run) => run.len += 1,
                    None => current = Some(ClusterRun { start: cluster, len: 1 }),
                }
            } else if let Some(run) = current.take() {
                runs.push(run);
            }
        }
        runs.extend(current);
        runs
    }

    pub fn free_count(&self) -> u32 {
        (2..=self.max_cluster)
            .filter(|cluster| self.entry(*cluster) == 0)
            .count() as u32
    }

    /// Clusters of the chain starting at `start`, in order. A start of 0 is
    /// the empty chain of a zero-length file.
    pub fn chain_of(&self, start: u32) -> Result<Vec<u32>, CorruptVolume> {
        if start == 0 {
            return Ok(Vec::new());
        }
        if start < 2 || start > self.max_cluster {
            return Err(CorruptVolume::DanglingPointer {
                cluster: 0,
                value: start,
            });
        }

        let limit = (self.max_cluster - 1) as usize;
        let mut chain = Vec::new();
        let mut cluster = start;
        loop {
            if chain.len() >= limit {
                return Err(CorruptVolume::ChainCycle { start });
            }
            chain.push(cluster);
            let value = self.entry(cluster);
            if value >= FAT32_EOC {
                return Ok(chain);
            }
            if value == FAT32_BAD {
                return Err(CorruptVolume::BadCluster { cluster });
            }
            if value < 2 || value > self.max_cluster {
                return Err(CorruptVolume::DanglingPointer { cluster, value });
            }
            cluster = value;
        }
    }

    pub fn dirty_sectors(&self) -> Vec<u32> {
        self.dirty.iter().copied().collect()
    }

    pub fn mark_dirty(&mut self, index: u32) {
        if index < self.sector_count() {
            self.dirty.insert(index);
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Serialised form of table sector `index`, reserved bits included.
    pub fn sector_bytes(&self, index: u32) -> Sector {
        let mut out = [0u8; SECTOR_SIZE];
        let base = index as usize * ENTRIES_PER_SECTOR;
        for (i, chunk) in out.chunks_exact_mut(4).enumerate() {
            let value = self.raw.get(base + i).copied().unwrap_or(0);
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}
