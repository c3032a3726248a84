use log::{debug, info, warn};

use super::{
    bpb::{first_fat_partition_lba, BootParameterBlock},
    table::{AllocationTable, ClusterRun, TableUpdate},
};
use crate::{
    block::{BlockDevice, Sector},
    error::{CorruptVolume, Error},
};

/// A mounted FAT32 volume: geometry plus a cached allocation table, over any
/// block device.
pub struct FatVolume<D> {
    device: D,
    bpb: BootParameterBlock,
    table: AllocationTable,
}

impl<D: BlockDevice> FatVolume<D> {
    pub fn load(mut device: D) -> Result<Self, Error> {
        let (bpb, table) = read_layout(&mut device)?;
        Ok(Self { device, bpb, table })
    }

    /// Re-reads geometry and tables after sectors were written behind the
    /// cache's back.
    pub fn remount(&mut self) -> Result<(), Error> {
        let (bpb, table) = read_layout(&mut self.device)?;
        self.bpb = bpb;
        self.table = table;
        Ok(())
    }

    pub fn bpb(&self) -> &BootParameterBlock {
        &self.bpb
    }

    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    pub fn cluster_size(&self) -> u32 {
        self.bpb.cluster_size()
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.bpb.sectors_per_cluster as u32
    }

    pub fn max_cluster(&self) -> u32 {
        self.bpb.max_cluster()
    }

    pub fn root_cluster(&self) -> u32 {
        self.bpb.root_cluster
    }

    pub fn free_runs(&self) -> Vec<ClusterRun> {
        self.table.free_runs()
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.table.free_count()
    }

    pub fn chain_of(&self, start: u32) -> Result<Vec<u32>, CorruptVolume> {
        self.table.chain_of(start)
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.bpb.cluster_to_sector(cluster)
    }

    pub fn read_cluster_sectors(&mut self, cluster: u32, count: u32) -> Result<Vec<Sector>, Error> {
        let count = count.min(self.sectors_per_cluster());
        let start = self.cluster_to_sector(cluster);
        self.device.read_sectors(start, count)
    }

    /// Reads whole clusters, merging adjacent ones into single requests.
    pub fn read_clusters(&mut self, clusters: &[u32]) -> Result<Vec<Sector>, Error> {
        let spc = self.sectors_per_cluster();
        let mut out = Vec::with_capacity(clusters.len() * spc as usize);
        for run in contiguous_runs(clusters) {
            let start = self.cluster_to_sector(run.start);
            out.extend(self.device.read_sectors(start, run.len * spc)?);
        }
        Ok(out)
    }

    pub fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        self.device.read_sector(sector)
    }

    pub fn write_sectors(&mut self, writes: &[(u32, Sector)]) -> Result<(), Error> {
        self.device.write_sectors(writes)
    }

    /// Applies chain updates to the cached table, writes every changed table
    /// sector to all copies, then writes the directory sectors. A failed table
    /// write restores the cached entries; their sectors stay dirty.
    pub fn commit(
        &mut self,
        chain_updates: &[TableUpdate],
        directory_updates: &[(u32, Sector)],
    ) -> Result<(), Error> {
        let previous: Vec<TableUpdate> = chain_updates
            .iter()
            .rev()
            .map(|update| TableUpdate {
                cluster: update.cluster,
                value: self.table.entry(update.cluster),
            })
            .collect();
        self.table.apply(chain_updates);
        let dirty = self.table.dirty_sectors();
        if !dirty.is_empty() {
            let mut writes = Vec::with_capacity(dirty.len() * self.bpb.fats as usize);
            for copy in 0..self.bpb.fats as u32 {
                let base = self.bpb.fat_start() + copy * self.bpb.sectors_per_fat;
                for idx in &dirty {
                    writes.push((base + idx, self.table.sector_bytes(*idx)));
                }
            }
            if let Err(err) = self.device.write_sectors(&writes) {
                self.table.apply(&previous);
                return Err(err);
            }
            self.table.clear_dirty();
            debug!(
                "committed {} table sectors to {} copies",
                dirty.len(),
                self.bpb.fats
            );
        }
        if !directory_updates.is_empty() {
            self.device.write_sectors(directory_updates)?;
        }
        Ok(())
    }
}

fn read_layout<D: BlockDevice>(
    device: &mut D,
) -> Result<(BootParameterBlock, AllocationTable), Error> {
    let sector0 = device.read_sector(0)?;
    let bpb = match first_fat_partition_lba(&sector0) {
        Some(start) => {
            let boot = device.read_sector(start)?;
            match BootParameterBlock::parse(start, &boot) {
                Ok(bpb) => bpb,
                Err(err) => {
                    debug!("partition at sector {start} unusable ({err}); trying sector 0");
                    BootParameterBlock::parse(0, &sector0)?
                }
            }
        }
        None => BootParameterBlock::parse(0, &sector0)?,
    };

    let max_cluster = bpb.max_cluster();
    let mut copies = Vec::with_capacity(bpb.fats as usize);
    for copy in 0..bpb.fats as u32 {
        let start = bpb.fat_start() + copy * bpb.sectors_per_fat;
        copies.push(device.read_sectors(start, bpb.sectors_per_fat)?);
    }

    let mut table = AllocationTable::from_sectors(&copies[0], max_cluster);
    for (copy, sectors) in copies.iter().enumerate().skip(1) {
        let differing: Vec<u32> = sectors
            .iter()
            .zip(&copies[0])
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(idx, _)| idx as u32)
            .collect();
        if !differing.is_empty() {
            warn!(
                "table copy {copy} differs from copy 0 in {} sectors; using copy 0",
                differing.len()
            );
            for idx in differing {
                table.mark_dirty(idx);
            }
        }
    }

    info!(
        "volume {:?}: partition at {}, {} byte clusters, {} free of {}",
        bpb.label_text(),
        bpb.partition_start,
        bpb.cluster_size(),
        table.free_count(),
        max_cluster - 1
    );
    Ok((bpb, table))
}

/// Splits a cluster list into runs of consecutive numbers, in order.
pub(crate) fn contiguous_runs(clusters: &[u32]) -> Vec<ClusterRun> {
    let mut runs: Vec<ClusterRun> = Vec::new();
    for &cluster in clusters {
        match runs.last_mut() {
            Some(run) if run.end() == cluster => run.len += 1,
            _ => runs.push(ClusterRun {
                start: cluster,
                len: 1,
            }),
        }
    }
    runs
}
