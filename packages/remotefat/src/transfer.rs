use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{Local, NaiveDateTime};
use log::{debug, info, warn};

use crate::{
    block::{BlockDevice, Sector},
    error::{CorruptVolume, Error},
    fat::{
        clusters_for_size, encode_short_name, new_directory_sector, partition_table,
        ClusterAllocator, DirectoryEntry, DirectoryManager, FatVolume, MbrPartition, TableUpdate,
        FAT32_EOC_WRITE,
    },
    SECTOR_SIZE,
};

/// Sectors moved between interrupt checks.
const IO_CHUNK_SECTORS: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    pub label: String,
    pub partition_start: u32,
    pub fat_start: u32,
    pub sectors_per_fat: u32,
    pub fats: u8,
    pub data_start: u32,
    pub cluster_size: u32,
    pub root_cluster: u32,
    pub max_cluster: u32,
    pub free_clusters: u32,
}

/// File-level operations on the current directory of a mounted volume.
/// Sessions start in the root directory.
pub struct FileTransferEngine<D> {
    volume: FatVolume<D>,
    dir: DirectoryManager,
    path: Vec<String>,
    root_label: Option<String>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<D: BlockDevice> FileTransferEngine<D> {
    pub fn new(mut volume: FatVolume<D>) -> Result<Self, Error> {
        let dir = DirectoryManager::load(&mut volume)?;
        Ok(Self {
            volume,
            root_label: dir.label(),
            dir,
            path: Vec::new(),
            interrupt: None,
        })
    }

    /// Flag polled between sector batches; a set flag is consumed and the
    /// running operation stops with `Error::Interrupted`.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    pub fn volume(&self) -> &FatVolume<D> {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut FatVolume<D> {
        &mut self.volume
    }

    pub fn directory(&self) -> &DirectoryManager {
        &self.dir
    }

    pub fn into_volume(self) -> FatVolume<D> {
        self.volume
    }

    fn check_interrupt(&self) -> Result<(), Error> {
        match &self.interrupt {
            Some(flag) if flag.swap(false, Ordering::SeqCst) => Err(Error::Interrupted),
            _ => Ok(()),
        }
    }

    /// Files and subdirectories of the current directory.
    pub fn list(&self) -> Vec<DirectoryEntry> {
        self.dir.listing()
    }

    pub fn current_path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    pub fn find(&self, name: &str) -> Result<DirectoryEntry, Error> {
        self.dir.find(name)
    }

    pub fn upload(&mut self, data: &[u8], name: &str) -> Result<DirectoryEntry, Error> {
        self.upload_at(data, name, Local::now().naive_local())
    }

    /// Stores `data` as `name`, replacing any file of that name. The new
    /// chain is allocated contiguity-first and the directory grows by one
    /// cluster when it has no free slot. A replaced file stays intact until
    /// the single commit that swaps the chains, unless its own clusters are
    /// needed to fit the new contents.
    pub fn upload_at(
        &mut self,
        data: &[u8],
        name: &str,
        modified: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        encode_short_name(name)?;
        let cluster_size = self.volume.cluster_size();
        let needed = clusters_for_size(data.len() as u64, cluster_size);
        let size = u32::try_from(data.len()).map_err(|_| Error::InsufficientSpace {
            needed,
            available: self.volume.free_cluster_count(),
        })?;

        let existing = match self.dir.find(name) {
            Ok(entry) => Some(entry),
            Err(Error::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        if existing.is_none() && self.dir.find_dir(name).is_ok() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let old_chain = match &existing {
            Some(entry) => self.volume.chain_of(entry.first_cluster)?,
            None => Vec::new(),
        };
        let dir_growth = u32::from(existing.is_none() && self.dir.free_slot().is_none());
        let mut allocator = ClusterAllocator::from_table(self.volume.table());
        let free = allocator.free_count();
        let available = free + old_chain.len() as u32;
        if available < needed + dir_growth {
            return Err(Error::InsufficientSpace {
                needed: needed + dir_growth,
                available,
            });
        }

        let mut updates = if free < needed + dir_growth {
            warn!("{name}: reusing the clusters it replaces; a failed upload loses the old copy");
            allocator.release(&old_chain)
        } else {
            ClusterAllocator::new(Vec::new()).release(&old_chain)
        };
        let chain = allocator.allocate(needed)?;
        let dir_cluster = if dir_growth > 0 {
            Some(allocator.allocate(1)?[0])
        } else {
            None
        };

        self.write_chain(&chain, data)?;

        let snapshot = self.dir.clone();
        updates.extend(ClusterAllocator::link(&chain));
        if let Some(cluster) = dir_cluster {
            self.grow_directory(cluster, &mut updates);
        }
        let first_cluster = chain.first().copied().unwrap_or(0);
        let written = match existing {
            Some(_) => self.dir.rewrite(name, size, first_cluster, modified),
            None => self.dir.create(name, size, first_cluster, modified),
        };
        let entry = match written {
            Ok(entry) => entry,
            Err(err) => {
                self.dir = snapshot;
                return Err(err);
            }
        };
        self.commit(&updates, snapshot)?;

        if !old_chain.is_empty() {
            debug!("released {} clusters of the old {name}", old_chain.len());
        }
        info!(
            "uploaded {} ({} bytes, {} clusters from {})",
            entry.name(),
            size,
            chain.len(),
            first_cluster
        );
        Ok(entry)
    }

    fn grow_directory(&mut self, cluster: u32, updates: &mut Vec<TableUpdate>) {
        let tail = self.dir.clusters().last().copied().unwrap_or(cluster);
        updates.push(TableUpdate {
            cluster: tail,
            value: cluster,
        });
        updates.push(TableUpdate {
            cluster,
            value: FAT32_EOC_WRITE,
        });
        let first = self.volume.cluster_to_sector(cluster);
        self.dir
            .extend(cluster, first, self.volume.sectors_per_cluster());
        debug!("directory {} grows into cluster {cluster}", self.current_path());
    }

    /// Writes only the sectors that hold data; the last one is zero-padded.
    fn write_chain(&mut self, chain: &[u32], data: &[u8]) -> Result<(), Error> {
        let cluster_size = self.volume.cluster_size() as usize;
        let mut pending: Vec<(u32, Sector)> = Vec::with_capacity(IO_CHUNK_SECTORS);
        for (idx, &cluster) in chain.iter().enumerate() {
            let start = idx * cluster_size;
            let end = (start + cluster_size).min(data.len());
            let first_sector = self.volume.cluster_to_sector(cluster);
            for (i, piece) in data[start..end].chunks(SECTOR_SIZE).enumerate() {
                let mut sector = [0u8; SECTOR_SIZE];
                sector[..piece.len()].copy_from_slice(piece);
                pending.push((first_sector + i as u32, sector));
            }
            if pending.len() >= IO_CHUNK_SECTORS {
                self.check_interrupt()?;
                self.volume.write_sectors(&pending)?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.check_interrupt()?;
            self.volume.write_sectors(&pending)?;
        }
        Ok(())
    }

    fn commit(&mut self, updates: &[TableUpdate], snapshot: DirectoryManager) -> Result<(), Error> {
        let writes = self.dir.dirty_sectors();
        match self.volume.commit(updates, &writes) {
            Ok(()) => {
                self.dir.clear_dirty();
                Ok(())
            }
            Err(err) => {
                self.dir = snapshot;
                Err(err)
            }
        }
    }

    pub fn upload_file(&mut self, path: &Path, name: Option<&str>) -> Result<DirectoryEntry, Error> {
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::InvalidName(path.display().to_string()))?,
        };
        let data = fs::read(path)?;
        self.upload(&data, &name)
    }

    pub fn download(&mut self, name: &str) -> Result<Vec<u8>, Error> {
        let entry = self.dir.find(name)?;
        let chain = self.volume.chain_of(entry.first_cluster)?;
        let cluster_size = self.volume.cluster_size();
        let needed = clusters_for_size(entry.size as u64, cluster_size) as usize;
        if chain.len() < needed {
            return Err(CorruptVolume::ChainTooShort {
                start: entry.first_cluster,
                clusters: chain.len(),
                size: entry.size,
            }
            .into());
        }

        let per_chunk = (IO_CHUNK_SECTORS / self.volume.sectors_per_cluster() as usize).max(1);
        let mut data = Vec::with_capacity(needed * cluster_size as usize);
        for piece in chain[..needed].chunks(per_chunk) {
            self.check_interrupt()?;
            for sector in self.volume.read_clusters(piece)? {
                data.extend_from_slice(&sector);
            }
        }
        data.truncate(entry.size as usize);
        info!("downloaded {} ({} bytes)", entry.name(), data.len());
        Ok(data)
    }

    pub fn download_to(&mut self, name: &str, path: &Path) -> Result<usize, Error> {
        let data = self.download(name)?;
        fs::write(path, &data)?;
        Ok(data.len())
    }

    /// Removes a file and frees its chain. A missing name changes nothing.
    pub fn delete(&mut self, name: &str) -> Result<DirectoryEntry, Error> {
        let entry = self.dir.find(name)?;
        let chain = self.volume.chain_of(entry.first_cluster)?;
        let snapshot = self.dir.clone();
        self.dir.delete(name)?;
        let updates = ClusterAllocator::new(Vec::new()).release(&chain);
        self.commit(&updates, snapshot)?;
        info!("deleted {} ({} clusters freed)", entry.name(), chain.len());
        Ok(entry)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<DirectoryEntry, Error> {
        let snapshot = self.dir.clone();
        let entry = self.dir.rename(old, new)?;
        self.commit(&[], snapshot)?;
        info!("renamed {old} to {}", entry.name());
        Ok(entry)
    }

    pub fn chain(&self, name: &str) -> Result<Vec<u32>, Error> {
        let entry = self.dir.find(name)?;
        Ok(self.volume.chain_of(entry.first_cluster)?)
    }

    pub fn is_fragmented(&self, name: &str) -> Result<bool, Error> {
        let chain = self.chain(name)?;
        Ok(chain.windows(2).any(|pair| pair[1] != pair[0] + 1))
    }

    pub fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        self.volume.read_sector(sector)
    }

    pub fn make_dir(&mut self, name: &str) -> Result<DirectoryEntry, Error> {
        self.make_dir_at(name, Local::now().naive_local())
    }

    /// Creates an empty subdirectory of the current directory: one zeroed
    /// cluster holding `.` and `..`, linked and entered in a single commit.
    pub fn make_dir_at(
        &mut self,
        name: &str,
        created: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        encode_short_name(name)?;
        if self.dir.find(name).is_ok() || self.dir.find_dir(name).is_ok() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let dir_growth = u32::from(self.dir.free_slot().is_none());
        let mut allocator = ClusterAllocator::from_table(self.volume.table());
        let available = allocator.free_count();
        if available < 1 + dir_growth {
            return Err(Error::InsufficientSpace {
                needed: 1 + dir_growth,
                available,
            });
        }
        let cluster = allocator.allocate(1)?[0];
        let dir_cluster = if dir_growth > 0 {
            Some(allocator.allocate(1)?[0])
        } else {
            None
        };

        let parent = if self.path.is_empty() {
            0
        } else {
            self.dir.first_cluster()
        };
        let first_sector = self.volume.cluster_to_sector(cluster);
        let mut writes = vec![(first_sector, new_directory_sector(cluster, parent, created))];
        for i in 1..self.volume.sectors_per_cluster() {
            writes.push((first_sector + i, [0u8; SECTOR_SIZE]));
        }
        self.check_interrupt()?;
        self.volume.write_sectors(&writes)?;

        let snapshot = self.dir.clone();
        let mut updates = ClusterAllocator::link(&[cluster]);
        if let Some(extra) = dir_cluster {
            self.grow_directory(extra, &mut updates);
        }
        let entry = match self.dir.create_dir(name, cluster, created) {
            Ok(entry) => entry,
            Err(err) => {
                self.dir = snapshot;
                return Err(err);
            }
        };
        self.commit(&updates, snapshot)?;
        info!("created directory {} at cluster {cluster}", entry.name());
        Ok(entry)
    }

    /// Moves to `path`. A leading `/` starts from the root, `..` goes up
    /// (staying put at the root) and `/`-separated parts apply in turn.
    /// Nothing changes if any part is missing.
    pub fn change_dir(&mut self, path: &str) -> Result<String, Error> {
        let mut names = self.path.clone();
        let mut dir = if path.starts_with('/') {
            names.clear();
            DirectoryManager::load(&mut self.volume)?
        } else {
            self.dir.clone()
        };
        for part in path.split('/').filter(|part| !part.is_empty()) {
            match part {
                "." => {}
                ".." => {
                    if names.pop().is_none() {
                        continue;
                    }
                    let parent = dir.parent_cluster().unwrap_or(0);
                    dir = self.load_dir(parent)?;
                }
                name => {
                    let entry = dir.find_dir(name)?;
                    dir = self.load_dir(entry.first_cluster)?;
                    names.push(entry.name());
                }
            }
        }
        self.dir = dir;
        self.path = names;
        let now = self.current_path();
        debug!("current directory is {now}");
        Ok(now)
    }

    fn load_dir(&mut self, first_cluster: u32) -> Result<DirectoryManager, Error> {
        if first_cluster == 0 {
            DirectoryManager::load(&mut self.volume)
        } else {
            DirectoryManager::load_at(&mut self.volume, first_cluster)
        }
    }

    /// Sectors of one cluster, for inspection.
    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<Sector>, Error> {
        let max = self.volume.max_cluster();
        if !(2..=max).contains(&cluster) {
            return Err(Error::ClusterOutOfRange { cluster, max });
        }
        self.volume.read_clusters(&[cluster])
    }

    /// Raw bytes of `count` sectors from `start`, ignoring the file system.
    pub fn dump_sectors(&mut self, start: u32, count: u32) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(count as usize * SECTOR_SIZE);
        let mut offset = 0u32;
        while offset < count {
            self.check_interrupt()?;
            let chunk = (count - offset).min(IO_CHUNK_SECTORS as u32);
            for sector in self.volume.device_mut().read_sectors(start + offset, chunk)? {
                out.extend_from_slice(&sector);
            }
            offset += chunk;
        }
        info!("dumped {count} sectors from {start}");
        Ok(out)
    }

    pub fn dump_sectors_to(&mut self, start: u32, count: u32, path: &Path) -> Result<usize, Error> {
        let data = self.dump_sectors(start, count)?;
        fs::write(path, &data)?;
        Ok(data.len())
    }

    /// Writes `data` to consecutive sectors from `start`, zero-padding the
    /// last one, then remounts the volume and returns to the root directory.
    pub fn restore_sectors(&mut self, start: u32, data: &[u8]) -> Result<u32, Error> {
        let writes: Vec<(u32, Sector)> = data
            .chunks(SECTOR_SIZE)
            .enumerate()
            .map(|(idx, piece)| {
                let mut sector = [0u8; SECTOR_SIZE];
                sector[..piece.len()].copy_from_slice(piece);
                (start + idx as u32, sector)
            })
            .collect();
        for chunk in writes.chunks(IO_CHUNK_SECTORS) {
            self.check_interrupt()?;
            self.volume.write_sectors(chunk)?;
        }
        warn!("restored {} sectors from {start}; remounting", writes.len());
        self.volume.remount()?;
        self.dir = DirectoryManager::load(&mut self.volume)?;
        self.root_label = self.dir.label();
        self.path.clear();
        Ok(writes.len() as u32)
    }

    pub fn restore_sectors_from(&mut self, path: &Path, start: u32) -> Result<u32, Error> {
        let data = fs::read(path)?;
        self.restore_sectors(start, &data)
    }

    /// Primary partitions listed in sector 0; empty when the card has no MBR.
    pub fn partitions(&mut self) -> Result<Vec<MbrPartition>, Error> {
        let sector0 = self.volume.read_sector(0)?;
        Ok(partition_table(&sector0).unwrap_or_default())
    }

    /// Raw table entries for `count` clusters from `start`, clamped to the
    /// volume.
    pub fn cluster_map(&self, start: u32, count: u32) -> Vec<(u32, u32)> {
        let end = start
            .saturating_add(count)
            .min(self.volume.max_cluster().saturating_add(1));
        (start..end)
            .map(|cluster| (cluster, self.volume.table().entry(cluster)))
            .collect()
    }

    pub fn volume_info(&self) -> VolumeInfo {
        let bpb = self.volume.bpb();
        VolumeInfo {
            label: self.root_label.clone().unwrap_or_else(|| bpb.label_text()),
            partition_start: bpb.partition_start,
            fat_start: bpb.fat_start(),
            sectors_per_fat: bpb.sectors_per_fat,
            fats: bpb.fats,
            data_start: bpb.data_start(),
            cluster_size: bpb.cluster_size(),
            root_cluster: bpb.root_cluster,
            max_cluster: bpb.max_cluster(),
            free_clusters: self.volume.free_cluster_count(),
        }
    }
}
