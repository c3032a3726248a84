use super::table::{AllocationTable, ClusterRun, TableUpdate, FAT32_EOC_WRITE};
use crate::error::Error;

/// Contiguity-first allocator over a snapshot of the free runs. Clusters it
/// hands out leave the snapshot, so allocations made during one operation
/// never overlap.
#[derive(Clone, Debug)]
pub struct ClusterAllocator {
    runs: Vec<ClusterRun>,
}

impl ClusterAllocator {
    pub fn new(mut runs: Vec<ClusterRun>) -> Self {
        runs.retain(|run| run.len > 0);
        runs.sort_by_key(|run| run.start);
        Self { runs }
    }

    pub fn from_table(table: &AllocationTable) -> Self {
        Self::new(table.free_runs())
    }

    pub fn runs(&self) -> &[ClusterRun] {
        &self.runs
    }

    pub fn free_count(&self) -> u32 {
        self.runs.iter().map(|run| run.len).sum()
    }

    /// Takes `n` clusters: the lowest run that fits them whole, otherwise
    /// runs in ascending order with the last one used partially.
    pub fn allocate(&mut self, n: u32) -> Result<Vec<u32>, Error> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let available = self.free_count();
        if available < n {
            return Err(Error::InsufficientSpace {
                needed: n,
                available,
            });
        }

        if let Some(idx) = self.runs.iter().position(|run| run.len >= n) {
            let run = &mut self.runs[idx];
            let taken: Vec<u32> = (run.start..run.start + n).collect();
            run.start += n;
            run.len -= n;
            if run.len == 0 {
                self.runs.remove(idx);
            }
            return Ok(taken);
        }

        let mut taken = Vec::with_capacity(n as usize);
        while (taken.len() as u32) < n {
            let want = n - taken.len() as u32;
            let run = &mut self.runs[0];
            let take = want.min(run.len);
            taken.extend(run.start..run.start + take);
            run.start += take;
            run.len -= take;
            if run.len == 0 {
                self.runs.remove(0);
            }
        }
        Ok(taken)
    }

    /// Returns clusters to the snapshot and yields the updates freeing them.
    pub fn release(&mut self, chain: &[u32]) -> Vec<TableUpdate> {
        for &cluster in chain {
            self.insert_free(cluster);
        }
        chain
            .iter()
            .map(|&cluster| TableUpdate { cluster, value: 0 })
            .collect()
    }

    /// Updates linking `chain` in order and terminating it.
    pub fn link(chain: &[u32]) -> Vec<TableUpdate> {
        let mut updates: Vec<TableUpdate> = chain
            .windows(2)
            .map(|pair| TableUpdate {
                cluster: pair[0],
                value: pair[1],
            })
            .collect();
        if let Some(&last) = chain.last() {
            updates.push(TableUpdate {
                cluster: last,
                value: FAT32_EOC_WRITE,
            });
        }
        updates
    }

    fn insert_free(&mut self, cluster: u32) {
        let idx = self.runs.partition_point(|run| run.end() <= cluster);
        if self
            .runs
            .get(idx)
            .is_some_and(|run| run.clusters().contains(&cluster))
        {
            return;
        }
        self.runs.insert(idx, ClusterRun { start: cluster, len: 1 });
        if let Some(next) = self.runs.get(idx + 1).copied() {
            if next.start == cluster + 1 {
                self.runs[idx].len += next.len;
                self.runs.remove(idx + 1);
            }
        }
        if idx > 0 && self.runs[idx - 1].end() == cluster {
            let merged = self.runs[idx];
            self.runs[idx - 1].len += merged.len;
            self.runs.remove(idx);
        }
    }
}
