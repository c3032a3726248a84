pub mod job;
pub mod notice;
pub mod transport;

#[cfg(test)]
pub(crate) mod sim;
#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{
    block::{BlockDevice, Sector},
    error::{Error, TransportError},
    SECTOR_SIZE,
};
use job::{Batch, Job, MAX_BATCH_JOBS};
use notice::Notice;
pub use transport::Transport;

const STALE_DRAIN: Duration = Duration::from_millis(50);
// Covers every notice one full batch can produce, plus beacons.
const STALE_NOTICE_LIMIT: usize = 4 * MAX_BATCH_JOBS;

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub batch_timeout: Duration,
    /// Extra attempts after the first; whole batches are replayed.
    pub batch_retries: u32,
    pub handshake_timeout: Duration,
    pub read_buffer_address: u32,
    pub write_buffer_address: u32,
    pub staging_sectors: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(5000),
            batch_retries: 2,
            handshake_timeout: Duration::from_millis(3000),
            read_buffer_address: 0x0004_0000,
            write_buffer_address: 0x0005_0000,
            staging_sectors: 64,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandshakeState {
    pub version: Option<String>,
    pub beacons_seen: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinkStats {
    pub batches: u64,
    pub retries: u64,
}

/// Per-job payloads returned by `ftjobdata`, indexed like the batch.
#[derive(Debug)]
pub struct BatchOutput {
    pub data: Vec<Option<Vec<u8>>>,
}

pub struct RemoteBlockDevice<T> {
    transport: T,
    config: RemoteConfig,
    handshake: HandshakeState,
    stats: LinkStats,
}

impl<T: Transport> RemoteBlockDevice<T> {
    pub fn new(transport: T, config: RemoteConfig) -> Self {
        Self {
            transport,
            config,
            handshake: HandshakeState::default(),
            stats: LinkStats::default(),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn handshake_state(&self) -> &HandshakeState {
        &self.handshake
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Waits for the helper's version beacon.
    pub fn handshake(&mut self) -> Result<String, TransportError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::NoBeacon);
            }
            match self.transport.read_notice(deadline - now)? {
                Some(Notice::Beacon { version }) => {
                    self.note_beacon(&version);
                    info!("remote helper answered: protocol 1.{version}");
                    return Ok(version);
                }
                Some(other) => debug!("ignoring stale notice before handshake: {other:?}"),
                None => return Err(TransportError::NoBeacon),
            }
        }
    }

    /// Asks the helper to quit; it resets without acknowledging.
    pub fn terminate(&mut self) -> Result<(), TransportError> {
        let mut batch = Batch::new();
        batch.push(Job::Terminate);
        self.transport.send_batch(&batch)
    }

    /// Runs one batch, once, and checks that every job reported back.
    ///
    /// Jobs without a notice of their own are only confirmed by a later
    /// notice, so `JobsNotExecuted::first_unexecuted` may name a job that
    /// did run.
    pub fn execute(&mut self, batch: &Batch) -> Result<BatchOutput, TransportError> {
        batch.check_limits()?;
        let addresses = batch.job_addresses();
        let jobs = batch.jobs();
        let mut done = vec![false; jobs.len()];
        let mut data: Vec<Option<Vec<u8>>> = vec![None; jobs.len()];

        self.transport.limit_payload(batch.largest_payload());
        self.transport.send_batch(batch)?;
        self.stats.batches += 1;
        let started = Instant::now();
        let deadline = started + self.config.batch_timeout;

        loop {
            let now = Instant::now();
            let notice = if now < deadline {
                self.transport.read_notice(deadline - now)?
            } else {
                None
            };
            let Some(notice) = notice else {
                return Err(TransportError::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            };
            match notice {
                Notice::Beacon { version } => self.note_beacon(&version),
                Notice::JobDone { job } => {
                    let idx = job_index(&addresses, job)?;
                    done[idx] = true;
                }
                Notice::JobData { job, data: bytes } => {
                    let idx = job_index(&addresses, job)?;
                    if let Job::SendMemory { len, .. } = jobs[idx] {
                        if bytes.len() != len as usize {
                            return Err(TransportError::MalformedNotice(format!(
                                "ftjobdata:{job:04x}: carried {} bytes, expected {len}",
                                bytes.len()
                            )));
                        }
                    }
                    data[idx] = Some(bytes);
                }
                Notice::BatchDone => break,
            }
        }

        let mut last_confirmed = None;
        for (idx, job) in jobs.iter().enumerate() {
            if !job.emits_notice() {
                continue;
            }
            if done[idx] {
                last_confirmed = Some(idx);
            } else {
                let first_unexecuted = last_confirmed.map_or(0, |i| i + 1);
                return Err(TransportError::JobsNotExecuted {
                    first_unexecuted,
                    job_count: jobs.len(),
                });
            }
        }

        debug!(
            "batch of {} jobs done in {} ms",
            jobs.len(),
            started.elapsed().as_millis()
        );
        Ok(BatchOutput { data })
    }

    fn run_batch(
        &mut self,
        batch: &Batch,
        staged: Option<&[u8]>,
    ) -> Result<BatchOutput, TransportError> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                self.drain_stale()?;
            }
            match self.attempt_batch(batch, staged) {
                Ok(output) => return Ok(output),
                Err(err) if attempt < self.config.batch_retries && is_retryable(&err) => {
                    attempt += 1;
                    self.stats.retries += 1;
                    warn!(
                        "batch failed ({err}); replaying, attempt {}/{}",
                        attempt + 1,
                        self.config.batch_retries + 1
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt_batch(
        &mut self,
        batch: &Batch,
        staged: Option<&[u8]>,
    ) -> Result<BatchOutput, TransportError> {
        if let Some(bytes) = staged {
            self.transport
                .write_memory(self.config.write_buffer_address, bytes)?;
        }
        self.execute(batch)
    }

    // Late notices from a failed attempt must not be credited to the replay.
    fn drain_stale(&mut self) -> Result<(), TransportError> {
        for _ in 0..STALE_NOTICE_LIMIT {
            match self.transport.read_notice(STALE_DRAIN) {
                Ok(Some(Notice::Beacon { version })) => self.note_beacon(&version),
                Ok(Some(other)) => debug!("discarding stale notice {other:?}"),
                Ok(None) => break,
                Err(TransportError::MalformedNotice(raw)) => {
                    debug!("discarding stale malformed notice `{raw}`")
                }
                Err(err) => return Err(err),
            }
        }
        self.transport.resync();
        Ok(())
    }

    fn note_beacon(&mut self, version: &str) {
        self.handshake.beacons_seen += 1;
        if self.handshake.version.as_deref() != Some(version) {
            self.handshake.version = Some(version.to_string());
        }
    }

    fn read_chunk(&mut self, start: u32, count: u32) -> Result<Vec<Sector>, TransportError> {
        let base = self.config.read_buffer_address;
        let mut batch = Batch::new();
        for offset in 0..count {
            batch.push(Job::ReadSector {
                buffer: base + offset * SECTOR_SIZE as u32,
                sector: start + offset,
            });
        }
        batch.push(Job::SendMemory {
            address: base,
            len: count * SECTOR_SIZE as u32,
        });
        let send_idx = count as usize;
        let batch = batch.finish();

        let mut output = self.run_batch(&batch, None)?;
        let bytes = output.data[send_idx].take().ok_or_else(|| {
            TransportError::MalformedNotice("send-mem job returned no data".to_string())
        })?;
        Ok(bytes
            .chunks_exact(SECTOR_SIZE)
            .map(|chunk| {
                let mut sector = [0u8; SECTOR_SIZE];
                sector.copy_from_slice(chunk);
                sector
            })
            .collect())
    }

    fn write_chunk(&mut self, writes: &[(u32, Sector)]) -> Result<(), TransportError> {
        let base = self.config.write_buffer_address;
        let mut staged = Vec::with_capacity(writes.len() * SECTOR_SIZE);
        let mut batch = Batch::new();
        for (idx, (sector, data)) in writes.iter().enumerate() {
            staged.extend_from_slice(data);
            batch.push(Job::WriteSector {
                buffer: base + (idx * SECTOR_SIZE) as u32,
                sector: *sector,
            });
        }
        let batch = batch.finish();
        self.run_batch(&batch, Some(&staged)).map(|_| ())
    }

    fn sectors_per_batch(&self, reserved_jobs: usize) -> u32 {
        let by_jobs = (MAX_BATCH_JOBS - reserved_jobs) as u32;
        self.config.staging_sectors.clamp(1, by_jobs)
    }
}

fn job_index(addresses: &[u16], job: u16) -> Result<usize, TransportError> {
    addresses
        .iter()
        .position(|addr| *addr == job)
        .ok_or_else(|| TransportError::UnexpectedNotice(format!("{job:04x}")))
}

fn is_retryable(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Timeout { .. }
            | TransportError::MalformedNotice(_)
            | TransportError::UnexpectedNotice(_)
            | TransportError::JobsNotExecuted { .. }
    )
}

/// Merges repeated writes to one sector, keeping the latest data in the
/// position of the first write.
fn coalesce_writes(writes: &[(u32, Sector)]) -> Vec<(u32, Sector)> {
    let mut out: Vec<(u32, Sector)> = Vec::with_capacity(writes.len());
    for (sector, data) in writes {
        match out.iter_mut().find(|(existing, _)| existing == sector) {
            Some(slot) => slot.1 = *data,
            None => out.push((*sector, *data)),
        }
    }
    out
}

impl<T: Transport> BlockDevice for RemoteBlockDevice<T> {
    fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        let mut sectors = self.read_sectors(sector, 1)?;
        sectors
            .pop()
            .ok_or_else(|| Error::Transport(TransportError::MalformedNotice("empty read".into())))
    }

    fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), Error> {
        self.write_sectors(&[(sector, *data)])
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> Result<Vec<Sector>, Error> {
        // read jobs + send-mem + sentinel
        let per_batch = self.sectors_per_batch(2);
        let mut out = Vec::with_capacity(count as usize);
        let mut offset = 0u32;
        while offset < count {
            let chunk = per_batch.min(count - offset);
            out.extend(self.read_chunk(start + offset, chunk)?);
            offset += chunk;
        }
        Ok(out)
    }

    fn write_sectors(&mut self, writes: &[(u32, Sector)]) -> Result<(), Error> {
        let writes = coalesce_writes(writes);
        let per_batch = self.sectors_per_batch(1) as usize;
        for chunk in writes.chunks(per_batch) {
            self.write_chunk(chunk)?;
        }
        Ok(())
    }
}
