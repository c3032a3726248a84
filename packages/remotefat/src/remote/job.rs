pub const JOB_COUNT_ADDRESS: u32 = 0xC000;
pub const JOB_REGION_ADDRESS: u32 = 0xC001;
pub const JOB_REGION_LEN: usize = 0x0FFF;
pub const SECTOR_JOB_LEN: usize = 9;

pub const OP_NOOP: u8 = 0x00;
pub const OP_READ_SECTOR: u8 = 0x01;
pub const OP_WRITE_SECTOR: u8 = 0x02;
pub const OP_SEND_MEMORY: u8 = 0x11;
pub const OP_TERMINATE: u8 = 0xFF;

/// Most jobs a single batch can carry: the count cell is one byte and the
/// region holds `JOB_REGION_LEN / 9` sector-sized jobs.
pub const MAX_BATCH_JOBS: usize = {
    let by_region = JOB_REGION_LEN / SECTOR_JOB_LEN;
    if by_region < u8::MAX as usize {
        by_region
    } else {
        u8::MAX as usize
    }
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    Noop,
    ReadSector { buffer: u32, sector: u32 },
    WriteSector { buffer: u32, sector: u32 },
    SendMemory { address: u32, len: u32 },
    Terminate,
    /// Anything else; the remote aborts the rest of the batch on it.
    Raw { opcode: u8, payload: Vec<u8> },
}

impl Job {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Noop => OP_NOOP,
            Self::ReadSector { .. } => OP_READ_SECTOR,
            Self::WriteSector { .. } => OP_WRITE_SECTOR,
            Self::SendMemory { .. } => OP_SEND_MEMORY,
            Self::Terminate => OP_TERMINATE,
            Self::Raw { opcode, .. } => *opcode,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Noop | Self::Terminate => 1,
            Self::ReadSector { .. } | Self::WriteSector { .. } | Self::SendMemory { .. } => {
                SECTOR_JOB_LEN
            }
            Self::Raw { payload, .. } => 1 + payload.len(),
        }
    }

    /// Jobs the remote acknowledges with `ftjobdone`.
    pub fn emits_notice(&self) -> bool {
        matches!(self, Self::ReadSector { .. } | Self::SendMemory { .. })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode());
        match self {
            Self::ReadSector { buffer, sector } | Self::WriteSector { buffer, sector } => {
                out.extend_from_slice(&buffer.to_le_bytes());
                out.extend_from_slice(&sector.to_le_bytes());
            }
            Self::SendMemory { address, len } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            Self::Raw { payload, .. } => out.extend_from_slice(payload),
            Self::Noop | Self::Terminate => {}
        }
    }
}

/// Ordered jobs laid out for the control region. `finish` appends the
/// zero-length send-mem sentinel whose notice proves the remote reached the
/// end of the batch.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    jobs: Vec<Job>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn finish(mut self) -> Self {
        self.jobs.push(Self::sentinel());
        self
    }

    pub fn sentinel() -> Job {
        Job::SendMemory {
            address: JOB_REGION_ADDRESS,
            len: 0,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Control-region address of each job, the key used by notices.
    pub fn job_addresses(&self) -> Vec<u16> {
        let mut addr = JOB_REGION_ADDRESS;
        self.jobs
            .iter()
            .map(|job| {
                let this = addr as u16;
                addr += job.encoded_len() as u32;
                this
            })
            .collect()
    }

    /// Longest `ftjobdata` payload any job of this batch may produce.
    pub fn largest_payload(&self) -> usize {
        self.jobs
            .iter()
            .map(|job| match job {
                Job::SendMemory { len, .. } => *len as usize,
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.jobs.len() * SECTOR_JOB_LEN);
        for job in &self.jobs {
            job.encode_into(&mut out);
        }
        out
    }

    pub fn check_limits(&self) -> Result<(), crate::TransportError> {
        let bytes: usize = self.jobs.iter().map(Job::encoded_len).sum();
        if self.jobs.len() > MAX_BATCH_JOBS || bytes > JOB_REGION_LEN {
            return Err(crate::TransportError::BatchTooLarge {
                jobs: self.jobs.len(),
                limit: MAX_BATCH_JOBS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_batch_is_bounded_by_count_byte() {
        assert_eq!(JOB_REGION_LEN / SECTOR_JOB_LEN, 455);
        assert_eq!(MAX_BATCH_JOBS, 255);
    }

    #[test]
    fn read_job_layout_is_opcode_then_le_address_then_le_sector() {
        let mut batch = Batch::new();
        batch.push(Job::ReadSector {
            buffer: 0x0004_0200,
            sector: 0x1234_5678,
        });
        assert_eq!(
            batch.encode(),
            vec![0x01, 0x00, 0x02, 0x04, 0x00, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn job_addresses_follow_encoded_lengths() {
        let mut batch = Batch::new();
        batch.push(Job::Noop);
        batch.push(Job::ReadSector {
            buffer: 0,
            sector: 0,
        });
        let batch = batch.finish();
        assert_eq!(batch.job_addresses(), vec![0xC001, 0xC002, 0xC00B]);
        assert_eq!(batch.jobs().last(), Some(&Batch::sentinel()));
        assert_eq!(batch.largest_payload(), 0);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut batch = Batch::new();
        for sector in 0..=MAX_BATCH_JOBS as u32 {
            batch.push(Job::WriteSector { buffer: 0, sector });
        }
        assert!(matches!(
            batch.check_limits(),
            Err(crate::TransportError::BatchTooLarge { .. })
        ));
    }
}
