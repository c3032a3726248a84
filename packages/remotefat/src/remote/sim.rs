use std::{collections::VecDeque, time::Duration};

use super::{
    job::{JOB_COUNT_ADDRESS, JOB_REGION_ADDRESS, JOB_REGION_LEN},
    notice::{Notice, NoticeDecoder},
    Transport,
};
use crate::{error::TransportError, SECTOR_SIZE};

const MEMORY_LEN: usize = 0x0010_0000;
const BEACON: &[u8] = b"\nmega65ft1.0\n\r";

/// In-process stand-in for the remote helper: executes job bytes against an
/// SD image and a flat memory map, and replays its serial output through a
/// real decoder in small chunks.
pub(crate) struct SimulatedRemote {
    pub image: Vec<u8>,
    memory: Vec<u8>,
    decoder: NoticeDecoder,
    output: VecDeque<u8>,
    pub chunk: usize,
    /// Emit a beacon after every N executed jobs (0 = never).
    pub beacon_every: usize,
    /// Swallow the whole response of the next N batches.
    pub drop_responses: u32,
    /// Treat job `k` of the next batch as an unknown opcode.
    pub abort_next_at: Option<usize>,
    pub silent: bool,
    pub batches_run: usize,
    pub sectors_read: Vec<u32>,
    pub sectors_written: Vec<u32>,
    pub terminated: bool,
    pub resyncs: usize,
}

impl SimulatedRemote {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            memory: vec![0u8; MEMORY_LEN],
            decoder: NoticeDecoder::new(),
            output: VecDeque::new(),
            chunk: 7,
            beacon_every: 3,
            drop_responses: 0,
            abort_next_at: None,
            silent: false,
            batches_run: 0,
            sectors_read: Vec::new(),
            sectors_written: Vec::new(),
            terminated: false,
            resyncs: 0,
        }
    }

    pub fn emit_beacon(&mut self) {
        self.output.extend(BEACON);
    }

    /// Queues raw bytes ahead of whatever the next batch produces.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.output.extend(bytes);
    }

    fn run_batch(&mut self, count: usize) {
        self.batches_run += 1;
        let abort_at = self.abort_next_at.take();
        let mut out = Vec::new();
        let mut addr = JOB_REGION_ADDRESS as usize;
        let end = JOB_REGION_ADDRESS as usize + JOB_REGION_LEN;

        for idx in 0..count {
            if addr >= end {
                break;
            }
            let opcode = if abort_at == Some(idx) {
                0x42
            } else {
                self.memory[addr]
            };
            let job_addr = addr as u16;
            match opcode {
                0x00 => addr += 1,
                0xFF => {
                    self.terminated = true;
                    return;
                }
                0x01 | 0x02 | 0x11 => {
                    let a = self.le32(addr + 1) as usize;
                    let b = self.le32(addr + 5);
                    addr += 9;
                    match opcode {
                        0x01 => {
                            let from = b as usize * SECTOR_SIZE;
                            let sector = self.image[from..from + SECTOR_SIZE].to_vec();
                            self.memory[a..a + SECTOR_SIZE].copy_from_slice(&sector);
                            self.sectors_read.push(b);
                            out.extend_from_slice(format!("ftjobdone:{job_addr:04x}:\n\r").as_bytes());
                        }
                        0x02 => {
                            let to = b as usize * SECTOR_SIZE;
                            let sector = self.memory[a..a + SECTOR_SIZE].to_vec();
                            self.image[to..to + SECTOR_SIZE].copy_from_slice(&sector);
                            self.sectors_written.push(b);
                        }
                        _ => {
                            let len = b as usize;
                            let header = format!("ftjobdata:{job_addr:04x}:{len:08x}:");
                            out.extend_from_slice(header.as_bytes());
                            let payload = self.memory[a..a + len].to_vec();
                            out.extend_from_slice(&payload);
                            out.extend_from_slice(format!("ftjobdone:{job_addr:04x}:\n\r").as_bytes());
                        }
                    }
                }
                _ => addr = end,
            }
            if self.beacon_every > 0 && (idx + 1) % self.beacon_every == 0 {
                out.extend_from_slice(BEACON);
            }
        }
        self.memory[JOB_COUNT_ADDRESS as usize] = 0;
        out.extend_from_slice(b"ftbatchdone\n");

        if self.drop_responses > 0 {
            self.drop_responses -= 1;
            return;
        }
        if !self.silent {
            self.output.extend(out);
        }
    }

    fn le32(&self, at: usize) -> u32 {
        u32::from_le_bytes([
            self.memory[at],
            self.memory[at + 1],
            self.memory[at + 2],
            self.memory[at + 3],
        ])
    }
}

impl Transport for SimulatedRemote {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
        let start = address as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
        // Monitor echo, which the decoder must skip.
        if !self.silent {
            self.output
                .extend(format!("s{address:x} {}\r\n", data.len()).as_bytes());
        }
        if address == JOB_COUNT_ADDRESS && data.first().copied().unwrap_or(0) != 0 {
            self.run_batch(data[0] as usize);
        }
        Ok(())
    }

    fn limit_payload(&mut self, limit: usize) {
        self.decoder.set_payload_limit(limit);
    }

    fn resync(&mut self) {
        self.resyncs += 1;
        self.decoder.reset();
    }

    // Never sleeps: an exhausted stream stands for an expired timeout.
    fn read_notice(&mut self, _timeout: Duration) -> Result<Option<Notice>, TransportError> {
        loop {
            if let Some(notice) = self.decoder.next_notice()? {
                return Ok(Some(notice));
            }
            if self.output.is_empty() {
                return Ok(None);
            }
            let take = self.chunk.max(1).min(self.output.len());
            let bytes: Vec<u8> = self.output.drain(..take).collect();
            self.decoder.push(&bytes);
        }
    }
}
