use std::time::Duration;

use super::{
    job::{Batch, JOB_COUNT_ADDRESS, JOB_REGION_ADDRESS},
    notice::Notice,
};
use crate::error::TransportError;

/// Byte pipe to the remote helper. Implementations own the notice decoder so
/// beacons and monitor chatter are filtered no matter who is reading.
pub trait Transport {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Next decoded notice, or `None` once `timeout` passes without one.
    fn read_notice(&mut self, timeout: Duration) -> Result<Option<Notice>, TransportError>;

    /// Bounds the `ftjobdata` size the decoder accepts for the next batch.
    fn limit_payload(&mut self, _limit: usize) {}

    /// Drops decoder state after a failed batch so a half-read payload
    /// cannot swallow the replay's notices.
    fn resync(&mut self) {}

    /// Job array first, then the count cell that starts the remote on it.
    fn send_batch(&mut self, batch: &Batch) -> Result<(), TransportError> {
        self.write_memory(JOB_REGION_ADDRESS, &batch.encode())?;
        self.write_memory(JOB_COUNT_ADDRESS, &[batch.len() as u8])
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_memory(address, data)
    }

    fn read_notice(&mut self, timeout: Duration) -> Result<Option<Notice>, TransportError> {
        (**self).read_notice(timeout)
    }

    fn limit_payload(&mut self, limit: usize) {
        (**self).limit_payload(limit)
    }

    fn resync(&mut self) {
        (**self).resync()
    }

    fn send_batch(&mut self, batch: &Batch) -> Result<(), TransportError> {
        (**self).send_batch(batch)
    }
}
