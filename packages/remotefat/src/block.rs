use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{error::Error, SECTOR_SIZE};

pub type Sector = [u8; SECTOR_SIZE];

/// Sector-addressed storage. Multi-sector calls exist so remote devices can
/// batch; the defaults fall back to one sector at a time.
pub trait BlockDevice {
    fn read_sector(&mut self, sector: u32) -> Result<Sector, Error>;

    fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), Error>;

    fn read_sectors(&mut self, start: u32, count: u32) -> Result<Vec<Sector>, Error> {
        (0..count)
            .map(|offset| self.read_sector(start + offset))
            .collect()
    }

    fn write_sectors(&mut self, writes: &[(u32, Sector)]) -> Result<(), Error> {
        for (sector, data) in writes {
            self.write_sector(*sector, data)?;
        }
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        (**self).read_sector(sector)
    }

    fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), Error> {
        (**self).write_sector(sector, data)
    }

    fn read_sectors(&mut self, start: u32, count: u32) -> Result<Vec<Sector>, Error> {
        (**self).read_sectors(start, count)
    }

    fn write_sectors(&mut self, writes: &[(u32, Sector)]) -> Result<(), Error> {
        (**self).write_sectors(writes)
    }
}

/// Whole-card image held in memory.
#[derive(Clone, Debug)]
pub struct MemoryDisk {
    bytes: Vec<u8>,
}

impl MemoryDisk {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mut bytes = bytes;
        let rem = bytes.len() % SECTOR_SIZE;
        if rem != 0 {
            bytes.resize(bytes.len() + SECTOR_SIZE - rem, 0);
        }
        Self { bytes }
    }

    pub fn sector_count(&self) -> u32 {
        (self.bytes.len() / SECTOR_SIZE) as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn range(&self, sector: u32) -> Result<std::ops::Range<usize>, Error> {
        let start = sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.bytes.len() {
            return Err(Error::LocalIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("sector {sector} beyond end of image"),
            )));
        }
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for MemoryDisk {
    fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        let range = self.range(sector)?;
        let mut out = [0u8; SECTOR_SIZE];
        out.copy_from_slice(&self.bytes[range]);
        Ok(out)
    }

    fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), Error> {
        let range = self.range(sector)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

/// SD card image or raw card device on the local machine.
pub struct FileDisk {
    file: File,
}

impl FileDisk {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl BlockDevice for FileDisk {
    fn read_sector(&mut self, sector: u32) -> Result<Sector, Error> {
        let mut out = [0u8; SECTOR_SIZE];
        self.file
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        self.file.read_exact(&mut out)?;
        Ok(out)
    }

    fn write_sector(&mut self, sector: u32, data: &Sector) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn write_sectors(&mut self, writes: &[(u32, Sector)]) -> Result<(), Error> {
        for (sector, data) in writes {
            self.write_sector(*sector, data)?;
        }
        self.file.flush()?;
        Ok(())
    }
}
