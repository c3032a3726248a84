use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use log::debug;
use remotefat::{
    remote::{
        notice::{Notice, NoticeDecoder},
        Transport,
    },
    TransportError,
};
use serialport::SerialPort;

/// Bytes per monitor `s` command.
const SET_CHUNK: usize = 16;

/// Exclusive advisory lock held for as long as a port is attached.
pub struct PortLock {
    _file: File,
    path: PathBuf,
}

impl PortLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "another m65ftp holds {}; close it before attaching",
                path.display()
            )
        })?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path_for(port: &str) -> PathBuf {
    let name: String = port
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir().join(format!("m65ftp-{name}.lock"))
}

pub struct SerialTransport<P = Box<dyn SerialPort>> {
    port: P,
    decoder: NoticeDecoder,
    _lock: Option<PortLock>,
}

impl SerialTransport {
    pub fn open(port: &str, baud: u32) -> Result<Self> {
        let lock = PortLock::acquire(&lock_path_for(port))?;
        let mut serial = serialport::new(port, baud)
            .timeout(Duration::from_millis(50))
            .open()
            .with_context(|| format!("failed to open serial port {port} @ {baud}"))?;

        // Keep lines low so attaching does not reset the board.
        let _ = serial.write_data_terminal_ready(false);
        let _ = serial.write_request_to_send(false);

        debug!("attached {port} @ {baud}, lock {}", lock.path().display());
        Ok(Self {
            port: serial,
            decoder: NoticeDecoder::new(),
            _lock: Some(lock),
        })
    }
}

impl<P: Read + Write> SerialTransport<P> {
    pub fn from_port(port: P) -> Self {
        Self {
            port,
            decoder: NoticeDecoder::new(),
            _lock: None,
        }
    }

    fn fill(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; 4096];
        match self.port.read(&mut chunk) {
            Ok(n) => {
                self.decoder.push(&chunk[..n]);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

/// Monitor command storing `bytes` at `address`.
pub fn monitor_set_command(address: u32, bytes: &[u8]) -> String {
    let mut cmd = format!("s{address:x}");
    for byte in bytes {
        cmd.push_str(&format!(" {byte:x}"));
    }
    cmd.push('\r');
    cmd
}

impl<P: Read + Write> Transport for SerialTransport<P> {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TransportError> {
        for (idx, chunk) in data.chunks(SET_CHUNK).enumerate() {
            let at = address + (idx * SET_CHUNK) as u32;
            self.port
                .write_all(monitor_set_command(at, chunk).as_bytes())?;
        }
        self.port.flush()?;
        Ok(())
    }

    fn read_notice(&mut self, timeout: Duration) -> Result<Option<Notice>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(notice) = self.decoder.next_notice()? {
                return Ok(Some(notice));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    fn limit_payload(&mut self, limit: usize) {
        self.decoder.set_payload_limit(limit);
    }

    fn resync(&mut self) {
        if self.decoder.in_data() {
            debug!("abandoning a partial ftjobdata payload");
        }
        self.decoder.reset();
    }
}
