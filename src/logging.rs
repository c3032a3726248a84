use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;

/// Library records stay quieter than the tool's own unless asked for.
const LIBRARY_TARGET: &str = "remotefat";

pub struct Logger {
    level: LevelFilter,
    json_file: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(level: LevelFilter, path: Option<PathBuf>) -> Result<Self> {
        let json_file = match path {
            Some(path) => {
                ensure_parent_dir(&path)?;
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { level, json_file })
    }

    pub fn install(self) -> Result<()> {
        let max = self.level.max(LevelFilter::Info);
        log::set_boxed_logger(Box::new(self)).map_err(|err| anyhow!("logger setup: {err}"))?;
        log::set_max_level(max);
        Ok(())
    }

    fn threshold(&self, target: &str) -> LevelFilter {
        if target.starts_with(LIBRARY_TARGET) {
            self.level
        } else {
            self.level.max(LevelFilter::Info)
        }
    }

    fn event(&self, level: Level, message: &str) {
        let Some(file) = &self.json_file else {
            return;
        };
        let Ok(mut file) = file.lock() else {
            return;
        };

        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let entry = json!({
            "ts_ms": ts_ms,
            "level": level.as_str().to_ascii_lowercase(),
            "msg": message,
        });

        let _ = writeln!(file, "{}", entry);
        let _ = file.flush();
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.threshold(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        match record.level() {
            Level::Error | Level::Warn => eprintln!("{message}"),
            _ => println!("{message}"),
        }
        self.event(record.level(), &message);
    }

    fn flush(&self) {
        if let Some(Ok(mut file)) = self.json_file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
    }
}

/// Log level from `-v` count, with `M65FTP_LOG` as the fallback.
pub fn level_from(verbose: u8, env_level: Option<&str>) -> Result<LevelFilter> {
    match verbose {
        0 => match env_level {
            Some(raw) => raw
                .parse::<LevelFilter>()
                .map_err(|_| anyhow!("M65FTP_LOG must be one of off|error|warn|info|debug|trace")),
            None => Ok(LevelFilter::Warn),
        },
        1 => Ok(LevelFilter::Info),
        2 => Ok(LevelFilter::Debug),
        _ => Ok(LevelFilter::Trace),
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
