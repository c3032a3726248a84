use std::{
    fs,
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use glob::{MatchOptions, Pattern};
use log::{error, info, warn};
use remotefat::{
    command::{parse_command, tokenize},
    fat::{FAT32_BAD, FAT32_EOC},
    BlockDevice, Error, FileTransferEngine,
};

const PROMPT: &str = "m65ftp> ";
const DEFAULT_MAP_COUNT: i64 = 16;

const HELP: &[(&str, &str)] = &[
    ("put <local> [remote]", "upload a file, replacing one of the same name"),
    ("get <remote> [local]", "download a file"),
    ("del|delete <remote>", "delete a file"),
    ("rename <old> <new>", "rename a file"),
    ("dir [pattern]", "list the current directory, optionally filtered"),
    ("mkdir <name>", "create a subdirectory"),
    ("cd|chdir <path>", "change directory; / is the root, .. the parent"),
    ("clusters <remote>", "show a file's cluster chain"),
    ("frag <remote>", "report whether a file is fragmented"),
    ("sector <n>|$<hex>", "dump a raw sector"),
    ("cluster <n>|$<hex>", "dump the sectors of one cluster"),
    ("clustermap <start> [count]", "show allocation table entries"),
    ("secdump <local> <start> [count]", "save raw sectors to a local file"),
    ("secrestore <local> <start>", "write a local file over raw sectors"),
    ("free", "show free space"),
    ("vbrinfo", "show volume geometry"),
    ("mbrinfo", "show the partition table"),
    ("ldir [path]", "list a local directory"),
    ("lcd <path>", "change the local directory"),
    ("lpwd", "show the local directory"),
    ("help", "this list"),
    ("exit|quit", "leave"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell<'a, D, W> {
    engine: &'a mut FileTransferEngine<D>,
    out: W,
}

impl<'a, D: BlockDevice, W: Write> Shell<'a, D, W> {
    pub fn new(engine: &'a mut FileTransferEngine<D>, out: W) -> Self {
        Self { engine, out }
    }

    pub fn run_commands(&mut self, commands: &[String]) -> Result<()> {
        for line in commands {
            if self.step(line)? == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    pub fn run_interactive<R: BufRead>(&mut self, input: R) -> Result<()> {
        let mut lines = input.lines();
        loop {
            write!(self.out, "{PROMPT}")?;
            self.out.flush()?;
            let Some(line) = lines.next() else {
                writeln!(self.out)?;
                return Ok(());
            };
            if self.step(&line?)? == Flow::Exit {
                return Ok(());
            }
        }
    }

    /// Runs one line. Recoverable failures are reported here; a corrupt
    /// volume ends the session.
    pub fn step(&mut self, line: &str) -> Result<Flow> {
        match self.execute(line) {
            Ok(flow) => Ok(flow),
            Err(err) if err.is_fatal() => Err(anyhow!(err).context("session aborted")),
            Err(err) => {
                error!("{err}");
                Ok(Flow::Continue)
            }
        }
    }

    pub fn execute(&mut self, line: &str) -> Result<Flow, Error> {
        let tokens = tokenize(line);
        let Some(verb) = tokens.first().map(String::as_str) else {
            return Ok(Flow::Continue);
        };

        match verb {
            "put" => self.put(line)?,
            "get" => self.get(line)?,
            "del" | "delete" => {
                let parsed = parse_command(line, &format!("{verb} %s"));
                match parsed.text(0) {
                    Some(name) => {
                        let entry = self.engine.delete(name)?;
                        info!("deleted {}", entry.name());
                    }
                    None => self.usage("del|delete")?,
                }
            }
            "rename" => {
                let parsed = parse_command(line, "rename %s %s");
                match (parsed.text(0), parsed.text(1)) {
                    (Some(old), Some(new)) => {
                        let entry = self.engine.rename(old, new)?;
                        info!("renamed {old} to {}", entry.name());
                    }
                    _ => self.usage("rename")?,
                }
            }
            "dir" => {
                let pattern = parse_command(line, "dir %s");
                self.dir(pattern.text(0))?
            }
            "mkdir" => match parse_command(line, "mkdir %s").text(0) {
                Some(name) => {
                    let entry = self.engine.make_dir(name)?;
                    info!("created directory {}", entry.name());
                }
                None => self.usage("mkdir")?,
            },
            "cd" | "chdir" => match parse_command(line, &format!("{verb} %s")).text(0) {
                Some(path) => {
                    let now = self.engine.change_dir(path)?;
                    writeln!(self.out, "{now}")?;
                }
                None => self.usage("cd|chdir")?,
            },
            "clusters" => match parse_command(line, "clusters %s").text(0) {
                Some(name) => {
                    let chain = self.engine.chain(name)?;
                    let text: Vec<String> = chain.iter().map(u32::to_string).collect();
                    writeln!(self.out, "{name}: {} clusters: {}", chain.len(), text.join(" "))?;
                }
                None => self.usage("clusters")?,
            },
            "frag" => match parse_command(line, "frag %s").text(0) {
                Some(name) => {
                    let state = if self.engine.is_fragmented(name)? {
                        "fragmented"
                    } else {
                        "contiguous"
                    };
                    writeln!(self.out, "{name}: {state}")?;
                }
                None => self.usage("frag")?,
            },
            "sector" => match number_arg(line, "sector") {
                Some(sector) => {
                    let data = self.engine.read_sector(sector)?;
                    writeln!(self.out, "sector {sector} (${sector:x}):")?;
                    write_hex_dump(&mut self.out, &data)?;
                }
                None => self.usage("sector")?,
            },
            "cluster" => match number_arg(line, "cluster") {
                Some(cluster) => {
                    let sectors = self.engine.read_cluster(cluster)?;
                    for (idx, data) in sectors.iter().enumerate() {
                        writeln!(self.out, "cluster {cluster} sector {idx}:")?;
                        write_hex_dump(&mut self.out, data)?;
                    }
                }
                None => self.usage("cluster")?,
            },
            "secdump" => self.sector_dump(line)?,
            "secrestore" => self.sector_restore(line)?,
            "clustermap" => {
                let parsed = parse_command(line, "clustermap %d %d");
                let start = parsed.int(0).and_then(|n| u32::try_from(n).ok());
                let count = u32::try_from(parsed.int(1).unwrap_or(DEFAULT_MAP_COUNT)).ok();
                match (start, count) {
                    (Some(start), Some(count)) => self.cluster_map(start, count)?,
                    _ => self.usage("clustermap")?,
                }
            }
            "free" => {
                let info = self.engine.volume_info();
                writeln!(
                    self.out,
                    "{} clusters free ({} bytes)",
                    info.free_clusters,
                    info.free_clusters as u64 * info.cluster_size as u64
                )?;
            }
            "vbrinfo" => self.volume_info()?,
            "mbrinfo" => self.partitions()?,
            "ldir" => {
                let parsed = parse_command(line, "ldir %s");
                self.local_dir(Path::new(parsed.text(0).unwrap_or(".")))?
            }
            "lcd" => match parse_command(line, "lcd %s").text(0) {
                Some(path) => {
                    std::env::set_current_dir(path)?;
                    writeln!(self.out, "{}", std::env::current_dir()?.display())?;
                }
                None => self.usage("lcd")?,
            },
            "lpwd" => writeln!(self.out, "{}", std::env::current_dir()?.display())?,
            "help" => self.help()?,
            "exit" | "quit" => return Ok(Flow::Exit),
            other => writeln!(self.out, "unknown command `{other}`; try help")?,
        }
        Ok(Flow::Continue)
    }

    fn put(&mut self, line: &str) -> Result<(), Error> {
        let parsed = parse_command(line, "put %s %s");
        let Some(local) = parsed.text(0) else {
            return self.usage("put");
        };
        let entry = self
            .engine
            .upload_file(Path::new(local), parsed.text(1))?;
        info!(
            "put {local} as {} ({} bytes, first cluster {})",
            entry.name(),
            entry.size,
            entry.first_cluster
        );
        Ok(())
    }

    fn get(&mut self, line: &str) -> Result<(), Error> {
        let parsed = parse_command(line, "get %s %s");
        let Some(remote) = parsed.text(0) else {
            return self.usage("get");
        };
        let local = PathBuf::from(parsed.text(1).unwrap_or(remote));
        let size = self.engine.download_to(remote, &local)?;
        info!("got {remote} into {} ({size} bytes)", local.display());
        Ok(())
    }

    fn dir(&mut self, pattern: Option<&str>) -> Result<(), Error> {
        let filter = match pattern.map(Pattern::new).transpose() {
            Ok(filter) => filter,
            Err(err) => {
                writeln!(self.out, "bad pattern: {err}")?;
                return Ok(());
            }
        };
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::new()
        };
        let entries: Vec<_> = self
            .engine
            .list()
            .into_iter()
            .filter(|entry| {
                filter
                    .as_ref()
                    .is_none_or(|p| p.matches_with(&entry.name(), options))
            })
            .collect();

        writeln!(self.out, "directory {}", self.engine.current_path())?;
        let mut files = 0usize;
        for entry in &entries {
            let size = if entry.is_directory() {
                "<DIR>".to_string()
            } else {
                files += 1;
                entry.size.to_string()
            };
            writeln!(
                self.out,
                "{:<12} {:>10}  {}",
                entry.name(),
                size,
                entry.modified.map(format_timestamp).unwrap_or_default()
            )?;
        }
        let info = self.engine.volume_info();
        writeln!(
            self.out,
            "{files} files, {} dirs, {} bytes free",
            entries.len() - files,
            info.free_clusters as u64 * info.cluster_size as u64
        )?;
        Ok(())
    }

    fn sector_dump(&mut self, line: &str) -> Result<(), Error> {
        let parsed = parse_command(line, "secdump %s %d %d");
        let start = parsed.int(1).and_then(|n| u32::try_from(n).ok());
        let count = u32::try_from(parsed.int(2).unwrap_or(1)).ok();
        let (Some(local), Some(start), Some(count)) = (parsed.text(0), start, count) else {
            return self.usage("secdump");
        };
        let bytes = self.engine.dump_sectors_to(start, count, Path::new(local))?;
        info!("saved {count} sectors from {start} into {local} ({bytes} bytes)");
        Ok(())
    }

    fn sector_restore(&mut self, line: &str) -> Result<(), Error> {
        let parsed = parse_command(line, "secrestore %s %d");
        let start = parsed.int(1).and_then(|n| u32::try_from(n).ok());
        let (Some(local), Some(start)) = (parsed.text(0), start) else {
            return self.usage("secrestore");
        };
        let written = self.engine.restore_sectors_from(Path::new(local), start)?;
        warn!("wrote {written} raw sectors from {local} at {start}");
        Ok(())
    }

    fn partitions(&mut self) -> Result<(), Error> {
        let parts = self.engine.partitions()?;
        if parts.is_empty() {
            writeln!(self.out, "no partition table")?;
        }
        for part in parts {
            writeln!(
                self.out,
                "{} {} type ${:02x}{} start {} sectors {}",
                part.index,
                if part.bootable { "*" } else { " " },
                part.kind,
                if part.is_fat() { " (FAT)" } else { "" },
                part.start,
                part.sectors
            )?;
        }
        Ok(())
    }

    fn local_dir(&mut self, path: &Path) -> Result<(), Error> {
        let mut entries: Vec<(String, Option<u64>)> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let size = entry
                    .metadata()
                    .ok()
                    .filter(|meta| meta.is_file())
                    .map(|meta| meta.len());
                (name, size)
            })
            .collect();
        entries.sort();
        for (name, size) in entries {
            match size {
                Some(size) => writeln!(self.out, "{name:<32} {size:>10}")?,
                None => writeln!(self.out, "{name:<32} {:>10}", "<DIR>")?,
            }
        }
        Ok(())
    }

    fn cluster_map(&mut self, start: u32, count: u32) -> Result<(), Error> {
        for (cluster, value) in self.engine.cluster_map(start, count) {
            let meaning = match value & 0x0FFF_FFFF {
                0 => "free".to_string(),
                v if v >= FAT32_EOC => "end of chain".to_string(),
                FAT32_BAD => "bad".to_string(),
                v => format!("-> {v}"),
            };
            writeln!(self.out, "{cluster:>8}  ${value:08x}  {meaning}")?;
        }
        Ok(())
    }

    fn volume_info(&mut self) -> Result<(), Error> {
        let info = self.engine.volume_info();
        writeln!(self.out, "label           {}", info.label)?;
        writeln!(self.out, "partition start {}", info.partition_start)?;
        writeln!(self.out, "table start     {}", info.fat_start)?;
        writeln!(self.out, "table copies    {}", info.fats)?;
        writeln!(self.out, "sectors/table   {}", info.sectors_per_fat)?;
        writeln!(self.out, "data start      {}", info.data_start)?;
        writeln!(self.out, "cluster size    {}", info.cluster_size)?;
        writeln!(self.out, "root cluster    {}", info.root_cluster)?;
        writeln!(self.out, "last cluster    {}", info.max_cluster)?;
        writeln!(self.out, "free clusters   {}", info.free_clusters)?;
        Ok(())
    }

    fn help(&mut self) -> Result<(), Error> {
        for (usage, what) in HELP {
            writeln!(self.out, "  {usage:<28} {what}")?;
        }
        writeln!(
            self.out,
            "An upload cut off mid-commit can leave allocated clusters no file owns; \
             they are not reclaimed automatically."
        )?;
        writeln!(
            self.out,
            "Transfers cannot be cancelled from this shell; cancellation is a library \
             API (FileTransferEngine::set_interrupt)."
        )?;
        Ok(())
    }

    fn usage(&mut self, verb: &str) -> Result<(), Error> {
        let usage = HELP
            .iter()
            .find(|(usage, _)| usage.split_whitespace().next() == Some(verb))
            .map(|(usage, _)| *usage)
            .unwrap_or(verb);
        writeln!(self.out, "usage: {usage}")?;
        Ok(())
    }
}

/// Decimal or `$`-prefixed hex argument after `verb`.
fn number_arg(line: &str, verb: &str) -> Option<u32> {
    let hex = parse_command(line, &format!("{verb} $%x"));
    let dec = parse_command(line, &format!("{verb} %d"));
    hex.int(0).or(dec.int(0)).and_then(|n| u32::try_from(n).ok())
}

fn format_timestamp(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn write_hex_dump<W: Write>(out: &mut W, data: &[u8]) -> std::io::Result<()> {
    for (row, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let text: String = chunk
            .iter()
            .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
            .collect();
        writeln!(out, "{:04x}  {}  {}", row * 16, hex.join(" "), text)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use remotefat::{
        fat::{format_image, FatVolume, FormatOptions, TableUpdate},
        MemoryDisk, SECTOR_SIZE,
    };

    use super::*;

    fn engine() -> FileTransferEngine<MemoryDisk> {
        let image = format_image(&FormatOptions {
            clusters: 64,
            reserved_sectors: 1,
            ..FormatOptions::default()
        })
        .unwrap();
        FileTransferEngine::new(FatVolume::load(MemoryDisk::new(image)).unwrap()).unwrap()
    }

    fn run(engine: &mut FileTransferEngine<MemoryDisk>, commands: &[&str]) -> (Result<()>, String) {
        let mut out = Vec::new();
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        let result = Shell::new(engine, &mut out).run_commands(&commands);
        (result, String::from_utf8(out).unwrap())
    }

    #[test]
    fn put_then_get_through_quoted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("my test file.d81");
        let target = dir.path().join("copy.d81");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &payload).unwrap();

        let mut engine = engine();
        let (result, out) = run(
            &mut engine,
            &[
                &format!("put \"{}\" TEST.D81", source.display()),
                &format!("get TEST.D81 \"{}\"", target.display()),
                "dir",
            ],
        );
        result.unwrap();
        assert_eq!(fs::read(&target).unwrap(), payload);
        assert!(out.contains("TEST.D81"));
        assert!(out.contains("1 files"));
    }

    #[test]
    fn recoverable_errors_keep_the_session() {
        let mut engine = engine();
        let (result, out) = run(
            &mut engine,
            &["del NOPE.PRG", "get \"bad name\"", "put /nonexistent/file.prg X", "free"],
        );
        result.unwrap();
        assert!(out.contains("clusters free"));
    }

    #[test]
    fn under_filled_commands_print_usage() {
        let mut engine = engine();
        let (result, out) = run(&mut engine, &["rename ONLY.PRG", "sector", "clustermap"]);
        result.unwrap();
        assert!(out.contains("usage: rename <old> <new>"));
        assert!(out.contains("usage: sector <n>|$<hex>"));
        assert!(out.contains("usage: clustermap <start> [count]"));
    }

    #[test]
    fn sector_accepts_decimal_and_hex() {
        let mut engine = engine();
        let (result, out) = run(&mut engine, &["sector 1", "sector $1"]);
        result.unwrap();
        assert_eq!(out.matches("sector 1 ($1):").count(), 2);
        assert!(out.contains("01f0  "));
        assert!(out.contains(" 55 aa"));
    }

    #[test]
    fn exit_stops_the_queue() {
        let mut engine = engine();
        let (result, out) = run(&mut engine, &["quit", "help"]);
        result.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn chain_and_map_views() {
        let mut engine = engine();
        engine.upload(&[7u8; 9000], "MAP.BIN").unwrap();
        let first = engine.find("MAP.BIN").unwrap().first_cluster;
        let (result, out) = run(
            &mut engine,
            &["clusters MAP.BIN", "frag MAP.BIN", &format!("clustermap {first} 4")],
        );
        result.unwrap();
        assert!(out.contains("MAP.BIN: 3 clusters:"));
        assert!(out.contains("MAP.BIN: contiguous"));
        assert!(out.contains(&format!("-> {}", first + 1)));
        assert!(out.contains("end of chain"));
        assert!(out.contains("free"));
    }

    #[test]
    fn corrupt_chain_ends_the_session() {
        let mut engine = engine();
        engine.upload(&[1u8; 9000], "LOOP.BIN").unwrap();
        let first = engine.find("LOOP.BIN").unwrap().first_cluster;
        engine
            .volume_mut()
            .commit(
                &[TableUpdate {
                    cluster: first + 2,
                    value: first,
                }],
                &[],
            )
            .unwrap();

        let (result, out) = run(&mut engine, &["get LOOP.BIN /dev/null", "dir"]);
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("loops"));
        assert!(!out.contains("files"));
    }

    #[test]
    fn directories_are_created_entered_and_filtered() {
        let mut engine = engine();
        engine.upload(b"prg", "A.PRG").unwrap();
        engine.upload(b"seq", "B.SEQ").unwrap();
        let (result, out) = run(
            &mut engine,
            &["mkdir GAMES", "dir *.prg", "cd games", "dir", "chdir ..", "dir g*"],
        );
        result.unwrap();
        assert!(out.contains("1 files, 0 dirs"));
        assert!(!out.contains("B.SEQ"));
        assert!(out.contains("directory /GAMES"));
        assert!(out.contains("0 files, 0 dirs"));
        assert!(out.contains("<DIR>"));
        assert!(out.contains("0 files, 1 dirs"));
        assert_eq!(engine.current_path(), "/");
    }

    #[test]
    fn raw_sectors_round_trip_through_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("boot.bin");
        let patch = dir.path().join("patch.bin");
        fs::write(&patch, [0xABu8; SECTOR_SIZE]).unwrap();

        let mut engine = engine();
        let scratch = engine.volume().cluster_to_sector(20);
        let (result, out) = run(
            &mut engine,
            &[
                &format!("secdump \"{}\" 1 2", dump.display()),
                &format!("secrestore \"{}\" {scratch}", patch.display()),
                "secdump",
                "mbrinfo",
            ],
        );
        result.unwrap();
        let saved = fs::read(&dump).unwrap();
        assert_eq!(saved.len(), 2 * SECTOR_SIZE);
        assert_eq!(&saved[510..512], &[0x55, 0xAA]);
        assert_eq!(engine.read_sector(scratch).unwrap(), [0xABu8; SECTOR_SIZE]);
        assert!(out.contains("usage: secdump <local> <start> [count]"));
        assert!(out.contains("0 * type $0c (FAT) start 1"));
    }

    #[test]
    fn cluster_dump_checks_its_range() {
        let mut engine = engine();
        let (result, out) = run(&mut engine, &["cluster", "cluster 1", "cluster $2"]);
        result.unwrap();
        assert!(out.contains("usage: cluster <n>|$<hex>"));
        assert!(!out.contains("cluster 1 sector"));
        assert!(out.contains("cluster 2 sector 7:"));
    }

    #[test]
    fn local_listing_and_help_text() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"12345").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut engine = engine();
        let (result, out) = run(
            &mut engine,
            &[&format!("ldir \"{}\"", dir.path().display()), "lpwd", "help"],
        );
        result.unwrap();
        assert!(out.contains("notes.txt"));
        assert!(out.contains("         5"));
        assert!(out.contains("<DIR>"));
        assert!(out.contains("cannot be cancelled from this shell"));
        assert!(out.contains("mkdir <name>"));
    }

    #[test]
    fn interactive_session_ends_at_eof() {
        let mut engine = engine();
        let mut out = Vec::new();
        Shell::new(&mut engine, &mut out)
            .run_interactive("free\n".as_bytes())
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with(PROMPT));
        assert!(out.contains("clusters free"));
    }
}
