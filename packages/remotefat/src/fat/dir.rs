use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use super::{
    le16, le32, volume::FatVolume, ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME,
    DELETED_MARKER, DIR_ENTRIES_PER_SECTOR, DIR_ENTRY_SIZE,
};
use crate::{
    block::{BlockDevice, Sector},
    error::Error,
    SECTOR_SIZE,
};

/// Position of a slot inside the cached directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLocation {
    pub sector_index: usize,
    pub slot: usize,
}

impl SlotLocation {
    fn offset(&self) -> usize {
        self.slot * DIR_ENTRY_SIZE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub short_name: [u8; 11],
    pub attr: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub modified: Option<NaiveDateTime>,
    pub location: SlotLocation,
}

impl DirectoryEntry {
    fn parse(raw: &[u8], location: SlotLocation) -> Self {
        let mut short_name = [0u8; 11];
        short_name.copy_from_slice(&raw[..11]);
        let hi = le16(raw, 20) as u32;
        let lo = le16(raw, 26) as u32;
        Self {
            short_name,
            attr: raw[11],
            first_cluster: (hi << 16) | lo,
            size: le32(raw, 28),
            modified: decode_fat_datetime(le16(raw, 24), le16(raw, 22)),
            location,
        }
    }

    pub fn name(&self) -> String {
        short_name_to_text(&self.short_name)
    }

    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME != 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory() && !self.is_volume_label()
    }

    /// The `.` and `..` entries every subdirectory starts with.
    pub fn is_dot(&self) -> bool {
        self.short_name[0] == b'.'
    }
}

const DOT_NAME: [u8; 11] = *b".          ";
const DOTDOT_NAME: [u8; 11] = *b"..         ";

/// Cache of one directory's cluster chain. Mutations only touch the cache and
/// mark sectors dirty; the caller writes them back through `FatVolume::commit`.
#[derive(Clone, Debug)]
pub struct DirectoryManager {
    clusters: Vec<u32>,
    sector_numbers: Vec<u32>,
    sectors: Vec<Sector>,
    dirty: BTreeSet<usize>,
}

impl DirectoryManager {
    pub fn load<D: BlockDevice>(volume: &mut FatVolume<D>) -> Result<Self, Error> {
        let root = volume.root_cluster();
        Self::load_at(volume, root)
    }

    /// Loads the directory whose chain starts at `first_cluster`.
    pub fn load_at<D: BlockDevice>(
        volume: &mut FatVolume<D>,
        first_cluster: u32,
    ) -> Result<Self, Error> {
        let clusters = volume.chain_of(first_cluster)?;
        let sectors = volume.read_clusters(&clusters)?;
        let spc = volume.sectors_per_cluster();
        let sector_numbers = clusters
            .iter()
            .flat_map(|&cluster| {
                let first = volume.cluster_to_sector(cluster);
                (0..spc).map(move |i| first + i)
            })
            .collect();
        Ok(Self {
            clusters,
            sector_numbers,
            sectors,
            dirty: BTreeSet::new(),
        })
    }

    pub fn clusters(&self) -> &[u32] {
        &self.clusters
    }

    pub fn first_cluster(&self) -> u32 {
        self.clusters.first().copied().unwrap_or(0)
    }

    pub fn slot_count(&self) -> usize {
        self.sectors.len() * DIR_ENTRIES_PER_SECTOR
    }

    fn slot(&self, location: SlotLocation) -> &[u8] {
        let off = location.offset();
        &self.sectors[location.sector_index][off..off + DIR_ENTRY_SIZE]
    }

    fn slot_mut(&mut self, location: SlotLocation) -> &mut [u8] {
        self.dirty.insert(location.sector_index);
        let off = location.offset();
        &mut self.sectors[location.sector_index][off..off + DIR_ENTRY_SIZE]
    }

    /// Every slot before the end marker, in directory order.
    fn used_slots(&self) -> impl Iterator<Item = SlotLocation> + '_ {
        (0..self.sectors.len())
            .flat_map(|sector_index| {
                (0..DIR_ENTRIES_PER_SECTOR).map(move |slot| SlotLocation { sector_index, slot })
            })
            .take_while(|loc| self.slot(*loc)[0] != 0x00)
    }

    /// Live short entries (files, subdirectories and the volume label).
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.used_slots()
            .filter_map(|loc| {
                let raw = self.slot(loc);
                if raw[0] == DELETED_MARKER || raw[11] & ATTR_LONG_NAME == ATTR_LONG_NAME {
                    return None;
                }
                Some(DirectoryEntry::parse(raw, loc))
            })
            .collect()
    }

    pub fn files(&self) -> Vec<DirectoryEntry> {
        self.entries().into_iter().filter(|e| e.is_file()).collect()
    }

    /// Files and subdirectories, without the label and the dot entries.
    pub fn listing(&self) -> Vec<DirectoryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| !e.is_volume_label() && !e.is_dot())
            .collect()
    }

    /// Target of the `..` entry; 0 stands for the root directory.
    pub fn parent_cluster(&self) -> Option<u32> {
        self.entries()
            .into_iter()
            .find(|e| e.is_directory() && e.short_name == DOTDOT_NAME)
            .map(|e| e.first_cluster)
    }

    pub fn label(&self) -> Option<String> {
        self.entries()
            .into_iter()
            .find(|e| e.is_volume_label())
            .map(|e| {
                String::from_utf8_lossy(&e.short_name)
                    .trim_end()
                    .to_string()
            })
    }

    pub fn find(&self, name: &str) -> Result<DirectoryEntry, Error> {
        let short = encode_short_name(name)?;
        self.files()
            .into_iter()
            .find(|e| e.short_name == short)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn find_dir(&self, name: &str) -> Result<DirectoryEntry, Error> {
        let short = encode_short_name(name)?;
        self.entries()
            .into_iter()
            .find(|e| e.is_directory() && !e.is_dot() && e.short_name == short)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn name_taken(&self, short: &[u8; 11]) -> Option<DirectoryEntry> {
        self.entries()
            .into_iter()
            .find(|e| !e.is_volume_label() && &e.short_name == short)
    }

    /// First deleted slot, else the end-marker slot.
    pub fn free_slot(&self) -> Option<SlotLocation> {
        let mut end = None;
        for sector_index in 0..self.sectors.len() {
            for slot in 0..DIR_ENTRIES_PER_SECTOR {
                let loc = SlotLocation { sector_index, slot };
                match self.slot(loc)[0] {
                    DELETED_MARKER => return Some(loc),
                    0x00 => {
                        end = Some(loc);
                        break;
                    }
                    _ => {}
                }
            }
            if end.is_some() {
                break;
            }
        }
        end
    }

    pub fn create(
        &mut self,
        name: &str,
        size: u32,
        first_cluster: u32,
        timestamp: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        self.create_entry(name, ATTR_ARCHIVE, size, first_cluster, timestamp)
    }

    pub fn create_dir(
        &mut self,
        name: &str,
        first_cluster: u32,
        timestamp: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        self.create_entry(name, ATTR_DIRECTORY, 0, first_cluster, timestamp)
    }

    fn create_entry(
        &mut self,
        name: &str,
        attr: u8,
        size: u32,
        first_cluster: u32,
        timestamp: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        let short = encode_short_name(name)?;
        if self.name_taken(&short).is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        let location = self.free_slot().ok_or(Error::DirectoryFull)?;
        write_entry(
            self.slot_mut(location),
            &short,
            attr,
            size,
            first_cluster,
            timestamp,
        );
        Ok(DirectoryEntry::parse(self.slot(location), location))
    }

    /// Points an existing file entry at new contents, in its own slot.
    /// Creation time and attributes are kept.
    pub fn rewrite(
        &mut self,
        name: &str,
        size: u32,
        first_cluster: u32,
        modified: NaiveDateTime,
    ) -> Result<DirectoryEntry, Error> {
        let entry = self.find(name)?;
        let (date, time) = encode_fat_datetime(modified);
        let raw = self.slot_mut(entry.location);
        raw[18..20].copy_from_slice(&date.to_le_bytes());
        raw[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        raw[22..24].copy_from_slice(&time.to_le_bytes());
        raw[24..26].copy_from_slice(&date.to_le_bytes());
        raw[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&size.to_le_bytes());
        Ok(DirectoryEntry::parse(self.slot(entry.location), entry.location))
    }

    pub fn delete(&mut self, name: &str) -> Result<DirectoryEntry, Error> {
        let entry = self.find(name)?;
        self.slot_mut(entry.location)[0] = DELETED_MARKER;
        self.drop_long_name(entry.location);
        Ok(entry)
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<DirectoryEntry, Error> {
        let new_short = encode_short_name(new)?;
        let entry = self.find(old)?;
        if let Some(existing) = self.name_taken(&new_short) {
            if existing.location != entry.location {
                return Err(Error::AlreadyExists(new.to_string()));
            }
        }
        self.slot_mut(entry.location)[..11].copy_from_slice(&new_short);
        self.drop_long_name(entry.location);
        Ok(DirectoryEntry::parse(self.slot(entry.location), entry.location))
    }

    // Long-name slots directly before a short entry belong to it.
    fn drop_long_name(&mut self, location: SlotLocation) {
        let mut linear = location.sector_index * DIR_ENTRIES_PER_SECTOR + location.slot;
        while linear > 0 {
            linear -= 1;
            let loc = SlotLocation {
                sector_index: linear / DIR_ENTRIES_PER_SECTOR,
                slot: linear % DIR_ENTRIES_PER_SECTOR,
            };
            let raw = self.slot(loc);
            if raw[0] == DELETED_MARKER || raw[11] & ATTR_LONG_NAME != ATTR_LONG_NAME {
                break;
            }
            self.slot_mut(loc)[0] = DELETED_MARKER;
        }
    }

    /// Appends a freshly allocated, zeroed cluster to the cache.
    pub fn extend(&mut self, cluster: u32, first_sector: u32, sectors_per_cluster: u32) {
        self.clusters.push(cluster);
        for i in 0..sectors_per_cluster {
            self.sector_numbers.push(first_sector + i);
            self.sectors.push([0u8; SECTOR_SIZE]);
            self.dirty.insert(self.sectors.len() - 1);
        }
    }

    pub fn dirty_sectors(&self) -> Vec<(u32, Sector)> {
        self.dirty
            .iter()
            .map(|&idx| (self.sector_numbers[idx], self.sectors[idx]))
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

fn write_entry(
    raw: &mut [u8],
    short: &[u8; 11],
    attr: u8,
    size: u32,
    first_cluster: u32,
    timestamp: NaiveDateTime,
) {
    let (date, time) = encode_fat_datetime(timestamp);
    raw.fill(0);
    raw[..11].copy_from_slice(short);
    raw[11] = attr;
    raw[14..16].copy_from_slice(&time.to_le_bytes());
    raw[16..18].copy_from_slice(&date.to_le_bytes());
    raw[18..20].copy_from_slice(&date.to_le_bytes());
    raw[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
    raw[22..24].copy_from_slice(&time.to_le_bytes());
    raw[24..26].copy_from_slice(&date.to_le_bytes());
    raw[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
    raw[28..32].copy_from_slice(&size.to_le_bytes());
}

/// First sector of a new subdirectory: `.` pointing at itself and `..` at
/// the parent, where 0 means the root.
pub fn new_directory_sector(own: u32, parent: u32, timestamp: NaiveDateTime) -> Sector {
    let mut sector = [0u8; SECTOR_SIZE];
    write_entry(
        &mut sector[..DIR_ENTRY_SIZE],
        &DOT_NAME,
        ATTR_DIRECTORY,
        0,
        own,
        timestamp,
    );
    write_entry(
        &mut sector[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE],
        &DOTDOT_NAME,
        ATTR_DIRECTORY,
        0,
        parent,
        timestamp,
    );
    sector
}

/// Packs a name into the on-disk 11-byte form, upper-casing it.
pub fn encode_short_name(name: &str) -> Result<[u8; 11], Error> {
    let invalid = || Error::InvalidName(name.to_string());
    let bytes = name.as_bytes();
    let (base, ext) = match bytes.iter().position(|&b| b == b'.') {
        Some(dot) => {
            let after = &bytes[dot + 1..];
            if after.contains(&b'.') {
                return Err(invalid());
            }
            (&bytes[..dot], after)
        }
        None => (bytes, &[][..]),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(invalid());
    }

    let mut out = [b' '; 11];
    for (i, b) in base.iter().enumerate() {
        out[i] = normalize_short_char(*b).ok_or_else(invalid)?;
    }
    for (i, b) in ext.iter().enumerate() {
        out[8 + i] = normalize_short_char(*b).ok_or_else(invalid)?;
    }
    Ok(out)
}

pub(crate) fn normalize_short_char(byte: u8) -> Option<u8> {
    let up = byte.to_ascii_uppercase();
    let allowed = up.is_ascii_uppercase()
        || up.is_ascii_digit()
        || matches!(
            up,
            b'_' | b'-' | b'$' | b'~' | b'!' | b'#' | b'%' | b'&' | b'\'' | b'(' | b')' | b'@'
                | b'^' | b'{' | b'}'
        );
    allowed.then_some(up)
}

pub fn short_name_to_text(raw: &[u8; 11]) -> String {
    let base = String::from_utf8_lossy(&raw[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&raw[8..]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// `(date, time)` in FAT packing; two-second resolution, clamped to 1980.
pub fn encode_fat_datetime(at: NaiveDateTime) -> (u16, u16) {
    if at.year() < 1980 {
        return ((1 << 5) | 1, 0);
    }
    let year = (at.year() - 1980).min(127) as u16;
    let date = (year << 9) | ((at.month() as u16) << 5) | at.day() as u16;
    let time = ((at.hour() as u16) << 11) | ((at.minute() as u16) << 5) | (at.second() as u16 / 2);
    (date, time)
}

pub fn decode_fat_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    let day = NaiveDate::from_ymd_opt(
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0x0F) as u32,
        (date & 0x1F) as u32,
    )?;
    day.and_hms_opt(
        (time >> 11) as u32,
        ((time >> 5) & 0x3F) as u32,
        (time & 0x1F) as u32 * 2,
    )
}
