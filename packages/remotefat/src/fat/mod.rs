mod allocator;
mod bpb;
mod dir;
mod format;
mod table;
mod volume;


pub use allocator::ClusterAllocator;
pub use bpb::{first_fat_partition_lba, partition_table, BootParameterBlock, MbrPartition};
pub use dir::{
    decode_fat_datetime, encode_fat_datetime, encode_short_name, new_directory_sector,
    short_name_to_text, DirectoryEntry, DirectoryManager, SlotLocation,
};
pub use format::{format_image, FormatOptions};
pub use table::{
    AllocationTable, ClusterRun, TableUpdate, FAT32_BAD, FAT32_EOC, FAT32_EOC_WRITE,
};
pub use volume::FatVolume;

pub const DIR_ENTRY_SIZE: usize = 32;
pub const DIR_ENTRIES_PER_SECTOR: usize = crate::SECTOR_SIZE / DIR_ENTRY_SIZE;
pub const DELETED_MARKER: u8 = 0xE5;

pub const ATTR_VOLUME: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

pub fn clusters_for_size(size: u64, cluster_size: u32) -> u32 {
    if size == 0 {
        0
    } else {
        size.div_ceil(cluster_size as u64) as u32
    }
}

pub(crate) fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
