use std::{
    collections::HashMap,
    io::{Read, Seek},
    str::FromStr,
};

use gpt_disk_types::{
    Crc32, GptHeader, GptPartitionAttributes, GptPartitionEntry, GptPartitionName,
    GptPartitionType, Guid, LbaLe, U32Le, U64Le,
};

pub const SECTOR_SIZE: usize = 0x200;

/// Sectors taken by the protective MBR, the header and a 128 entry array.
pub const GPT_RESERVED_SECTORS: u64 = 0x22;
pub const GPT_RESERVED_BYTES: usize = GPT_RESERVED_SECTORS as usize * SECTOR_SIZE;

const HEADER_OFFSET: usize = SECTOR_SIZE;
const HEADER_SIZE: usize = core::mem::size_of::<GptHeader>();
const ENTRY_SIZE: usize = core::mem::size_of::<GptPartitionEntry>();
const DEFAULT_ENTRY_COUNT: u32 = 128;

/// Partitions that get split or relocated while a phone is unlocked, and the
/// partition each of them is reinstated into.
const BACKUP_PAIRS: [(&str, &str); 2] = [
    ("BACKUP_EFIESP", "EFIESP"),
    ("BACKUP_BS_NV", "UEFI_BS_NV"),
];

/// A partition that may grow into `Data` when a replacement image is larger.
const SHRINKABLE_PARTITION: &str = "Data";

#[derive(Debug, thiserror::Error)]
pub enum GptError {
    #[error("GPT chunk is {0:#X} bytes long, at least {GPT_RESERVED_BYTES:#X} bytes are needed")]
    Truncated(usize),
    #[error("GPT header signature is invalid")]
    InvalidSignature,
    #[error("Invalid partition layout: {0}")]
    InvalidLayout(String),
    #[error("Partition name '{0}' does not fit in a GPT entry")]
    InvalidName(String),
    #[error("Failed to parse partition layout manifest: {0}")]
    Manifest(#[from] roxmltree::Error),
    #[error("Partition layout manifest has an invalid {1} value '{2}' for '{0}'")]
    ManifestValue(String, &'static str, String),
    #[error("Failed to read partition archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub partition_type: Guid,
    pub guid: Guid,
    /// Inclusive.
    pub first_sector: u64,
    /// Inclusive.
    pub last_sector: u64,
    pub attributes: u64,
}

impl Partition {
    pub fn new(name: &str, partition_type: Guid, first_sector: u64, last_sector: u64) -> Self {
        Self {
            name: name.to_string(),
            partition_type,
            guid: random_guid(),
            first_sector,
            last_sector,
            attributes: 0,
        }
    }

    pub const fn size_in_sectors(&self) -> u64 {
        self.last_sector - self.first_sector + 1
    }

    pub const fn overlaps(&self, other: &Partition) -> bool {
        self.first_sector <= other.last_sector && other.first_sector <= self.last_sector
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn from_entry(entry: &GptPartitionEntry) -> Self {
        Self {
            name: entry.name.chars().collect(),
            partition_type: entry.partition_type_guid.0,
            guid: entry.unique_partition_guid,
            first_sector: entry.starting_lba.to_u64(),
            last_sector: entry.ending_lba.to_u64(),
            attributes: entry.attributes.0.to_u64(),
        }
    }

    fn to_entry(&self) -> Result<GptPartitionEntry, GptError> {
        let name = GptPartitionName::from_str(&self.name)
            .map_err(|_| GptError::InvalidName(self.name.clone()))?;

        Ok(GptPartitionEntry {
            partition_type_guid: GptPartitionType(self.partition_type),
            unique_partition_guid: self.guid,
            starting_lba: LbaLe::from_u64(self.first_sector),
            ending_lba: LbaLe::from_u64(self.last_sector),
            attributes: GptPartitionAttributes(U64Le::from_u64(self.attributes)),
            name,
        })
    }
}

pub fn random_guid() -> Guid {
    Guid::from_random_bytes(rand::random())
}

/// The GPT as it lives in the first chunk of the phone's eMMC.
///
/// Everything in the chunk outside the header and the entry array is carried
/// through untouched, and parsed partitions keep their entry slots, so a table
/// that is parsed and rebuilt without changes serializes back to the same
/// bytes.
#[derive(Debug, Clone)]
pub struct GptTable {
    chunk: Vec<u8>,
    header: GptHeader,
    partitions: Vec<Partition>,
    /// Entry slot of each partition, `None` until a new one is written.
    slots: Vec<Option<usize>>,
    changed: bool,
}

impl GptTable {
    pub fn parse(chunk: &[u8]) -> Result<Self, GptError> {
        if chunk.len() < GPT_RESERVED_BYTES {
            return Err(GptError::Truncated(chunk.len()));
        }

        if &chunk[HEADER_OFFSET..HEADER_OFFSET + 8] != b"EFI PART" {
            return Err(GptError::InvalidSignature);
        }

        let header: GptHeader =
            bytemuck::pod_read_unaligned(&chunk[HEADER_OFFSET..HEADER_OFFSET + HEADER_SIZE]);

        let entry_size = header.size_of_partition_entry.to_u32() as usize;
        if entry_size < ENTRY_SIZE {
            return Err(GptError::InvalidLayout(format!(
                "partition entries are {entry_size:#X} bytes, expected at least {ENTRY_SIZE:#X}"
            )));
        }

        let array_offset = header.partition_entry_lba.to_u64() as usize * SECTOR_SIZE;
        let capacity = header.number_of_partition_entries.to_u32() as usize;
        let array_end = array_offset + capacity * entry_size;
        if array_end > chunk.len() {
            return Err(GptError::Truncated(chunk.len()));
        }

        let (slots, partitions): (Vec<_>, Vec<_>) = chunk[array_offset..array_end]
            .chunks_exact(entry_size)
            .map(|slot| bytemuck::pod_read_unaligned::<GptPartitionEntry>(&slot[..ENTRY_SIZE]))
            .enumerate()
            .filter(|(_, entry)| entry.is_used())
            .map(|(slot, entry)| (Some(slot), Partition::from_entry(&entry)))
            .unzip();

        tracing::debug!(
            "Parsed GPT with {} partitions ({capacity} slots)",
            partitions.len()
        );

        Ok(Self {
            chunk: chunk.to_vec(),
            header,
            partitions,
            slots,
            changed: false,
        })
    }

    /// Lays out an empty table for a disk of `disk_sectors` sectors inside a
    /// zeroed chunk of `chunk_len` bytes.
    pub fn format(disk_sectors: u64, chunk_len: usize) -> Result<Self, GptError> {
        if chunk_len < GPT_RESERVED_BYTES {
            return Err(GptError::Truncated(chunk_len));
        }

        // Room for the primary and backup tables and one usable sector
        let (Some(last_sector), Some(last_usable_sector)) = (
            disk_sectors.checked_sub(1),
            disk_sectors.checked_sub(GPT_RESERVED_SECTORS),
        ) else {
            return Err(GptError::InvalidLayout(format!(
                "disk of {disk_sectors:#X} sectors cannot hold a partition table"
            )));
        };
        if last_usable_sector < GPT_RESERVED_SECTORS {
            return Err(GptError::InvalidLayout(format!(
                "disk of {disk_sectors:#X} sectors has no usable sectors"
            )));
        }

        let mut chunk = vec![0u8; chunk_len];

        // Protective MBR
        let mbr_sectors = last_sector.min(u32::MAX as u64) as u32;
        chunk[0x1C2] = 0xEE;
        chunk[0x1C6..0x1CA].copy_from_slice(&1u32.to_le_bytes());
        chunk[0x1CA..0x1CE].copy_from_slice(&mbr_sectors.to_le_bytes());
        chunk[0x1FE] = 0x55;
        chunk[0x1FF] = 0xAA;

        let header = &mut chunk[HEADER_OFFSET..HEADER_OFFSET + HEADER_SIZE];
        header[0..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        header[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes());
        header[32..40].copy_from_slice(&last_sector.to_le_bytes());
        header[40..48].copy_from_slice(&GPT_RESERVED_SECTORS.to_le_bytes());
        header[48..56].copy_from_slice(&last_usable_sector.to_le_bytes());
        header[56..72].copy_from_slice(&random_guid().to_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes());
        header[80..84].copy_from_slice(&DEFAULT_ENTRY_COUNT.to_le_bytes());
        header[84..88].copy_from_slice(&(ENTRY_SIZE as u32).to_le_bytes());

        let mut table = Self::parse(&chunk)?;
        table.rebuild()?;
        Ok(table)
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|partition| partition.is_named(name))
    }

    /// Handing out a mutable partition marks the table as changed.
    pub fn partition_mut(&mut self, name: &str) -> Option<&mut Partition> {
        let partition = self
            .partitions
            .iter_mut()
            .find(|partition| partition.is_named(name))?;
        self.changed = true;
        Some(partition)
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn entry_capacity(&self) -> usize {
        self.header.number_of_partition_entries.to_u32() as usize
    }

    pub fn first_usable_sector(&self) -> u64 {
        self.header.first_usable_lba.to_u64()
    }

    pub fn last_usable_sector(&self) -> u64 {
        self.header.last_usable_lba.to_u64()
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk.len()
    }

    pub fn add_partition(&mut self, partition: Partition) -> Result<(), GptError> {
        if self.partitions.len() >= self.entry_capacity() {
            return Err(GptError::InvalidLayout(format!(
                "no free entry for '{}', all {} entries are in use",
                partition.name,
                self.entry_capacity()
            )));
        }

        if self.partition(&partition.name).is_some() {
            return Err(GptError::InvalidLayout(format!(
                "partition '{}' already exists",
                partition.name
            )));
        }

        self.check_placement(&partition, None)?;

        tracing::debug!(
            "Adding partition {} at sectors {:#X}..={:#X}",
            partition.name,
            partition.first_sector,
            partition.last_sector
        );

        self.partitions.push(partition);
        self.slots.push(None);
        self.changed = true;
        Ok(())
    }

    pub fn remove_partition(&mut self, name: &str) -> Option<Partition> {
        let index = self
            .partitions
            .iter()
            .position(|partition| partition.is_named(name))?;
        self.changed = true;
        tracing::debug!("Removing partition {name}");
        self.slots.remove(index);
        Some(self.partitions.remove(index))
    }

    /// Runs `edit`, putting the partitions back as they were if it fails.
    fn transaction<T>(
        &mut self,
        edit: impl FnOnce(&mut Self) -> Result<T, GptError>,
    ) -> Result<T, GptError> {
        let partitions = self.partitions.clone();
        let slots = self.slots.clone();
        let changed = self.changed;

        let result = edit(self);
        if result.is_err() {
            self.partitions = partitions;
            self.slots = slots;
            self.changed = changed;
        }
        result
    }

    fn check_placement(&self, partition: &Partition, skip: Option<usize>) -> Result<(), GptError> {
        if partition.first_sector > partition.last_sector {
            return Err(GptError::InvalidLayout(format!(
                "partition '{}' ends before it starts",
                partition.name
            )));
        }

        if partition.first_sector < self.first_usable_sector()
            || partition.last_sector > self.last_usable_sector()
        {
            return Err(GptError::InvalidLayout(format!(
                "partition '{}' ({:#X}..={:#X}) is outside the usable range {:#X}..={:#X}",
                partition.name,
                partition.first_sector,
                partition.last_sector,
                self.first_usable_sector(),
                self.last_usable_sector()
            )));
        }

        if let Some(other) = self
            .partitions
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != skip)
            .map(|(_, other)| other)
            .find(|other| other.overlaps(partition))
        {
            return Err(GptError::InvalidLayout(format!(
                "partition '{}' overlaps '{}'",
                partition.name, other.name
            )));
        }

        Ok(())
    }

    /// Checks every partition against the usable range and all the others.
    pub fn validate(&self) -> Result<(), GptError> {
        for (idx, partition) in self.partitions.iter().enumerate() {
            self.check_placement(partition, Some(idx))?;
        }
        Ok(())
    }

    /// Lowest free run of `sectors` sectors at or above `from` inside the
    /// usable range.
    pub fn find_free_range(&self, sectors: u64, from: u64) -> Option<u64> {
        let mut occupied = self
            .partitions
            .iter()
            .map(|partition| (partition.first_sector, partition.last_sector))
            .collect::<Vec<_>>();
        occupied.sort_unstable();

        let mut candidate = self.first_usable_sector().max(from);
        for (first, last) in occupied {
            if last < candidate {
                continue;
            }
            if first >= candidate && first - candidate >= sectors {
                return Some(candidate);
            }
            candidate = candidate.max(last + 1);
        }

        (self.last_usable_sector() + 1)
            .checked_sub(candidate)
            .filter(|free| *free >= sectors)
            .map(|_| candidate)
    }

    /// Recomputes both CRCs and serializes the table back into its chunk.
    ///
    /// Partitions stay in their entry slots, new ones take the lowest free
    /// slot and slots of removed ones are cleared.
    pub fn rebuild(&mut self) -> Result<Vec<u8>, GptError> {
        let entry_size = self.header.size_of_partition_entry.to_u32() as usize;
        let array_offset = self.header.partition_entry_lba.to_u64() as usize * SECTOR_SIZE;
        let capacity = self.entry_capacity();
        let mut array = self.chunk[array_offset..array_offset + capacity * entry_size].to_vec();

        let mut taken = vec![false; capacity];
        for slot in self.slots.iter().flatten() {
            taken[*slot] = true;
        }

        let mut free = (0..capacity).filter(|slot| !taken[*slot]);
        for (partition, slot) in self.partitions.iter().zip(self.slots.iter_mut()) {
            let index = match slot {
                Some(index) => *index,
                None => {
                    let index = free.next().ok_or_else(|| {
                        GptError::InvalidLayout(format!(
                            "no free entry for '{}', all {capacity} entries are in use",
                            partition.name
                        ))
                    })?;
                    *slot = Some(index);
                    index
                }
            };

            let entry = &mut array[index * entry_size..index * entry_size + ENTRY_SIZE];
            entry.copy_from_slice(bytemuck::bytes_of(&partition.to_entry()?));
        }

        // Entries of removed partitions
        for (index, entry) in array.chunks_exact_mut(entry_size).enumerate() {
            if !self.slots.contains(&Some(index))
                && bytemuck::pod_read_unaligned::<GptPartitionEntry>(&entry[..ENTRY_SIZE]).is_used()
            {
                entry.fill(0);
            }
        }

        self.header.partition_entry_array_crc32 = Crc32(U32Le::from_u32(crc32fast::hash(&array)));
        self.header.update_header_crc32();

        self.chunk[array_offset..array_offset + array.len()].copy_from_slice(&array);
        self.chunk[HEADER_OFFSET..HEADER_OFFSET + HEADER_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&self.header));

        self.changed = false;
        Ok(self.chunk.clone())
    }

    /// Reinstates partitions from their `BACKUP_*` counterparts.
    ///
    /// With a `limit` only partitions reaching past it (the sectors an
    /// emergency flasher can address) are reinstated, without one every pair
    /// found is. Adjacent halves are merged back, a detached backup hands its
    /// range over. Returns whether the table changed.
    pub fn restore_backup_partitions(&mut self, limit: Option<u64>) -> Result<bool, GptError> {
        self.transaction(|table| {
            let mut changed = false;
            for (backup_name, name) in BACKUP_PAIRS {
                changed |= table.restore_backup_partition(backup_name, name, limit)?;
            }
            Ok(changed)
        })
    }

    /// Reinstates `name` from `backup_name`, see [`Self::restore_backup_partitions`].
    /// The table is left as it was when the result does not validate.
    pub fn restore_backup_partition(
        &mut self,
        backup_name: &str,
        name: &str,
        limit: Option<u64>,
    ) -> Result<bool, GptError> {
        self.transaction(|table| table.reinstate_backup(backup_name, name, limit))
    }

    fn reinstate_backup(
        &mut self,
        backup_name: &str,
        name: &str,
        limit: Option<u64>,
    ) -> Result<bool, GptError> {
        let Some(backup) = self.partition(backup_name).cloned() else {
            return Ok(false);
        };

        let original = self.partition(name).cloned();
        if let (Some(original), Some(limit)) = (&original, limit)
            && original.last_sector < limit
        {
            return Ok(false);
        }

        match original {
            None => {
                // The backup takes over the original's name in its own slot
                if let Some(restored) = self.partition_mut(backup_name) {
                    restored.name = name.to_string();
                }
            }
            Some(original) => {
                self.remove_partition(backup_name);
                let adjacent = backup.last_sector + 1 == original.first_sector
                    || original.last_sector + 1 == backup.first_sector;

                if let Some(partition) = self.partition_mut(name) {
                    if adjacent {
                        partition.first_sector = original.first_sector.min(backup.first_sector);
                        partition.last_sector = original.last_sector.max(backup.last_sector);
                    } else {
                        partition.first_sector = backup.first_sector;
                        partition.last_sector = backup.last_sector;
                    }
                }
            }
        }

        tracing::info!("Restored {name} from {backup_name}");
        self.changed = true;
        self.validate()?;
        Ok(true)
    }

    /// Applies a partition layout manifest, taking partition sizes from the
    /// images in `archive` where it has one. Nothing is applied when any part
    /// of the manifest fails.
    pub fn merge_partition_layout(
        &mut self,
        xml: &str,
        archive: &mut dyn PartitionArchive,
    ) -> Result<bool, GptError> {
        self.transaction(|table| table.merge_layout(xml, archive))
    }

    fn merge_layout(
        &mut self,
        xml: &str,
        archive: &mut dyn PartitionArchive,
    ) -> Result<bool, GptError> {
        let document = roxmltree::Document::parse(xml)?;
        let mut changed = false;

        for node in document
            .descendants()
            .filter(|node| node.has_tag_name("Partition"))
        {
            let Some(name) = manifest_value(node, "Name") else {
                continue;
            };

            let first_sector = manifest_number(node, name, "FirstSector")?;
            let last_sector = manifest_number(node, name, "LastSector")?;
            let size_in_sectors = match archive.entry_len(name)? {
                Some(len) => Some((len as usize).div_ceil(SECTOR_SIZE) as u64),
                None => manifest_number(node, name, "SizeInSectors")?,
            };
            let partition_type = manifest_guid(node, name, "PartitionTypeGuid")?;
            let guid = manifest_guid(node, name, "PartitionGuid")?;
            let attributes = manifest_number(node, name, "Attributes")?;

            let merged = match self.partition(name) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.first_sector = first_sector.unwrap_or(merged.first_sector);
                    merged.last_sector = match size_in_sectors {
                        Some(size) => merged.first_sector + size - 1,
                        None => last_sector.unwrap_or(merged.last_sector),
                    };
                    merged
                }
                None => {
                    let (Some(first_sector), Some(last_sector)) = (
                        first_sector,
                        last_sector.or(size_in_sectors
                            .and_then(|size| first_sector.map(|first| first + size - 1))),
                    ) else {
                        return Err(GptError::InvalidLayout(format!(
                            "new partition '{name}' has no sector range"
                        )));
                    };
                    Partition::new(
                        name,
                        partition_type.unwrap_or(GptPartitionType::BASIC_DATA.0),
                        first_sector,
                        last_sector,
                    )
                }
            };

            let mut merged = merged;
            if let Some(partition_type) = partition_type {
                merged.partition_type = partition_type;
            }
            if let Some(guid) = guid {
                merged.guid = guid;
            }
            if let Some(attributes) = attributes {
                merged.attributes = attributes;
            }

            self.make_room(&merged)?;

            match self
                .partitions
                .iter_mut()
                .find(|partition| partition.is_named(name))
            {
                Some(partition) => {
                    if *partition != merged {
                        tracing::debug!(
                            "Resizing {name} to {:#X}..={:#X}",
                            merged.first_sector,
                            merged.last_sector
                        );
                        *partition = merged;
                        changed = true;
                    }
                }
                None => {
                    self.add_partition(merged)?;
                    changed = true;
                }
            }
        }

        if changed {
            self.changed = true;
            self.validate()?;
        }

        Ok(changed)
    }

    /// Shrinks `Data` from the front when `partition` grows into it.
    fn make_room(&mut self, partition: &Partition) -> Result<(), GptError> {
        let Some(data) = self
            .partitions
            .iter_mut()
            .filter(|other| !other.is_named(&partition.name))
            .find(|other| other.is_named(SHRINKABLE_PARTITION) && other.overlaps(partition))
        else {
            return Ok(());
        };

        if partition.first_sector > data.first_sector || partition.last_sector >= data.last_sector {
            return Err(GptError::InvalidLayout(format!(
                "'{}' cannot grow into {SHRINKABLE_PARTITION}",
                partition.name
            )));
        }

        tracing::debug!(
            "Shrinking {SHRINKABLE_PARTITION} to start at {:#X}",
            partition.last_sector + 1
        );
        data.first_sector = partition.last_sector + 1;
        Ok(())
    }
}

fn manifest_value<'a>(node: roxmltree::Node<'a, 'a>, key: &str) -> Option<&'a str> {
    node.attribute(key)
        .or_else(|| {
            node.children()
                .find(|child| child.has_tag_name(key))
                .and_then(|child| child.text())
        })
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn manifest_number(
    node: roxmltree::Node<'_, '_>,
    name: &str,
    key: &'static str,
) -> Result<Option<u64>, GptError> {
    let Some(value) = manifest_value(node, key) else {
        return Ok(None);
    };

    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };

    parsed
        .map(Some)
        .map_err(|_| GptError::ManifestValue(name.to_string(), key, value.to_string()))
}

fn manifest_guid(
    node: roxmltree::Node<'_, '_>,
    name: &str,
    key: &'static str,
) -> Result<Option<Guid>, GptError> {
    let Some(value) = manifest_value(node, key) else {
        return Ok(None);
    };

    value
        .trim_matches(|ch| ch == '{' || ch == '}')
        .parse::<Guid>()
        .map(Some)
        .map_err(|_| GptError::ManifestValue(name.to_string(), key, value.to_string()))
}

/// Source of replacement partition images, queried by partition name.
pub trait PartitionArchive {
    fn entry_len(&mut self, name: &str) -> Result<Option<u64>, GptError>;
}

impl<R: Read + Seek> PartitionArchive for zip::ZipArchive<R> {
    fn entry_len(&mut self, name: &str) -> Result<Option<u64>, GptError> {
        for candidate in [name.to_string(), format!("{name}.bin")] {
            match self.by_name(&candidate) {
                Ok(file) => return Ok(Some(file.size())),
                Err(zip::result::ZipError::FileNotFound) => continue,
                Err(why) => return Err(why.into()),
            }
        }

        Ok(None)
    }
}

impl PartitionArchive for HashMap<String, u64> {
    fn entry_len(&mut self, name: &str) -> Result<Option<u64>, GptError> {
        Ok(self.get(name).copied())
    }
}
