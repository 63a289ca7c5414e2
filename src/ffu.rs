//! Parsed headers of the FFU image the phone currently accepts.
//!
//! The engine never parses FFU files itself, it gets the three header
//! sections handed over and extends their verification tables with entries for
//! the chunks it injects.

use crate::heap::PAGE_SIZE;

pub const SECURITY_HEADER_SIZE: usize = 0x20;
pub const SECURITY_CATALOG_SIZE_OFFSET: usize = 0x18;
pub const SECURITY_HASH_TABLE_SIZE_OFFSET: usize = 0x1C;

pub const STORE_HEADER_SIZE: usize = 0xF8;
pub const STORE_PLATFORM_ID_OFFSET: usize = 0x0C;
const STORE_PLATFORM_ID_LEN: usize = 0xC0;
pub const STORE_WRITE_DESCRIPTOR_COUNT_OFFSET: usize = 0xD0;
pub const STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET: usize = 0xD4;
pub const STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET: usize = 0xDC;
pub const STORE_FLASH_ONLY_COUNT_OFFSET: usize = 0xE8;
pub const STORE_FLASH_ONLY_LENGTH_OFFSET: usize = 0xEC;

pub const HASH_ENTRY_SIZE: usize = 0x20;
pub const WRITE_DESCRIPTOR_SIZE: usize = 0x10;

#[derive(Debug, thiserror::Error)]
pub enum FfuError {
    #[error("Chunk size {0:#X} is not a non-zero multiple of the page size")]
    InvalidChunkSize(usize),
    #[error("{section} header is {actual:#X} bytes long, its fields describe {expected:#X} bytes")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{section} header is {len:#X} bytes long, the flash app only copies whole pages")]
    SectionTooSmall { section: &'static str, len: usize },
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn add_u32(bytes: &mut [u8], offset: usize, amount: usize) {
    let value = read_u32(bytes, offset).wrapping_add(amount as u32);
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Length of the security header up to the end of its hash table.
pub fn security_header_len(header: &[u8]) -> usize {
    SECURITY_HEADER_SIZE
        + read_u32(header, SECURITY_CATALOG_SIZE_OFFSET) as usize
        + read_u32(header, SECURITY_HASH_TABLE_SIZE_OFFSET) as usize
}

/// Length of the store header up to the end of its write descriptors.
pub fn store_header_len(header: &[u8]) -> usize {
    STORE_HEADER_SIZE
        + read_u32(header, STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET) as usize
        + read_u32(header, STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET) as usize
}

/// Security header with one more hash table entry per digest.
pub fn append_hashes(header: &[u8], hashes: &[[u8; 32]]) -> Vec<u8> {
    let mut patched = header[..security_header_len(header)].to_vec();
    add_u32(
        &mut patched,
        SECURITY_HASH_TABLE_SIZE_OFFSET,
        hashes.len() * HASH_ENTRY_SIZE,
    );
    patched.extend(hashes.iter().flatten());
    patched
}

/// Store header with a single-chunk write descriptor per chunk index.
///
/// Flash-only count and length both grow by one per descriptor.
pub fn append_write_descriptors(header: &[u8], chunk_indexes: &[u32]) -> Vec<u8> {
    let mut patched = header[..store_header_len(header)].to_vec();
    let count = chunk_indexes.len();

    add_u32(&mut patched, STORE_WRITE_DESCRIPTOR_COUNT_OFFSET, count);
    add_u32(
        &mut patched,
        STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET,
        count * WRITE_DESCRIPTOR_SIZE,
    );
    add_u32(&mut patched, STORE_FLASH_ONLY_COUNT_OFFSET, count);
    add_u32(&mut patched, STORE_FLASH_ONLY_LENGTH_OFFSET, count);

    for chunk_index in chunk_indexes {
        // Location count, chunk count, disk access method (from start), chunk index
        patched.extend_from_slice(&1u32.to_le_bytes());
        patched.extend_from_slice(&1u32.to_le_bytes());
        patched.extend_from_slice(&0u32.to_le_bytes());
        patched.extend_from_slice(&chunk_index.to_le_bytes());
    }

    patched
}

#[derive(Debug, Clone)]
pub struct FfuImage {
    chunk_size: usize,
    firmware_version: String,
    security_header: Vec<u8>,
    image_header: Vec<u8>,
    store_header: Vec<u8>,
    legitimate_chunk: Option<Vec<u8>>,
}

impl FfuImage {
    pub fn new(
        chunk_size: usize,
        firmware_version: impl Into<String>,
        security_header: Vec<u8>,
        image_header: Vec<u8>,
        store_header: Vec<u8>,
    ) -> Result<Self, FfuError> {
        if chunk_size == 0 || chunk_size % PAGE_SIZE != 0 {
            return Err(FfuError::InvalidChunkSize(chunk_size));
        }

        for (section, fixed, header, describe) in [
            (
                "Security",
                SECURITY_HEADER_SIZE,
                &security_header,
                security_header_len as fn(&[u8]) -> usize,
            ),
            ("Store", STORE_HEADER_SIZE, &store_header, store_header_len),
        ] {
            if header.len() < fixed {
                return Err(FfuError::Truncated {
                    section,
                    expected: fixed,
                    actual: header.len(),
                });
            }

            let expected = describe(header);
            if header.len() < expected {
                return Err(FfuError::Truncated {
                    section,
                    expected,
                    actual: header.len(),
                });
            }
        }

        for (section, len) in [
            ("Security", security_header_len(&security_header)),
            ("Image", image_header.len()),
            ("Store", store_header_len(&store_header)),
        ] {
            if len < PAGE_SIZE {
                return Err(FfuError::SectionTooSmall { section, len });
            }
        }

        Ok(Self {
            chunk_size,
            firmware_version: firmware_version.into(),
            security_header,
            image_header,
            store_header,
            legitimate_chunk: None,
        })
    }

    /// First payload chunk of the image, sent unmodified during the
    /// legitimate flash. A zeroed chunk is sent when unset.
    pub fn with_legitimate_chunk(mut self, chunk: Vec<u8>) -> Self {
        self.legitimate_chunk = Some(chunk);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn security_header(&self) -> &[u8] {
        &self.security_header[..security_header_len(&self.security_header)]
    }

    pub fn image_header(&self) -> &[u8] {
        &self.image_header
    }

    pub fn store_header(&self) -> &[u8] {
        &self.store_header[..store_header_len(&self.store_header)]
    }

    pub fn platform_id(&self) -> String {
        let end = STORE_PLATFORM_ID_OFFSET + STORE_PLATFORM_ID_LEN;
        self.store_header[STORE_PLATFORM_ID_OFFSET..end]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect()
    }

    pub fn legitimate_chunk(&self) -> Vec<u8> {
        let mut chunk = self
            .legitimate_chunk
            .clone()
            .unwrap_or_else(|| vec![0u8; self.chunk_size]);
        chunk.resize(self.chunk_size, 0);
        chunk
    }

    /// Security, image and store headers, each padded to a whole chunk.
    pub fn combined_header(&self) -> Vec<u8> {
        let mut combined = Vec::new();

        for section in [
            self.security_header(),
            self.image_header(),
            self.store_header(),
        ] {
            combined.extend_from_slice(section);
            combined.resize(combined.len().next_multiple_of(self.chunk_size), 0);
        }

        combined
    }
}
