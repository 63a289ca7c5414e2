//! In-process phone for dry runs and tests.
//!
//! It only accepts injected chunks once the undersized header declared the
//! configured gap fill. Every chunk has to match the next hash table entry
//! and write descriptor the crafted header of its phase added to the header
//! copies.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use gpt_disk_types::GptPartitionType;
use sha2::{Digest, Sha256};

use crate::{
    ffu::{
        FfuError, FfuImage, HASH_ENTRY_SIZE, SECURITY_CATALOG_SIZE_OFFSET, SECURITY_HEADER_SIZE,
        SECURITY_HASH_TABLE_SIZE_OFFSET, STORE_FLASH_ONLY_COUNT_OFFSET, STORE_HEADER_SIZE,
        STORE_PLATFORM_ID_OFFSET, STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET,
        STORE_WRITE_DESCRIPTOR_COUNT_OFFSET, STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET,
        WRITE_DESCRIPTOR_SIZE, read_u32, security_header_len, store_header_len,
    },
    gpt::{GptError, GptTable, Partition},
    heap::PAGE_SIZE,
    transport::{
        DeviceNotifier, DeviceSession, FlashAppState, FlashOptions, FlashTransport, PhoneInfo,
        TransportError,
    },
};

pub const STOCK_PLATFORM_ID: &str = "Microsoft.MSM8994.P6211.1.1";
pub const STOCK_FIRMWARE_VERSION: &str = "01078.00053.16236.35035";
const STOCK_DISK_SECTORS: u64 = 0x10_0000;
/// Smallest validate descriptor area, grown until the store header fills a
/// page.
const STOCK_VALIDATE_DESCRIPTOR_LEN: usize = 0x0C;

/// Partition table of a stock phone: EFIESP at 0x800, UEFI_BS_NV at 0x1000,
/// MainOS at 0x2000 and Data at 0x8000.
pub fn stock_partition_table(chunk_len: usize) -> Result<GptTable, GptError> {
    let mut table = GptTable::format(STOCK_DISK_SECTORS, chunk_len)?;
    let basic = GptPartitionType::BASIC_DATA.0;

    for (name, first_sector, last_sector) in [
        ("EFIESP", 0x800, 0xFFF),
        ("UEFI_BS_NV", 0x1000, 0x13FF),
        ("MainOS", 0x2000, 0x7FFF),
        ("Data", 0x8000, 0xFFFF),
    ] {
        table.add_partition(Partition::new(name, basic, first_sector, last_sector))?;
    }

    table.rebuild()?;
    Ok(table)
}

/// FFU headers with a catalog of `catalog_size` bytes, one hash entry and
/// `write_descriptors` write descriptors. The store header is at least a page
/// long, like the ones real images carry.
pub fn stock_ffu_image(
    chunk_size: usize,
    catalog_size: usize,
    write_descriptors: usize,
) -> Result<FfuImage, FfuError> {
    let mut security = vec![0u8; SECURITY_HEADER_SIZE + catalog_size + HASH_ENTRY_SIZE];
    security[0..4].copy_from_slice(&(SECURITY_HEADER_SIZE as u32).to_le_bytes());
    security[4..16].copy_from_slice(b"SignedImage ");
    security[0x10..0x14].copy_from_slice(&((chunk_size / 1024) as u32).to_le_bytes());
    security[SECURITY_CATALOG_SIZE_OFFSET..SECURITY_CATALOG_SIZE_OFFSET + 4]
        .copy_from_slice(&(catalog_size as u32).to_le_bytes());
    security[SECURITY_HASH_TABLE_SIZE_OFFSET..SECURITY_HASH_TABLE_SIZE_OFFSET + 4]
        .copy_from_slice(&(HASH_ENTRY_SIZE as u32).to_le_bytes());

    let write_len = write_descriptors * WRITE_DESCRIPTOR_SIZE;
    let validate_len = STOCK_VALIDATE_DESCRIPTOR_LEN
        .max(PAGE_SIZE.saturating_sub(STORE_HEADER_SIZE + write_len));
    let mut store = vec![0u8; STORE_HEADER_SIZE + validate_len + write_len];
    store[STORE_PLATFORM_ID_OFFSET..STORE_PLATFORM_ID_OFFSET + STOCK_PLATFORM_ID.len()]
        .copy_from_slice(STOCK_PLATFORM_ID.as_bytes());
    store[0xCC..0xD0].copy_from_slice(&(chunk_size as u32).to_le_bytes());
    store[STORE_WRITE_DESCRIPTOR_COUNT_OFFSET..STORE_WRITE_DESCRIPTOR_COUNT_OFFSET + 4]
        .copy_from_slice(&(write_descriptors as u32).to_le_bytes());
    store[STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET..STORE_WRITE_DESCRIPTOR_LENGTH_OFFSET + 4]
        .copy_from_slice(&(write_len as u32).to_le_bytes());
    store[STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET..STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET + 4]
        .copy_from_slice(&(validate_len as u32).to_le_bytes());

    let image = vec![0x11u8; 0x1200];

    FfuImage::new(chunk_size, STOCK_FIRMWARE_VERSION, security, image, store)
}

#[derive(Debug, Clone)]
pub struct EmulatedPhoneConfig {
    pub platform_id: String,
    pub firmware_version: String,
    pub protocol_version_major: u8,
    pub chunk_size: usize,
    /// Undersized header size that lines the heap up.
    pub target_gap_fill: usize,
    pub gpt_chunk: Vec<u8>,
    /// Phone still holds a header from an interrupted session.
    pub header_pending: bool,
    /// Number of resets the phone does not come back from on its own.
    pub resets_needing_manual_recovery: usize,
    /// Phone shows up in the boot manager and has to be switched.
    pub arrive_in_boot_manager: bool,
    /// Connection drops once, on the next injected chunk after this many were
    /// accepted.
    pub disconnect_after_chunks: Option<usize>,
    /// Connection drops once, on the undersized header that would be accepted
    /// with this index.
    pub disconnect_at_undersized_header: Option<usize>,
}

impl EmulatedPhoneConfig {
    /// Stock phone in the flash app that accepts the crafted header once the
    /// gap fill matches `target_gap_fill`.
    pub fn new(chunk_size: usize, target_gap_fill: usize, gpt_chunk: Vec<u8>) -> Self {
        Self {
            platform_id: STOCK_PLATFORM_ID.to_string(),
            firmware_version: STOCK_FIRMWARE_VERSION.to_string(),
            protocol_version_major: 2,
            chunk_size,
            target_gap_fill,
            gpt_chunk,
            header_pending: false,
            resets_needing_manual_recovery: 0,
            arrive_in_boot_manager: false,
            disconnect_after_chunks: None,
            disconnect_at_undersized_header: None,
        }
    }
}

/// What the phone saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmulatedLog {
    pub undersized_headers: Vec<u32>,
    pub legitimate_chunks: usize,
    pub crafted_headers: usize,
    pub phases: usize,
    pub resets: usize,
    pub arrivals: usize,
    pub manual_recoveries: usize,
    /// Injected chunks in the order they were accepted.
    pub chunks: Vec<Vec<u8>>,
    /// Chunk index of the write descriptor each injected chunk matched.
    pub chunk_indexes: Vec<u32>,
    /// Highest declared size of each crafted header upload.
    pub crafted_sizes: Vec<u32>,
    pub rewritten_slices: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Undersized,
    HeaderImported,
    Crafting,
    Streaming,
    Faulted,
}

struct PhoneState {
    config: EmulatedPhoneConfig,
    log: EmulatedLog,
    stage: Stage,
    crafted: Vec<u8>,
    crafted_declared: u32,
    /// Hash and chunk index of every chunk the current phase may write.
    expected: Vec<([u8; 32], u32)>,
    /// Injected chunks accepted before the current phase.
    phase_start: usize,
    needs_manual_reset: bool,
}

impl PhoneState {
    fn fault(&mut self, reason: impl Into<String>) -> TransportError {
        self.stage = Stage::Faulted;
        TransportError::Rejected(reason.into())
    }

    fn disconnect(&mut self) -> TransportError {
        tracing::debug!("Emulated phone drops the connection");
        self.stage = Stage::Faulted;
        TransportError::Disconnected
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Hashes and chunk indexes the crafted header appended to the header copies
/// it overwrote, in the order the chunks have to arrive.
///
/// The copies are found by the security signature and by the platform id of
/// the store header. The flash-only count says how many entries at the end of
/// both tables were added.
fn injected_entries(crafted: &[u8], platform_id: &str) -> Option<Vec<([u8; 32], u32)>> {
    let security = find(crafted, b"SignedImage ")?.checked_sub(4)?;
    let security = crafted.get(security..)?;
    let store = find(crafted, platform_id.as_bytes())?.checked_sub(STORE_PLATFORM_ID_OFFSET)?;
    let store = crafted.get(store..)?;
    if security.len() < SECURITY_HEADER_SIZE || store.len() < STORE_HEADER_SIZE {
        return None;
    }

    let hash_table_start =
        SECURITY_HEADER_SIZE + read_u32(security, SECURITY_CATALOG_SIZE_OFFSET) as usize;
    let hashes = security
        .get(hash_table_start..security_header_len(security))?
        .chunks_exact(HASH_ENTRY_SIZE);

    let descriptors_start =
        STORE_HEADER_SIZE + read_u32(store, STORE_VALIDATE_DESCRIPTOR_LENGTH_OFFSET) as usize;
    let descriptors = store
        .get(descriptors_start..store_header_len(store))?
        .chunks_exact(WRITE_DESCRIPTOR_SIZE);

    let injected = read_u32(store, STORE_FLASH_ONLY_COUNT_OFFSET) as usize;
    let skip_hashes = hashes.len().checked_sub(injected)?;
    let skip_descriptors = descriptors.len().checked_sub(injected)?;

    hashes
        .skip(skip_hashes)
        .zip(descriptors.skip(skip_descriptors))
        .map(|(hash, descriptor)| {
            // Single location, single chunk, written from the start of the disk
            let fields = [0, 4, 8, 12].map(|offset| read_u32(descriptor, offset));
            if fields[..3] != [1, 1, 0] {
                return None;
            }
            Some((hash.try_into().ok()?, fields[3]))
        })
        .collect()
}

/// Handle on an emulated phone, shared by its notifier and transports.
#[derive(Clone)]
pub struct EmulatedPhone {
    state: Arc<Mutex<PhoneState>>,
}

impl EmulatedPhone {
    pub fn new(config: EmulatedPhoneConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(PhoneState {
                config,
                log: EmulatedLog::default(),
                stage: Stage::Idle,
                crafted: Vec::new(),
                crafted_declared: 0,
                expected: Vec::new(),
                phase_start: 0,
                needs_manual_reset: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PhoneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log(&self) -> EmulatedLog {
        self.lock().log.clone()
    }

    pub fn notifier(&self) -> EmulatedNotifier {
        EmulatedNotifier {
            phone: self.clone(),
        }
    }
}

pub struct EmulatedNotifier {
    phone: EmulatedPhone,
}

impl EmulatedNotifier {
    pub fn phone(&self) -> &EmulatedPhone {
        &self.phone
    }
}

impl DeviceNotifier for EmulatedNotifier {
    type Transport = EmulatedTransport;

    fn wait_for_arrival(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceSession<Self::Transport>>, TransportError> {
        let mut state = self.phone.lock();

        if state.needs_manual_reset {
            if timeout.is_some() {
                return Ok(None);
            }
            state.needs_manual_reset = false;
            state.log.manual_recoveries += 1;
        }

        state.log.arrivals += 1;
        let transport = EmulatedTransport {
            phone: self.phone.clone(),
        };

        Ok(Some(if state.config.arrive_in_boot_manager {
            DeviceSession::BootManager(transport)
        } else {
            DeviceSession::FlashApp(transport)
        }))
    }
}

pub struct EmulatedTransport {
    phone: EmulatedPhone,
}

impl FlashTransport for EmulatedTransport {
    fn read_phone_info(&mut self) -> Result<PhoneInfo, TransportError> {
        let state = self.phone.lock();
        Ok(PhoneInfo {
            platform_id: state.config.platform_id.clone(),
            firmware_version: state.config.firmware_version.clone(),
            protocol_version_major: state.config.protocol_version_major,
            app_state: if state.config.header_pending {
                FlashAppState::HeaderPending
            } else {
                FlashAppState::Idle
            },
        })
    }

    fn read_gpt_chunk(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        let state = self.phone.lock();
        let mut chunk = state.config.gpt_chunk.clone();
        chunk.resize(size, 0);
        Ok(chunk)
    }

    fn send_header_v1(
        &mut self,
        header: &[u8],
        _options: FlashOptions,
    ) -> Result<(), TransportError> {
        let mut state = self.phone.lock();

        if header.len() % state.config.chunk_size != 0 {
            return Err(state.fault("header is not chunk aligned"));
        }

        let stage = state.stage;
        match stage {
            Stage::Undersized => {
                state.stage = Stage::HeaderImported;
                Ok(())
            }
            _ => Err(state.fault(format!("unexpected header while {stage:?}"))),
        }
    }

    fn send_header_v2(
        &mut self,
        declared_size: u32,
        offset: u32,
        data: &[u8],
        _options: FlashOptions,
    ) -> Result<(), TransportError> {
        let mut state = self.phone.lock();

        let stage = state.stage;
        match stage {
            Stage::Streaming if offset != 0 => {
                // Rewrite of an already uploaded crafted header
                let end = offset as usize + data.len();
                if end > state.crafted.len() || declared_size as usize <= end {
                    return Err(state.fault("header rewrite outside the crafted header"));
                }
                state.crafted[offset as usize..end].copy_from_slice(data);
                state.log.rewritten_slices += 1;
                Ok(())
            }
            Stage::Idle | Stage::Streaming => {
                if offset != 0 || data.len() >= declared_size as usize {
                    return Err(state.fault("expected an incomplete header"));
                }
                if state.config.disconnect_at_undersized_header
                    == Some(state.log.undersized_headers.len())
                {
                    state.config.disconnect_at_undersized_header = None;
                    return Err(state.disconnect());
                }
                state.log.undersized_headers.push(declared_size);
                state.stage = Stage::Undersized;
                Ok(())
            }
            Stage::HeaderImported | Stage::Crafting => {
                if stage == Stage::HeaderImported {
                    state.crafted.clear();
                    state.crafted_declared = 0;
                    state.log.crafted_headers += 1;
                }

                let expected = state.crafted.len();
                if offset as usize != expected {
                    return Err(state.fault(format!(
                        "header slice at {offset:#X}, expected {expected:#X}"
                    )));
                }

                if declared_size as usize <= offset as usize + data.len()
                    || declared_size <= state.crafted_declared
                {
                    return Err(state.fault("header upload would complete"));
                }

                state.crafted.extend_from_slice(data);
                state.crafted_declared = declared_size;
                state.stage = Stage::Crafting;
                Ok(())
            }
            Stage::Undersized | Stage::Faulted => {
                Err(state.fault(format!("unexpected header slice while {stage:?}")))
            }
        }
    }

    fn send_payload(&mut self, chunk: &[u8], _progress_percent: u8) -> Result<(), TransportError> {
        let mut state = self.phone.lock();

        if chunk.len() != state.config.chunk_size {
            return Err(state.fault(format!("payload of {:#X} bytes", chunk.len())));
        }

        let stage = state.stage;
        match stage {
            Stage::HeaderImported => {
                state.log.legitimate_chunks += 1;
                Ok(())
            }
            Stage::Crafting | Stage::Streaming => {
                if state.config.disconnect_after_chunks == Some(state.log.chunks.len()) {
                    state.config.disconnect_after_chunks = None;
                    return Err(state.disconnect());
                }

                if stage == Stage::Crafting {
                    let target = state.config.target_gap_fill as u32;
                    if state.log.undersized_headers.last() != Some(&target) {
                        return Err(state.fault("hash check failed"));
                    }
                    let Some(expected) =
                        injected_entries(&state.crafted, &state.config.platform_id)
                    else {
                        return Err(state.fault("crafted header holds no usable header copies"));
                    };
                    state.expected = expected;
                    state.phase_start = state.log.chunks.len();
                    state.log.phases += 1;
                    let declared = state.crafted_declared;
                    state.log.crafted_sizes.push(declared);
                }

                let position = state.log.chunks.len() - state.phase_start;
                let Some((hash, chunk_index)) = state.expected.get(position).copied() else {
                    return Err(state.fault("no write descriptor left for chunk"));
                };
                let digest: [u8; 32] = Sha256::digest(chunk).into();
                if digest != hash {
                    return Err(state.fault(format!(
                        "chunk hash does not match hash table entry for chunk {chunk_index:#X}"
                    )));
                }

                state.log.chunks.push(chunk.to_vec());
                state.log.chunk_indexes.push(chunk_index);
                state.stage = Stage::Streaming;
                Ok(())
            }
            _ => Err(state.fault(format!("unexpected payload while {stage:?}"))),
        }
    }

    fn reset_phone(&mut self) -> Result<(), TransportError> {
        let mut state = self.phone.lock();
        state.log.resets += 1;
        state.stage = Stage::Idle;
        state.config.header_pending = false;

        if state.config.resets_needing_manual_recovery > 0 {
            state.config.resets_needing_manual_recovery -= 1;
            state.needs_manual_reset = true;
        }

        Ok(())
    }

    fn switch_to_flash_app_context(&mut self) -> Result<(), TransportError> {
        let mut state = self.phone.lock();
        state.config.arrive_in_boot_manager = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffu::{append_hashes, append_write_descriptors};

    const CHUNK_SIZE: usize = 0x8000;

    /// Phone that took a crafted header holding the store copy followed by
    /// the security copy, both extended for `chunks`.
    fn crafted_phone(chunks: &[Vec<u8>], indexes: &[u32]) -> EmulatedTransport {
        let image = stock_ffu_image(CHUNK_SIZE, 0x1000, 4).unwrap();
        let config = EmulatedPhoneConfig::new(CHUNK_SIZE, 0x20000, Vec::new());
        let mut transport = EmulatedTransport {
            phone: EmulatedPhone::new(config),
        };

        let hashes = chunks
            .iter()
            .map(|chunk| Sha256::digest(chunk).into())
            .collect::<Vec<[u8; 32]>>();
        let mut crafted = vec![0u8; 0x100];
        crafted.extend(append_write_descriptors(image.store_header(), indexes));
        crafted.extend(append_hashes(image.security_header(), &hashes));

        let combined = image.combined_header();
        transport
            .send_header_v2(0x20000, 0, &combined[..0x200], FlashOptions::empty())
            .unwrap();
        transport
            .send_header_v1(&combined, FlashOptions::SKIP_WRITE)
            .unwrap();
        transport
            .send_header_v2(
                (crafted.len() + PAGE_SIZE) as u32,
                0,
                &crafted,
                FlashOptions::empty(),
            )
            .unwrap();
        transport
    }

    #[test]
    fn chunks_follow_appended_descriptors() {
        let chunks = vec![vec![0xAA; CHUNK_SIZE], vec![0xBB; CHUNK_SIZE]];
        let mut transport = crafted_phone(&chunks, &[0, 0x80]);

        transport.send_payload(&chunks[0], 50).unwrap();
        transport.send_payload(&chunks[1], 100).unwrap();

        let log = transport.phone.log();
        assert_eq!(log.chunk_indexes, [0, 0x80]);
        assert_eq!(log.phases, 1);
    }

    #[test]
    fn chunk_out_of_order_is_rejected() {
        let chunks = vec![vec![0xAA; CHUNK_SIZE], vec![0xBB; CHUNK_SIZE]];
        let mut transport = crafted_phone(&chunks, &[0, 0x80]);

        assert!(matches!(
            transport.send_payload(&chunks[1], 50),
            Err(TransportError::Rejected(_))
        ));
        assert!(transport.phone.log().chunks.is_empty());
    }

    #[test]
    fn chunk_past_the_appended_entries_is_rejected() {
        let chunks = vec![vec![0xAA; CHUNK_SIZE]];
        let mut transport = crafted_phone(&chunks, &[0]);

        transport.send_payload(&chunks[0], 50).unwrap();
        assert!(matches!(
            transport.send_payload(&chunks[0], 100),
            Err(TransportError::Rejected(_))
        ));
    }
}
