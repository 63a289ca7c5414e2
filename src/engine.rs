//! The custom flash state machine.
//!
//! Every attempt replays what the flash app allocates on its heap, parks an
//! undersized header of `gap_fill` bytes, then uploads a crafted header that
//! runs from the upload buffer over that gap into the phone's own copies of
//! the security and store headers. The copies come out with extra hash table
//! entries and write descriptors for the chunks we inject, so the flash app
//! accepts them as part of the signed image.

use std::{
    collections::HashMap,
    io::Cursor,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::{
    error::{AttemptOutcome, FlashError},
    ffu::{self, FfuImage, HASH_ENTRY_SIZE, WRITE_DESCRIPTOR_SIZE},
    flash::{Chunk, ChunkQueue, FlashPart},
    gpt::GptTable,
    heap::{AllocationId, HeapError, PAGE_SIZE, PoolSizeMode, UefiHeap, round_up_to_page},
    lumia,
    profile::{FlashProfile, ProfileCache, ProfileKey},
    progress::{FlashEvent, FlashState, NoProgress, ProgressObserver},
    search::{ExploitParameters, GapFillSearch, estimate_gap_fill, maximum_gap_fill},
    transport::{
        DeviceNotifier, DeviceSession, FlashAppState, FlashOptions, FlashTransport, TransportError,
    },
};

pub const ARRIVAL_TIMEOUT: Duration = Duration::from_secs(40);

/// Bytes actually sent with the undersized header.
const UNDERSIZED_HEADER_LEN: usize = 0x200;

/// Transfer buffers the flash app sets up for asynchronous payload writes.
const ASYNC_BUFFER_COUNT: usize = 2;
/// Buffers some firmware keeps for backing up partitions before flashing.
const BACKUP_BUFFER_COUNT: usize = 1;

/// Everything the engine needs from its surroundings.
#[derive(Clone)]
pub struct FlashContext {
    pub profiles: Arc<ProfileCache>,
    /// Size of the flash app image, the base of the gap fill estimate.
    pub flash_app_size: usize,
    /// Widens the gap fill search to four times the estimate.
    pub experimental: bool,
}

/// Changes to the partition table flashed along with the payload.
#[derive(Debug, Clone, Default)]
pub enum PartitionEdit {
    #[default]
    None,
    /// Make sure the NV backup exists for an unlocked bootloader.
    Unlock,
    /// Undo what unlocking did to the partition table.
    Relock,
    /// Apply a partition layout manifest, sizes taken from the images to flash.
    MergeLayout {
        xml: String,
        sizes: HashMap<String, u64>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CustomFlashOptions {
    /// Crash the phone into emergency download mode at the end instead of
    /// letting the flash app persist its completion flags.
    pub skip_persistent_flags: bool,
    pub pool_size_mode: PoolSizeMode,
    pub partition_edit: PartitionEdit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub attempts: usize,
    pub phases: usize,
    pub chunks_written: usize,
    pub profile: FlashProfile,
    pub partition_table_changed: bool,
}

/// Why a phase stopped early.
enum Interrupted {
    /// Nothing was written yet, try the next parameters.
    Attempt(String),
    Fatal(FlashError),
}

impl From<FlashError> for Interrupted {
    fn from(value: FlashError) -> Self {
        Interrupted::Fatal(value)
    }
}

impl From<HeapError> for Interrupted {
    fn from(value: HeapError) -> Self {
        Interrupted::Fatal(value.into())
    }
}

impl From<std::io::Error> for Interrupted {
    fn from(value: std::io::Error) -> Self {
        Interrupted::Fatal(value.into())
    }
}

fn interrupted(chunks_written: usize, why: TransportError) -> Interrupted {
    if chunks_written == 0 {
        Interrupted::Attempt(why.to_string())
    } else {
        Interrupted::Fatal(FlashError::AbortFlash {
            chunks_written,
            reason: why.to_string(),
        })
    }
}

/// The flash app's copies of the image headers.
struct HeaderAllocations {
    security: AllocationId,
    image: Option<AllocationId>,
    store: AllocationId,
}

impl HeaderAllocations {
    fn replay(
        heap: &mut UefiHeap,
        image: &FfuImage,
        params: &ExploitParameters,
    ) -> Result<Self, FlashError> {
        let security = heap.allocate_pool(image.security_header().len())?;
        heap.write(security, 0, image.security_header())?;

        let image_header = if params.assume_image_header_falls_in_gap {
            None
        } else {
            let id = heap.allocate_pool(image.image_header().len())?;
            heap.write(id, 0, image.image_header())?;
            Some(id)
        };

        let store = heap.allocate_pool(image.store_header().len())?;
        heap.write(store, 0, image.store_header())?;

        Ok(Self {
            security,
            image: image_header,
            store,
        })
    }

    fn release(self, heap: &mut UefiHeap) -> Result<(), FlashError> {
        heap.free_pool(self.security)?;
        if let Some(image) = self.image {
            heap.free_pool(image)?;
        }
        heap.free_pool(self.store)?;
        Ok(())
    }

    fn ids(&self) -> impl Iterator<Item = AllocationId> {
        [Some(self.security), self.image, Some(self.store)]
            .into_iter()
            .flatten()
    }
}

/// Heap state after the last phase, needed for the hard exit.
struct FinishedAttempt {
    phases: usize,
    heap: UefiHeap,
    security: AllocationId,
    store: AllocationId,
    crafted: Range<usize>,
}

pub struct CustomFlasher<N> {
    context: FlashContext,
    notifier: N,
    observer: Box<dyn ProgressObserver>,
    cancel: Arc<AtomicBool>,
}

impl<N: DeviceNotifier> CustomFlasher<N> {
    pub fn new(context: FlashContext, notifier: N) -> Self {
        Self {
            context,
            notifier,
            observer: Box::new(NoProgress),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn set_observer(&mut self, observer: impl ProgressObserver + 'static) {
        self.observer = Box::new(observer);
    }

    /// Setting the flag stops the operation before its next attempt.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    fn set_state(&self, state: FlashState) {
        tracing::debug!("Custom flash state: {state:?}");
        self.observer.publish(FlashEvent::State(state));
    }

    fn set_status(&self, text: impl Into<String>, sub_text: Option<&str>) {
        self.observer.publish(FlashEvent::Status {
            text: text.into(),
            sub_text: sub_text.map(str::to_string),
        });
    }

    /// Writes `parts` to the phone, finding working exploit parameters on the
    /// way if none are stored for it.
    pub fn flash(
        &mut self,
        image: &FfuImage,
        parts: Vec<FlashPart>,
        options: &CustomFlashOptions,
    ) -> Result<FlashReport, FlashError> {
        let result = self.run(image, parts, options);

        match &result {
            Ok(report) => {
                tracing::info!(
                    "Custom flash succeeded after {} attempt(s) in {} phase(s)",
                    report.attempts,
                    report.phases
                );
                self.set_state(FlashState::Succeeded);
            }
            Err(why) => {
                tracing::error!("Custom flash failed: {why}");
                self.set_status(why.to_string(), why.remediation());
                self.set_state(FlashState::Abandoned);
            }
        }

        result
    }

    fn run(
        &mut self,
        image: &FfuImage,
        mut parts: Vec<FlashPart>,
        options: &CustomFlashOptions,
    ) -> Result<FlashReport, FlashError> {
        self.set_state(FlashState::Initializing);
        self.set_status("Waiting for phone", None);

        let Some(session) = self.notifier.wait_for_arrival(Some(ARRIVAL_TIMEOUT))? else {
            return Err(FlashError::TransportDisconnected(format!(
                "no phone arrived within {} seconds",
                ARRIVAL_TIMEOUT.as_secs()
            )));
        };
        let mut transport = Self::enter_flash_app(session)?;

        let mut info = transport.read_phone_info()?;
        if info.app_state == FlashAppState::HeaderPending {
            self.set_state(FlashState::ResetAndRecover);
            transport = self.recover(transport)?;
            info = transport.read_phone_info()?;
        }

        if !info.supports_v2() {
            return Err(FlashError::DeviceProtocolRejected(format!(
                "flash protocol {} has no partial header uploads",
                info.protocol_version_major
            )));
        }

        tracing::info!(
            "Phone {} on firmware {} (protocol {})",
            info.platform_id,
            info.firmware_version,
            info.protocol_version_major
        );

        let chunk_size = image.chunk_size();
        let gpt_chunk = transport.read_gpt_chunk(chunk_size)?;
        let mut gpt = GptTable::parse(&gpt_chunk)?;
        let partition_table_changed =
            prepare_partition_table(&mut gpt, &mut parts, &options.partition_edit)?;
        let gpt_chunk = gpt.rebuild()?;

        let mut queue = ChunkQueue::new(
            std::iter::once(
                FlashPart::new(0, Cursor::new(gpt_chunk)).with_progress_text("Partition table"),
            )
            .chain(parts)
            .collect(),
            chunk_size,
        )?;

        let key = ProfileKey::new(
            info.platform_id.clone(),
            info.firmware_version.clone(),
            image.firmware_version(),
        );
        let cached = self.context.profiles.get(&key);
        let estimate = estimate_gap_fill(self.context.flash_app_size);

        let initial = match &cached {
            Some(profile) => {
                tracing::info!("Using stored flashing profile for {key}");
                ExploitParameters::from_profile(profile)
            }
            None => {
                self.set_state(FlashState::ScanningForProfile);
                ExploitParameters {
                    gap_fill: estimate,
                    header_size: round_up_to_page(image.combined_header().len()),
                    assume_image_header_falls_in_gap: false,
                    allocate_async_buffers_on_phone: false,
                    allocate_backup_buffers_on_phone: false,
                }
            }
        };

        let mut search = GapFillSearch::new(
            initial,
            chunk_size,
            maximum_gap_fill(estimate, self.context.experimental),
        );
        tracing::debug!(
            "Searching up to {} parameter sets from {initial:?}",
            search.maximum_attempts()
        );

        while let Some(params) = search.next() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(FlashError::Cancelled);
            }

            let attempt = search.attempts_made();
            tracing::debug!("Attempt {attempt} with {params:?}");

            queue.rewind()?;
            match self.attempt(&mut transport, image, &mut queue, &params, options)? {
                AttemptOutcome::Succeeded(finished) => {
                    let profile = params.to_profile();
                    self.context.profiles.set(key, profile);

                    let phases = finished.phases;
                    if options.skip_persistent_flags {
                        self.hard_exit(&mut transport, finished, queue.total_chunks())?;
                    } else if let Err(why) = transport.reset_phone() {
                        tracing::warn!("Failed to reset phone after flashing: {why}");
                    }

                    return Ok(FlashReport {
                        attempts: attempt,
                        phases,
                        chunks_written: queue.total_chunks(),
                        profile,
                        partition_table_changed,
                    });
                }
                AttemptOutcome::Failed(reason) => {
                    tracing::info!("Attempt {attempt} failed: {reason}");
                    self.observer
                        .publish(FlashEvent::AttemptFailed { attempt, reason });
                    transport = self.recover(transport)?;
                }
            }
        }

        Err(FlashError::NoWorkingProfileFound {
            attempts: search.attempts_made(),
        })
    }

    fn enter_flash_app(session: DeviceSession<N::Transport>) -> Result<N::Transport, FlashError> {
        let mode = session.mode_name();
        session
            .into_flash_app()?
            .ok_or(FlashError::WrongMode(mode))
    }

    /// Resets the phone and waits for it to come back, first for
    /// [`ARRIVAL_TIMEOUT`], then for as long as the operator needs.
    fn recover(&mut self, mut transport: N::Transport) -> Result<N::Transport, FlashError> {
        if let Err(why) = transport.reset_phone() {
            tracing::debug!("Reset failed, phone may already be rebooting: {why}");
        }
        drop(transport);

        self.set_status("Waiting for phone to reconnect", None);

        let session = match self.notifier.wait_for_arrival(Some(ARRIVAL_TIMEOUT))? {
            Some(session) => session,
            None => {
                tracing::warn!("Phone did not return within {ARRIVAL_TIMEOUT:?}");
                self.observer.publish(FlashEvent::ManualResetRequired {
                    message: "Reset the phone manually".to_string(),
                    sub_message:
                        "Hold the power button until the phone vibrates. Flashing continues once it reconnects."
                            .to_string(),
                });

                loop {
                    if let Some(session) = self.notifier.wait_for_arrival(None)? {
                        break session;
                    }
                }
            }
        };

        Self::enter_flash_app(session)
    }

    fn attempt(
        &self,
        transport: &mut N::Transport,
        image: &FfuImage,
        queue: &mut ChunkQueue,
        params: &ExploitParameters,
        options: &CustomFlashOptions,
    ) -> Result<AttemptOutcome<FinishedAttempt>, FlashError> {
        let mut heap = UefiHeap::new(options.pool_size_mode);
        let combined = image.combined_header();
        let mut chunks_written = 0;
        let mut phase = 0;

        loop {
            let result = self.run_phase(
                transport,
                &mut heap,
                image,
                &combined,
                queue,
                params,
                phase,
                &mut chunks_written,
            );

            let (security, store, crafted) = match result {
                Ok(layout) => layout,
                Err(Interrupted::Attempt(reason)) => return Ok(AttemptOutcome::Failed(reason)),
                Err(Interrupted::Fatal(why)) => return Err(why),
            };

            phase += 1;

            if queue.remaining() == 0 {
                return Ok(AttemptOutcome::Succeeded(FinishedAttempt {
                    phases: phase,
                    heap,
                    security,
                    store,
                    crafted,
                }));
            }

            tracing::debug!(
                "Headers full after {} chunks, starting phase {}",
                queue.position(),
                phase + 1
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &self,
        transport: &mut N::Transport,
        heap: &mut UefiHeap,
        image: &FfuImage,
        combined: &[u8],
        queue: &mut ChunkQueue,
        params: &ExploitParameters,
        phase: usize,
        chunks_written: &mut usize,
    ) -> Result<(AllocationId, AllocationId, Range<usize>), Interrupted> {
        let chunk_size = image.chunk_size();
        let total = queue.total_chunks();

        heap.reset(heap.mode());

        // What the flash app allocated before we got to talk to it
        if params.allocate_async_buffers_on_phone {
            for _ in 0..ASYNC_BUFFER_COUNT {
                heap.allocate_pool(chunk_size)?;
            }
        }
        if params.allocate_backup_buffers_on_phone {
            for _ in 0..BACKUP_BUFFER_COUNT {
                heap.allocate_pool(chunk_size)?;
            }
        }
        let headers = HeaderAllocations::replay(heap, image, params)?;

        // Undersized header, stays pending and holds the gap
        heap.allocate_pool(params.gap_fill)?;
        transport
            .send_header_v2(
                params.gap_fill as u32,
                0,
                &combined[..UNDERSIZED_HEADER_LEN.min(combined.len())],
                FlashOptions::empty(),
            )
            .map_err(|why| interrupted(*chunks_written, why))?;

        // The real header makes the flash app drop and re-import its copies
        transport
            .send_header_v1(combined, FlashOptions::SKIP_WRITE)
            .map_err(|why| interrupted(*chunks_written, why))?;
        headers.release(heap)?;
        let headers = HeaderAllocations::replay(heap, image, params)?;

        if phase == 0 {
            transport
                .send_payload(&image.legitimate_chunk(), 0)
                .map_err(|why| interrupted(*chunks_written, why))?;
        }

        let security = heap.allocation(headers.security)?;
        let store = heap.allocation(headers.store)?;
        let hash_room =
            (security.content_capacity() - image.security_header().len()) / HASH_ENTRY_SIZE;
        let descriptor_room =
            (store.content_capacity() - image.store_header().len()) / WRITE_DESCRIPTOR_SIZE;
        let count = hash_room.min(descriptor_room).min(queue.remaining());

        if count == 0 {
            return Err(FlashError::InvalidLayout(
                "image headers have no room for additional chunks".to_string(),
            )
            .into());
        }

        let phase_start = queue.position();
        let chunks = queue.next_chunks(count)?;
        self.patch_headers(heap, image, &headers, &chunks)?;

        let upload = heap.allocate_pool(params.header_size)?;
        let crafted_start = heap.allocation(upload)?.content.start;
        let crafted_end = headers
            .ids()
            .map(|id| heap.allocation(id).map(|allocation| allocation.total.end))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .max()
            .unwrap_or(crafted_start);

        if crafted_start >= crafted_end {
            return Err(FlashError::InvalidLayout(format!(
                "upload buffer at {crafted_start:#X} lies above the header copies ending at {crafted_end:#X}"
            ))
            .into());
        }

        let crafted = crafted_start..crafted_end;
        tracing::debug!(
            "Phase {}: {count} chunks, crafted header {:#X} bytes",
            phase + 1,
            crafted.len()
        );
        self.set_status(
            format!("Flashing phase {}", phase + 1),
            queue.progress_text(phase_start),
        );

        stream_crafted_header(transport, heap, crafted.clone(), |_| true)
            .map_err(|why| interrupted(*chunks_written, why))?;

        for (idx, chunk) in chunks.iter().enumerate() {
            let done = phase_start + idx + 1;
            let percent = (done * 100 / total) as u8;

            transport
                .send_payload(&chunk.data, percent)
                .map_err(|why| interrupted(*chunks_written, why))?;

            if *chunks_written == 0 {
                self.set_state(FlashState::Flashing);
            }
            *chunks_written += 1;
            self.observer.publish(FlashEvent::Progress { done, total });
        }

        Ok((headers.security, headers.store, crafted))
    }

    fn patch_headers(
        &self,
        heap: &mut UefiHeap,
        image: &FfuImage,
        headers: &HeaderAllocations,
        chunks: &[Chunk],
    ) -> Result<(), FlashError> {
        let hashes = chunks
            .par_iter()
            .map(|chunk| Sha256::digest(&chunk.data).into())
            .collect::<Vec<[u8; 32]>>();
        let indexes = chunks.iter().map(|chunk| chunk.index).collect::<Vec<_>>();

        let security = ffu::append_hashes(image.security_header(), &hashes);
        heap.resize_content(headers.security, security.len())?;
        heap.write(headers.security, 0, &security)?;

        let store = ffu::append_write_descriptors(image.store_header(), &indexes);
        heap.resize_content(headers.store, store.len())?;
        heap.write(headers.store, 0, &store)?;

        Ok(())
    }

    /// Zeroes the declared pool sizes of both header copies and resends the
    /// slices holding them. Freeing them faults the flash app on its way out.
    fn hard_exit(
        &self,
        transport: &mut N::Transport,
        mut finished: FinishedAttempt,
        chunks_written: usize,
    ) -> Result<(), FlashError> {
        let offsets = [
            finished.heap.zero_declared_size(finished.security)?,
            finished.heap.zero_declared_size(finished.store)?,
        ];

        tracing::info!("Corrupting header pool sizes at {offsets:#X?}");

        stream_crafted_header(transport, &finished.heap, finished.crafted.clone(), |slice| {
            offsets.iter().any(|offset| slice.contains(offset))
        })
        .map_err(|why| FlashError::AbortFlash {
            chunks_written,
            reason: why.to_string(),
        })?;

        if let Err(why) = transport.reset_phone() {
            tracing::debug!("Reset after hard exit failed, phone is likely crashing already: {why}");
        }

        Ok(())
    }
}

/// Sends `crafted` in page slices, each declaring a total larger than
/// everything sent so far so the flash app keeps waiting for more.
fn stream_crafted_header<T: FlashTransport>(
    transport: &mut T,
    heap: &UefiHeap,
    crafted: Range<usize>,
    mut include: impl FnMut(&Range<usize>) -> bool,
) -> Result<(), TransportError> {
    let bytes = heap
        .region(crafted.clone())
        .map_err(|why| TransportError::Rejected(why.to_string()))?;

    for (idx, slice) in bytes.chunks(PAGE_SIZE).enumerate() {
        let offset = idx * PAGE_SIZE;
        let arena_range = crafted.start + offset..crafted.start + offset + slice.len();
        if !include(&arena_range) {
            continue;
        }

        let declared = offset + slice.len() + PAGE_SIZE;
        transport.send_header_v2(
            declared as u32,
            offset as u32,
            slice,
            FlashOptions::empty(),
        )?;
    }

    Ok(())
}

/// Applies `edit` and marks an unlocked EFIESP image, returns whether the
/// table changed.
fn prepare_partition_table(
    gpt: &mut GptTable,
    parts: &mut [FlashPart],
    edit: &PartitionEdit,
) -> Result<bool, FlashError> {
    let mut changed = match edit {
        PartitionEdit::None => false,
        PartitionEdit::Unlock => lumia::ensure_nv_backup(gpt)?,
        PartitionEdit::Relock => lumia::relock_partition_table(gpt)?,
        PartitionEdit::MergeLayout { xml, sizes } => {
            gpt.merge_partition_layout(xml, &mut sizes.clone())?
        }
    };

    if !matches!(edit, PartitionEdit::Relock) {
        changed |= lumia::mark_unlocked_efiesp(gpt, parts)?;
    }

    Ok(changed)
}
