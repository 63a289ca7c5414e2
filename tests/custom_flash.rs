use std::{
    io::Cursor,
    sync::{Arc, atomic::Ordering, mpsc},
};

use lumia_customflash::{
    CustomFlashOptions, CustomFlasher, FlashContext, FlashError, FlashJob,
    emulated::{self, EmulatedNotifier, EmulatedPhone, EmulatedPhoneConfig},
    ffu::FfuImage,
    flash::FlashPart,
    gpt::GptTable,
    lumia::{self, IS_UNLOCKED, IS_UNLOCKED_SECTOR},
    profile::{ProfileCache, ProfileKey},
    progress::{FlashEvent, FlashState},
    search::GapFillSearch,
};

const CHUNK_SIZE: usize = 0x8000;
/// Start of MainOS in the stock partition table.
const MAINOS_SECTOR: u64 = 0x2000;

/// With no flash app size the search runs 0x20000, 0x18000, 0x28000, 0x10000,
/// 0x30000, 0x8000, 0x38000, 0x40000 for each flag combination.
const THIRD_GAP_FILL: usize = 0x28000;

fn stock_config(target_gap_fill: usize) -> EmulatedPhoneConfig {
    let gpt_chunk = emulated::stock_partition_table(CHUNK_SIZE)
        .and_then(|mut table| table.rebuild())
        .unwrap();
    EmulatedPhoneConfig::new(CHUNK_SIZE, target_gap_fill, gpt_chunk)
}

fn context(profiles: Arc<ProfileCache>) -> FlashContext {
    FlashContext {
        profiles,
        flash_app_size: 0,
        experimental: false,
    }
}

fn flasher(
    phone: &EmulatedPhone,
    profiles: Arc<ProfileCache>,
) -> (CustomFlasher<EmulatedNotifier>, mpsc::Receiver<FlashEvent>) {
    let (sender, events) = mpsc::channel();
    let flasher = CustomFlasher::new(context(profiles), phone.notifier()).with_observer(sender);
    (flasher, events)
}

fn payload(start_sector: u64, chunks: usize) -> FlashPart {
    let data = (0..chunks * CHUNK_SIZE)
        .map(|idx| (idx / CHUNK_SIZE) as u8 ^ (idx % 253) as u8)
        .collect::<Vec<_>>();
    FlashPart::new(start_sector, Cursor::new(data)).with_progress_text("MainOS")
}

fn stock_image() -> FfuImage {
    emulated::stock_ffu_image(CHUNK_SIZE, 0x1000, 4).unwrap()
}

fn stock_key() -> ProfileKey {
    ProfileKey::new(
        emulated::STOCK_PLATFORM_ID,
        emulated::STOCK_FIRMWARE_VERSION,
        emulated::STOCK_FIRMWARE_VERSION,
    )
}

#[test]
fn search_finds_gap_fill_after_failures() {
    let phone = EmulatedPhone::new(stock_config(THIRD_GAP_FILL));
    let profiles = Arc::new(ProfileCache::in_memory());
    let (mut flasher, events) = flasher(&phone, profiles.clone());

    let report = flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 3)], &CustomFlashOptions::default())
        .unwrap();

    assert_eq!(report.attempts, 3);
    assert_eq!(report.phases, 1);
    assert_eq!(report.chunks_written, 4);
    assert_eq!(report.profile.fill_size as usize, THIRD_GAP_FILL);
    assert_eq!(profiles.get(&stock_key()), Some(report.profile));

    let log = phone.log();
    assert_eq!(log.undersized_headers, [0x20000, 0x18000, 0x28000]);
    assert_eq!(log.chunks.len(), 4);
    // Two recoveries, then the reset at the end
    assert_eq!(log.resets, 3);

    let events = events.try_iter().collect::<Vec<_>>();
    let failures = events
        .iter()
        .filter(|event| matches!(event, FlashEvent::AttemptFailed { .. }))
        .count();
    assert_eq!(failures, 2);
    assert!(events.contains(&FlashEvent::State(FlashState::ScanningForProfile)));
    assert!(events.contains(&FlashEvent::Progress { done: 4, total: 4 }));
    assert_eq!(events.last(), Some(&FlashEvent::State(FlashState::Succeeded)));
}

#[test]
fn stored_profile_is_reused() {
    let profiles = Arc::new(ProfileCache::in_memory());

    let first = EmulatedPhone::new(stock_config(THIRD_GAP_FILL));
    let (mut flasher_one, _) = flasher(&first, profiles.clone());
    flasher_one
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 2)], &CustomFlashOptions::default())
        .unwrap();

    let second = EmulatedPhone::new(stock_config(THIRD_GAP_FILL));
    let (mut flasher_two, events) = flasher(&second, profiles);
    let report = flasher_two
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 2)], &CustomFlashOptions::default())
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert_eq!(second.log().undersized_headers, [THIRD_GAP_FILL as u32]);
    assert!(
        !events
            .try_iter()
            .any(|event| event == FlashEvent::State(FlashState::ScanningForProfile))
    );
}

#[test]
fn exhausted_search_reports_every_attempt() {
    let phone = EmulatedPhone::new(stock_config(0x123_4000));
    let profiles = Arc::new(ProfileCache::in_memory());
    let (mut flasher, events) = flasher(&phone, profiles.clone());

    let result = flasher.flash(
        &stock_image(),
        vec![payload(MAINOS_SECTOR, 1)],
        &CustomFlashOptions::default(),
    );

    match result {
        Err(FlashError::NoWorkingProfileFound { attempts }) => assert_eq!(attempts, 64),
        other => panic!("expected the search to run out, got {other:?}"),
    }
    assert!(profiles.get(&stock_key()).is_none());
    assert!(phone.log().chunks.is_empty());
    assert_eq!(
        events.try_iter().last(),
        Some(FlashEvent::State(FlashState::Abandoned))
    );
}

#[test]
fn search_size_matches_iterator() {
    use lumia_customflash::search::{ExploitParameters, estimate_gap_fill, maximum_gap_fill};

    let estimate = estimate_gap_fill(0);
    let search = GapFillSearch::new(
        ExploitParameters {
            gap_fill: estimate,
            header_size: 0x18000,
            assume_image_header_falls_in_gap: false,
            allocate_async_buffers_on_phone: false,
            allocate_backup_buffers_on_phone: false,
        },
        CHUNK_SIZE,
        maximum_gap_fill(estimate, false),
    );
    assert_eq!(search.maximum_attempts(), 64);
}

#[test]
fn full_store_header_splits_into_phases() {
    // 0xF8 + 0x0C + 0x1E80 = 0x1F84 bytes, room for six more descriptors
    let image = emulated::stock_ffu_image(CHUNK_SIZE, 0x1000, 0x1E8).unwrap();
    assert_eq!(image.store_header().len(), 0x1F84);

    let phone = EmulatedPhone::new(stock_config(0x20000));
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let report = flasher
        .flash(&image, vec![payload(MAINOS_SECTOR, 9)], &CustomFlashOptions::default())
        .unwrap();

    assert_eq!(report.chunks_written, 10);
    assert_eq!(report.phases, 2);

    let log = phone.log();
    assert_eq!(log.phases, 2);
    assert_eq!(log.crafted_headers, 2);
    assert_eq!(log.legitimate_chunks, 1);
    assert_eq!(log.chunks.len(), 10);
    assert_eq!(log.undersized_headers, [0x20000, 0x20000]);
    assert_eq!(
        log.chunk_indexes,
        [0, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88]
    );
}

#[test]
fn header_section_below_a_page_is_refused() {
    let image = stock_image();
    let result = FfuImage::new(
        CHUNK_SIZE,
        emulated::STOCK_FIRMWARE_VERSION,
        image.security_header().to_vec(),
        vec![0x11; 0x400],
        image.store_header().to_vec(),
    );

    let why = FlashError::from(result.unwrap_err());
    assert!(matches!(why, FlashError::InvalidLayout(_)));
}

fn attempt_failures(events: &mpsc::Receiver<FlashEvent>) -> Vec<String> {
    events
        .try_iter()
        .filter_map(|event| match event {
            FlashEvent::AttemptFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

#[test]
fn disconnect_after_payload_aborts_flash() {
    let mut config = stock_config(0x20000);
    config.disconnect_after_chunks = Some(2);
    let phone = EmulatedPhone::new(config);
    let profiles = Arc::new(ProfileCache::in_memory());
    let (mut flasher, events) = flasher(&phone, profiles.clone());

    let result = flasher.flash(
        &stock_image(),
        vec![payload(MAINOS_SECTOR, 3)],
        &CustomFlashOptions::default(),
    );

    match result {
        Err(FlashError::AbortFlash { chunks_written, .. }) => assert_eq!(chunks_written, 2),
        other => panic!("expected the flash to abort, got {other:?}"),
    }

    let log = phone.log();
    assert_eq!(log.undersized_headers, [0x20000]);
    assert_eq!(log.chunks.len(), 2);
    assert!(profiles.get(&stock_key()).is_none());
    assert!(attempt_failures(&events).is_empty());
}

#[test]
fn disconnect_before_second_phase_aborts_flash() {
    let image = emulated::stock_ffu_image(CHUNK_SIZE, 0x1000, 0x1E8).unwrap();
    let mut config = stock_config(0x20000);
    config.disconnect_at_undersized_header = Some(1);
    let phone = EmulatedPhone::new(config);
    let profiles = Arc::new(ProfileCache::in_memory());
    let (mut flasher, events) = flasher(&phone, profiles.clone());

    let result = flasher.flash(
        &image,
        vec![payload(MAINOS_SECTOR, 9)],
        &CustomFlashOptions::default(),
    );

    match result {
        Err(FlashError::AbortFlash { chunks_written, .. }) => assert_eq!(chunks_written, 6),
        other => panic!("expected the flash to abort, got {other:?}"),
    }

    let log = phone.log();
    assert_eq!(log.undersized_headers, [0x20000]);
    assert_eq!(log.phases, 1);
    assert_eq!(log.resets, 0);
    assert!(profiles.get(&stock_key()).is_none());
    assert!(attempt_failures(&events).is_empty());
}

#[test]
fn disconnect_during_negotiation_tries_next_gap_fill() {
    let mut config = stock_config(0x18000);
    config.disconnect_at_undersized_header = Some(0);
    let phone = EmulatedPhone::new(config);
    let profiles = Arc::new(ProfileCache::in_memory());
    let (mut flasher, events) = flasher(&phone, profiles.clone());

    let report = flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 1)], &CustomFlashOptions::default())
        .unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(report.profile.fill_size, 0x18000);
    assert_eq!(profiles.get(&stock_key()), Some(report.profile));
    assert_eq!(phone.log().undersized_headers, [0x18000]);
    assert_eq!(attempt_failures(&events), ["Phone disconnected"]);
}

#[test]
fn partition_table_goes_out_first() {
    let phone = EmulatedPhone::new(stock_config(0x20000));
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 1)], &CustomFlashOptions::default())
        .unwrap();

    let log = phone.log();
    let sent = GptTable::parse(&log.chunks[0]).unwrap();
    assert!(sent.partition("MainOS").is_some());
    assert!(sent.partition(IS_UNLOCKED).is_none());
    assert_eq!(log.chunks[1][..4], [0, 1, 2, 3]);
    assert_eq!(log.chunk_indexes, [0, 0x80]);
}

/// EFIESP image with the original volume moved into its second half.
fn unlocked_efiesp(sectors: u64) -> Vec<u8> {
    let half = sectors / 2;
    let mut image = vec![0u8; sectors as usize * 0x200];
    image[3..11].copy_from_slice(b"MSWIN4.1");
    image[0x0E..0x10].copy_from_slice(&(half as u16).to_le_bytes());
    let inner = half as usize * 0x200;
    image[inner + 3..inner + 11].copy_from_slice(b"MSDOS5.0");
    image
}

#[test]
fn unlocked_efiesp_marks_partition_table() {
    let phone = EmulatedPhone::new(stock_config(0x20000));
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let efiesp = FlashPart::new(0x800, Cursor::new(unlocked_efiesp(0x800)));
    let report = lumia::unlock_bootloader(&mut flasher, &stock_image(), vec![efiesp]).unwrap();

    assert!(report.partition_table_changed);
    assert_eq!(report.chunks_written, 33);

    let log = phone.log();
    let sent = GptTable::parse(&log.chunks[0]).unwrap();
    let marker = sent.partition(IS_UNLOCKED).unwrap();
    assert_eq!(marker.first_sector, IS_UNLOCKED_SECTOR);
    assert_eq!(marker.last_sector, IS_UNLOCKED_SECTOR);
    assert!(sent.partition("BACKUP_BS_NV").is_some());
}

#[test]
fn hard_exit_rewrites_both_pool_heads() {
    let phone = EmulatedPhone::new(stock_config(0x20000));
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let options = CustomFlashOptions {
        skip_persistent_flags: true,
        ..Default::default()
    };
    flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 2)], &options)
        .unwrap();

    let log = phone.log();
    assert_eq!(log.rewritten_slices, 2);
    assert_eq!(log.resets, 1);
}

#[test]
fn phone_needing_manual_reset_is_waited_for() {
    let mut config = stock_config(0x18000);
    config.resets_needing_manual_recovery = 1;
    let phone = EmulatedPhone::new(config);
    let (mut flasher, events) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let report = flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 1)], &CustomFlashOptions::default())
        .unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(phone.log().manual_recoveries, 1);

    assert!(
        events
            .try_iter()
            .any(|event| matches!(event, FlashEvent::ManualResetRequired { .. }))
    );
}

#[test]
fn pending_header_is_reset_first() {
    let mut config = stock_config(0x20000);
    config.header_pending = true;
    config.arrive_in_boot_manager = true;
    let phone = EmulatedPhone::new(config);
    let (mut flasher, events) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let report = flasher
        .flash(&stock_image(), vec![payload(MAINOS_SECTOR, 1)], &CustomFlashOptions::default())
        .unwrap();
    assert_eq!(report.attempts, 1);

    let log = phone.log();
    assert_eq!(log.arrivals, 2);
    assert_eq!(log.resets, 2);

    let states = events
        .try_iter()
        .filter_map(|event| match event {
            FlashEvent::State(state) => Some(state),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        states,
        [
            FlashState::Initializing,
            FlashState::ResetAndRecover,
            FlashState::ScanningForProfile,
            FlashState::Flashing,
            FlashState::Succeeded,
        ]
    );
}

#[test]
fn relock_restores_stock_layout() {
    let mut table = emulated::stock_partition_table(CHUNK_SIZE).unwrap();
    lumia::ensure_nv_backup(&mut table).unwrap();
    table
        .add_partition(lumia_customflash::gpt::Partition::new(
            IS_UNLOCKED,
            gpt_basic_data(),
            IS_UNLOCKED_SECTOR,
            IS_UNLOCKED_SECTOR,
        ))
        .unwrap();

    let mut config = stock_config(0x20000);
    config.gpt_chunk = table.rebuild().unwrap();
    let phone = EmulatedPhone::new(config);
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let report = lumia::relock_phone(&mut flasher, &stock_image(), false).unwrap();
    assert!(report.partition_table_changed);
    assert_eq!(report.chunks_written, 1);

    let sent = GptTable::parse(&phone.log().chunks[0]).unwrap();
    assert!(sent.partition(IS_UNLOCKED).is_none());
    assert!(sent.partition("BACKUP_BS_NV").is_some());
}

fn gpt_basic_data() -> gpt_disk_types::Guid {
    gpt_disk_types::GptPartitionType::BASIC_DATA.0
}

#[test]
fn job_streams_events_and_joins() {
    let phone = EmulatedPhone::new(stock_config(0x20000));
    let flasher = CustomFlasher::new(
        context(Arc::new(ProfileCache::in_memory())),
        phone.notifier(),
    );

    let job = FlashJob::spawn(
        flasher,
        stock_image(),
        vec![payload(MAINOS_SECTOR, 3)],
        CustomFlashOptions::default(),
    )
    .unwrap();

    let progress = job
        .events()
        .iter()
        .filter_map(|event| match event {
            FlashEvent::Progress { done, total } => Some((done, total)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(progress, [(1, 4), (2, 4), (3, 4), (4, 4)]);

    let report = job.join().unwrap();
    assert_eq!(report.chunks_written, 4);
}

#[test]
fn cancelled_job_stops_before_first_attempt() {
    let phone = EmulatedPhone::new(stock_config(0x20000));
    let flasher = CustomFlasher::new(
        context(Arc::new(ProfileCache::in_memory())),
        phone.notifier(),
    );
    flasher.cancel_flag().store(true, Ordering::Relaxed);

    let job = FlashJob::spawn(
        flasher,
        stock_image(),
        vec![payload(MAINOS_SECTOR, 1)],
        CustomFlashOptions::default(),
    )
    .unwrap();

    assert!(matches!(job.join(), Err(FlashError::Cancelled)));
    assert!(phone.log().undersized_headers.is_empty());
}

#[test]
fn protocol_one_phone_is_rejected() {
    let mut config = stock_config(0x20000);
    config.protocol_version_major = 1;
    let phone = EmulatedPhone::new(config);
    let (mut flasher, _) = flasher(&phone, Arc::new(ProfileCache::in_memory()));

    let result = flasher.flash(
        &stock_image(),
        vec![payload(MAINOS_SECTOR, 1)],
        &CustomFlashOptions::default(),
    );
    assert!(matches!(result, Err(FlashError::DeviceProtocolRejected(_))));
    assert!(phone.log().undersized_headers.is_empty());
}
