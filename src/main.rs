mod args;

use std::{
    fs::File,
    io::Cursor,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use lumia_customflash::{
    emulated::{self, EmulatedPhone, EmulatedPhoneConfig},
    engine::{CustomFlashOptions, CustomFlasher, FlashContext},
    flash::FlashPart,
    gpt::{GptTable, PartitionArchive},
    job::FlashJob,
    profile::{FlashProfile, JsonProfileStore, ProfileCache, ProfileKey},
    progress::{FlashEvent, FlashState},
};
use tracing_subscriber::EnvFilter;

use crate::args::{Command, GptAction, ProfileAction, ProfileKeyArgs};

/// Sector the dry run payload is written to, the start of MainOS.
const DRY_RUN_START_SECTOR: u64 = 0x2000;

fn main() -> ExitCode {
    let args = args::CliArgs::parse();

    match EnvFilter::builder()
        .with_env_var("LUMIAFLASH_TRACE")
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(
                    args.log_level
                        .map(tracing::Level::from)
                        .unwrap_or(tracing::Level::WARN),
                )
                .init();
        }
    };

    let start = Instant::now();

    if let Err(why) = run_command(args) {
        eprintln!("{why:#}");
        return ExitCode::FAILURE;
    }

    println!("Finished in {:.02}s!", start.elapsed().as_secs_f64());
    ExitCode::SUCCESS
}

fn open_profiles(path: Option<&Path>) -> anyhow::Result<ProfileCache> {
    match path {
        Some(path) => ProfileCache::open(JsonProfileStore::new(path))
            .with_context(|| format!("Failed to open profiles at '{}'", path.display())),
        None => Ok(ProfileCache::in_memory()),
    }
}

fn run_command(args: args::CliArgs) -> anyhow::Result<()> {
    match args.command {
        Command::Gpt { action } => run_gpt(action),
        Command::Profiles { action } => {
            let profiles = open_profiles(args.profiles.as_deref())?;
            run_profiles(&profiles, action)
        }
        Command::DryRun {
            target_gap_fill,
            flash_app_size,
            chunk_size,
            chunks,
            write_descriptors,
            experimental,
            skip_persistent_flags,
            pool_mode,
        } => {
            let profiles = open_profiles(args.profiles.as_deref())?;
            let context = FlashContext {
                profiles: Arc::new(profiles),
                flash_app_size,
                experimental,
            };
            let options = CustomFlashOptions {
                skip_persistent_flags,
                pool_size_mode: pool_mode.into(),
                ..Default::default()
            };
            dry_run(
                context,
                options,
                target_gap_fill,
                chunk_size,
                chunks,
                write_descriptors,
            )
        }
    }
}

fn read_gpt(path: &Path) -> anyhow::Result<GptTable> {
    let chunk = std::fs::read(path)
        .with_context(|| format!("Failed to read GPT chunk '{}'", path.display()))?;
    GptTable::parse(&chunk).with_context(|| format!("Failed to parse GPT in '{}'", path.display()))
}

fn write_gpt(table: &mut GptTable, input: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let output = output.unwrap_or_else(|| input.to_path_buf());
    let bytes = table.rebuild().context("Failed to rebuild GPT")?;
    std::fs::write(&output, bytes)
        .with_context(|| format!("Failed to write GPT chunk '{}'", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn print_table(table: &GptTable) {
    println!(
        "{} of {} entries used, usable sectors {:#X}..={:#X}",
        table.partitions().len(),
        table.entry_capacity(),
        table.first_usable_sector(),
        table.last_usable_sector()
    );

    let mut partitions = table.partitions().to_vec();
    partitions.sort_by_key(|partition| partition.first_sector);

    for partition in partitions {
        println!(
            "{:<36} {:>#12X} {:>#12X} {:>#12X} {}",
            partition.name,
            partition.first_sector,
            partition.last_sector,
            partition.size_in_sectors(),
            partition.guid
        );
    }
}

fn run_gpt(action: GptAction) -> anyhow::Result<()> {
    match action {
        GptAction::Show { chunk } => {
            print_table(&read_gpt(&chunk)?);
        }
        GptAction::Rebuild { chunk, output } => {
            let mut table = read_gpt(&chunk)?;
            write_gpt(&mut table, &chunk, output)?;
        }
        GptAction::RestoreBackups {
            chunk,
            limit,
            output,
        } => {
            let mut table = read_gpt(&chunk)?;
            if !table
                .restore_backup_partitions(limit)
                .context("Failed to restore backup partitions")?
            {
                println!("No backup partitions to restore");
                return Ok(());
            }
            print_table(&table);
            write_gpt(&mut table, &chunk, output)?;
        }
        GptAction::Merge {
            chunk,
            layout,
            archive,
            output,
        } => {
            let mut table = read_gpt(&chunk)?;
            let xml = std::fs::read_to_string(&layout)
                .with_context(|| format!("Failed to read layout '{}'", layout.display()))?;

            let mut archive: Box<dyn PartitionArchive> = match archive {
                Some(path) => {
                    let file = File::open(&path)
                        .with_context(|| format!("Failed to open archive '{}'", path.display()))?;
                    Box::new(zip::ZipArchive::new(file).with_context(|| {
                        format!("Failed to read archive '{}'", path.display())
                    })?)
                }
                None => Box::new(std::collections::HashMap::<String, u64>::new()),
            };

            if !table
                .merge_partition_layout(&xml, archive.as_mut())
                .context("Failed to merge partition layout")?
            {
                println!("Layout already matches");
                return Ok(());
            }
            print_table(&table);
            write_gpt(&mut table, &chunk, output)?;
        }
    }

    Ok(())
}

fn profile_key(args: ProfileKeyArgs) -> ProfileKey {
    ProfileKey::new(args.platform_id, args.current_firmware, args.target_firmware)
}

fn print_profile(key: &ProfileKey, profile: &FlashProfile) {
    println!(
        "{key}: fill {:#X}, header {:#X}, image header in gap: {}, async buffers: {}, backup buffers: {}",
        profile.fill_size,
        profile.header_size,
        profile.assume_image_header_falls_in_gap,
        profile.allocate_async_buffers_on_phone,
        profile.allocate_backup_buffers_on_phone
    );
}

fn run_profiles(profiles: &ProfileCache, action: ProfileAction) -> anyhow::Result<()> {
    match action {
        ProfileAction::List => {
            let stored = profiles.list();
            if stored.is_empty() {
                println!("No flashing profiles stored");
            }
            for (key, profile) in &stored {
                print_profile(key, profile);
            }
        }
        ProfileAction::Get { key } => {
            let key = profile_key(key);
            let profile = profiles
                .get(&key)
                .with_context(|| format!("No flashing profile stored for {key}"))?;
            print_profile(&key, &profile);
        }
        ProfileAction::Set {
            key,
            fill_size,
            header_size,
            assume_image_header_falls_in_gap,
            allocate_async_buffers_on_phone,
            allocate_backup_buffers_on_phone,
        } => {
            let profile = FlashProfile {
                fill_size: u32::try_from(fill_size).context("Fill size does not fit 32 bits")?,
                header_size: u32::try_from(header_size)
                    .context("Header size does not fit 32 bits")?,
                assume_image_header_falls_in_gap,
                allocate_async_buffers_on_phone,
                allocate_backup_buffers_on_phone,
            };
            profiles.set(profile_key(key), profile);
        }
        ProfileAction::Remove { key } => {
            let key = profile_key(key);
            if profiles.remove(&key).is_none() {
                anyhow::bail!("No flashing profile stored for {key}");
            }
        }
    }

    Ok(())
}

fn progress_bar() -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::hidden();
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar}] {pos}/{len} chunks ({eta}) {msg}",
        )?
            .with_key(
                "eta",
                |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                    let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
                },
            )
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn dry_run(
    context: FlashContext,
    options: CustomFlashOptions,
    target_gap_fill: usize,
    chunk_size: usize,
    chunks: usize,
    write_descriptors: usize,
) -> anyhow::Result<()> {
    let image = emulated::stock_ffu_image(chunk_size, 0x1000, write_descriptors)
        .context("Failed to build FFU headers")?;
    let gpt_chunk = emulated::stock_partition_table(chunk_size)
        .and_then(|mut table| table.rebuild())
        .context("Failed to build partition table")?;

    let phone = EmulatedPhone::new(EmulatedPhoneConfig::new(
        chunk_size,
        target_gap_fill,
        gpt_chunk,
    ));

    let payload = (0..chunks * chunk_size)
        .map(|idx| (idx / chunk_size) as u8 ^ (idx % 251) as u8)
        .collect::<Vec<_>>();
    let parts = vec![
        FlashPart::new(DRY_RUN_START_SECTOR, Cursor::new(payload)).with_progress_text("MainOS"),
    ];

    let flasher = CustomFlasher::new(context, phone.notifier());
    let job = FlashJob::spawn(flasher, image, parts, options)
        .context("Failed to start flashing thread")?;

    let pb = progress_bar()?;
    for event in job.events() {
        match event {
            FlashEvent::State(FlashState::Flashing) => {
                pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            }
            FlashEvent::State(state) => tracing::debug!("State: {state:?}"),
            FlashEvent::Status { text, sub_text } => match sub_text {
                Some(sub_text) => pb.set_message(format!("{text}: {sub_text}")),
                None => pb.set_message(text),
            },
            FlashEvent::Progress { done, total } => {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            }
            FlashEvent::AttemptFailed { attempt, reason } => {
                pb.println(format!("Attempt {attempt} failed: {reason}"));
            }
            FlashEvent::ManualResetRequired {
                message,
                sub_message,
            } => {
                pb.println(format!("{message}. {sub_message}"));
            }
        }
    }
    pb.finish();

    let report = job.join().context("Custom flash failed")?;
    let log = phone.log();

    println!(
        "Flashed {} chunks in {} phase(s) after {} attempt(s), {} reset(s)",
        report.chunks_written,
        report.phases,
        report.attempts,
        log.resets
    );
    println!(
        "Profile: fill {:#X}, header {:#X}",
        report.profile.fill_size, report.profile.header_size
    );

    Ok(())
}
