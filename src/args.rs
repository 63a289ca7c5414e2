use std::path::PathBuf;

use lumia_customflash::heap::PoolSizeMode;

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PoolMode {
    /// Declare requested size plus pool head and tail
    Logical,
    /// Declare the page rounded reservation
    Rounded,
}

impl From<PoolMode> for PoolSizeMode {
    fn from(value: PoolMode) -> Self {
        match value {
            PoolMode::Logical => PoolSizeMode::Logical,
            PoolMode::Rounded => PoolSizeMode::Rounded,
        }
    }
}

#[derive(clap::Parser)]
#[command(version)]
pub struct CliArgs {
    /// Optional log level, can also be set by the "LUMIAFLASH_TRACE" environment variable. If both are specified, the environment variable is preferred.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// JSON file flashing profiles are loaded from and stored to. Profiles only live in memory if unset.
    #[arg(long, env = "LUMIAFLASH_PROFILES")]
    pub profiles: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

fn parse_number(input: &str) -> Result<u64, std::num::ParseIntError> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => input.parse(),
    }
}

fn parse_size(input: &str) -> Result<usize, std::num::ParseIntError> {
    parse_number(input).map(|value| value as usize)
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// Inspect and edit a dumped GPT chunk
    Gpt {
        #[clap(subcommand)]
        action: GptAction,
    },
    /// Manage stored flashing profiles
    Profiles {
        #[clap(subcommand)]
        action: ProfileAction,
    },
    /// Run a full custom flash against an emulated phone
    DryRun {
        /// Gap fill the emulated phone accepts
        #[clap(long, value_parser = parse_size, default_value = "0x38000")]
        target_gap_fill: usize,
        /// Size of the flash app image the gap fill estimate starts from
        #[clap(long, value_parser = parse_size, default_value = "0x0")]
        flash_app_size: usize,
        #[clap(long, value_parser = parse_size, default_value = "0x8000")]
        chunk_size: usize,
        /// Chunks to flash after the partition table
        #[clap(long, default_value_t = 16)]
        chunks: usize,
        /// Write descriptors already in the store header, fewer leave more room per phase
        #[clap(long, default_value_t = 4)]
        write_descriptors: usize,
        /// Search up to four times the estimated gap fill
        #[clap(short, long)]
        experimental: bool,
        /// End with a hard exit instead of a normal reset
        #[clap(long)]
        skip_persistent_flags: bool,
        #[clap(long, value_enum, default_value = "rounded")]
        pool_mode: PoolMode,
    },
}

#[derive(clap::Subcommand)]
pub enum GptAction {
    /// List the partitions of a GPT chunk
    Show { chunk: PathBuf },
    /// Recompute the CRCs of a GPT chunk
    Rebuild {
        chunk: PathBuf,
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Reinstate partitions from their BACKUP_ counterparts
    RestoreBackups {
        chunk: PathBuf,
        /// Only restore partitions reaching past this sector
        #[clap(long, value_parser = parse_number)]
        limit: Option<u64>,
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply a partition layout manifest
    Merge {
        chunk: PathBuf,
        layout: PathBuf,
        /// Zip of partition images to take partition sizes from
        #[clap(long)]
        archive: Option<PathBuf>,
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
pub struct ProfileKeyArgs {
    pub platform_id: String,
    pub current_firmware: String,
    pub target_firmware: String,
}

#[derive(clap::Subcommand)]
pub enum ProfileAction {
    List,
    Get {
        #[clap(flatten)]
        key: ProfileKeyArgs,
    },
    Set {
        #[clap(flatten)]
        key: ProfileKeyArgs,
        #[clap(long, value_parser = parse_number)]
        fill_size: u64,
        #[clap(long, value_parser = parse_number)]
        header_size: u64,
        #[clap(long)]
        assume_image_header_falls_in_gap: bool,
        #[clap(long)]
        allocate_async_buffers_on_phone: bool,
        #[clap(long)]
        allocate_backup_buffers_on_phone: bool,
    },
    Remove {
        #[clap(flatten)]
        key: ProfileKeyArgs,
    },
}
