pub mod emulated;
pub mod engine;
pub mod error;
pub mod ffu;
pub mod flash;
pub mod gpt;
pub mod heap;
pub mod job;
pub mod lumia;
pub mod profile;
pub mod progress;
pub mod search;
pub mod transport;

pub use engine::{CustomFlashOptions, CustomFlasher, FlashContext, FlashReport, PartitionEdit};
pub use error::{AttemptOutcome, FlashError};
pub use job::FlashJob;
