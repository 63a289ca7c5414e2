//! Search over the heap layout parameters the phone does not tell us.

use crate::{
    heap::{PAGE_SIZE, round_up_to_page},
    profile::FlashProfile,
};

/// Distance between the end of the flash app image and the gap the first
/// header allocation needs to land in, measured on a Lumia 950.
pub const GAP_FILL_ESTIMATE_OFFSET: usize = 0x20000;

/// Combinations of the three secondary flags.
const FLAG_COMBINATIONS: usize = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExploitParameters {
    pub gap_fill: usize,
    pub header_size: usize,
    pub assume_image_header_falls_in_gap: bool,
    pub allocate_async_buffers_on_phone: bool,
    pub allocate_backup_buffers_on_phone: bool,
}

impl ExploitParameters {
    pub fn from_profile(profile: &FlashProfile) -> Self {
        Self {
            gap_fill: profile.fill_size as usize,
            header_size: profile.header_size as usize,
            assume_image_header_falls_in_gap: profile.assume_image_header_falls_in_gap,
            allocate_async_buffers_on_phone: profile.allocate_async_buffers_on_phone,
            allocate_backup_buffers_on_phone: profile.allocate_backup_buffers_on_phone,
        }
    }

    pub fn to_profile(self) -> FlashProfile {
        FlashProfile {
            fill_size: self.gap_fill as u32,
            header_size: self.header_size as u32,
            assume_image_header_falls_in_gap: self.assume_image_header_falls_in_gap,
            allocate_async_buffers_on_phone: self.allocate_async_buffers_on_phone,
            allocate_backup_buffers_on_phone: self.allocate_backup_buffers_on_phone,
        }
    }

    /// Flips the secondary flags selected by the low three bits of `mask`.
    ///
    /// Bit 0 is `assume_image_header_falls_in_gap`, bit 1
    /// `allocate_async_buffers_on_phone`, bit 2 `allocate_backup_buffers_on_phone`.
    fn toggled(self, mask: usize) -> Self {
        Self {
            assume_image_header_falls_in_gap: self.assume_image_header_falls_in_gap
                ^ (mask & 0b001 != 0),
            allocate_async_buffers_on_phone: self.allocate_async_buffers_on_phone
                ^ (mask & 0b010 != 0),
            allocate_backup_buffers_on_phone: self.allocate_backup_buffers_on_phone
                ^ (mask & 0b100 != 0),
            ..self
        }
    }
}

pub fn estimate_gap_fill(flash_app_size: usize) -> usize {
    round_up_to_page(flash_app_size + GAP_FILL_ESTIMATE_OFFSET)
}

pub fn maximum_gap_fill(estimate: usize, experimental: bool) -> usize {
    if experimental { estimate * 4 } else { estimate * 2 }
}

/// `start, start - step, start + step, start - 2 * step, ...`, limited to
/// `[PAGE_SIZE, maximum]`.
pub fn primary_sequence(start: usize, step: usize, maximum: usize) -> Vec<usize> {
    let mut sequence = Vec::new();

    if (PAGE_SIZE..=maximum).contains(&start) {
        sequence.push(start);
    }

    for distance in (1..).map(|n: usize| n * step) {
        let below_exhausted = start < distance + PAGE_SIZE;
        let above_exhausted = start.saturating_add(distance) > maximum;
        if below_exhausted && above_exhausted {
            break;
        }

        if !below_exhausted && start - distance <= maximum {
            sequence.push(start - distance);
        }
        if !above_exhausted && start + distance >= PAGE_SIZE {
            sequence.push(start + distance);
        }
    }

    sequence
}

/// Iterator over every parameter set an operation may try.
///
/// The primary sequence runs once per flag combination, combinations counting
/// up in binary from the initial flags.
#[derive(Debug, Clone)]
pub struct GapFillSearch {
    initial: ExploitParameters,
    primary: Vec<usize>,
    attempt: usize,
}

impl GapFillSearch {
    pub fn new(initial: ExploitParameters, step: usize, maximum: usize) -> Self {
        let step = step.max(PAGE_SIZE);
        Self {
            initial,
            primary: primary_sequence(initial.gap_fill, step, maximum),
            attempt: 0,
        }
    }

    pub fn maximum_attempts(&self) -> usize {
        self.primary.len() * FLAG_COMBINATIONS
    }

    pub fn attempts_made(&self) -> usize {
        self.attempt
    }
}

impl Iterator for GapFillSearch {
    type Item = ExploitParameters;

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.maximum_attempts() {
            return None;
        }

        let combination = self.attempt / self.primary.len();
        let gap_fill = self.primary[self.attempt % self.primary.len()];
        self.attempt += 1;

        Some(ExploitParameters {
            gap_fill,
            ..self.initial.toggled(combination)
        })
    }
}
