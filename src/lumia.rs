//! Partition table changes behind unlocking and relocking a Lumia bootloader.

use gpt_disk_types::GptPartitionType;

use crate::{
    engine::{CustomFlashOptions, CustomFlasher, FlashReport, PartitionEdit},
    error::FlashError,
    ffu::FfuImage,
    flash::FlashPart,
    gpt::{GptTable, Partition, SECTOR_SIZE},
    transport::DeviceNotifier,
};

/// Marker partition the unlocked bootloader looks for.
pub const IS_UNLOCKED: &str = "IS_UNLOCKED";
pub const IS_UNLOCKED_SECTOR: u64 = 0x40;

const EFIESP: &str = "EFIESP";
const BACKUP_EFIESP: &str = "BACKUP_EFIESP";
const UEFI_BS_NV: &str = "UEFI_BS_NV";
const BACKUP_BS_NV: &str = "BACKUP_BS_NV";

const FAT_RESERVED_SECTORS_OFFSET: u64 = 0x0E;
const FAT_OEM_NAME_OFFSET: u64 = 0x03;
const UNLOCKED_EFIESP_OEM_NAME: &[u8; 8] = b"MSDOS5.0";

/// Adds `IS_UNLOCKED` when one of `parts` is an unlocked EFIESP image.
///
/// An unlocked EFIESP keeps the original volume in its second half and
/// reserves the first half in the boot sector of the outer volume.
pub fn mark_unlocked_efiesp(
    gpt: &mut GptTable,
    parts: &mut [FlashPart],
) -> Result<bool, FlashError> {
    if gpt.partition(IS_UNLOCKED).is_some() {
        return Ok(false);
    }

    let Some(efiesp) = gpt.partition(EFIESP).cloned() else {
        return Ok(false);
    };

    let Some(part) = parts
        .iter_mut()
        .find(|part| part.start_sector == efiesp.first_sector)
    else {
        return Ok(false);
    };

    let half = efiesp.size_in_sectors() / 2;

    let mut reserved_sectors = [0u8; 2];
    part.peek(FAT_RESERVED_SECTORS_OFFSET, &mut reserved_sectors)?;
    if u16::from_le_bytes(reserved_sectors) as u64 != half {
        return Ok(false);
    }

    let mut oem_name = [0u8; 8];
    part.peek(half * SECTOR_SIZE as u64 + FAT_OEM_NAME_OFFSET, &mut oem_name)?;
    if &oem_name != UNLOCKED_EFIESP_OEM_NAME {
        return Ok(false);
    }

    tracing::info!("EFIESP image is unlocked, adding {IS_UNLOCKED}");
    gpt.add_partition(Partition::new(
        IS_UNLOCKED,
        GptPartitionType::BASIC_DATA.0,
        IS_UNLOCKED_SECTOR,
        IS_UNLOCKED_SECTOR,
    ))?;

    Ok(true)
}

/// Creates `BACKUP_BS_NV` the size of `UEFI_BS_NV` in the first free space
/// after it. An existing backup is left alone.
pub fn ensure_nv_backup(gpt: &mut GptTable) -> Result<bool, FlashError> {
    if gpt.partition(BACKUP_BS_NV).is_some() {
        tracing::debug!("{BACKUP_BS_NV} already present");
        return Ok(false);
    }

    let Some(nv) = gpt.partition(UEFI_BS_NV).cloned() else {
        return Err(FlashError::InvalidLayout(format!(
            "partition table has no {UEFI_BS_NV} to back up"
        )));
    };

    let size = nv.size_in_sectors();
    let Some(first_sector) = gpt.find_free_range(size, nv.first_sector) else {
        return Err(FlashError::InvalidLayout(format!(
            "no free space for a {size:#X} sector {BACKUP_BS_NV}"
        )));
    };

    tracing::info!("Adding {BACKUP_BS_NV} at sector {first_sector:#X}");
    gpt.add_partition(Partition::new(
        BACKUP_BS_NV,
        nv.partition_type,
        first_sector,
        first_sector + size - 1,
    ))?;

    Ok(true)
}

/// Removes the unlock marker, puts EFIESP back together and makes sure the NV
/// backup exists.
pub fn relock_partition_table(gpt: &mut GptTable) -> Result<bool, FlashError> {
    let mut changed = gpt.remove_partition(IS_UNLOCKED).is_some();
    changed |= gpt.restore_backup_partition(BACKUP_EFIESP, EFIESP, None)?;
    changed |= ensure_nv_backup(gpt)?;
    Ok(changed)
}

/// Flashes only the relocked partition table.
pub fn relock_phone<N: DeviceNotifier>(
    flasher: &mut CustomFlasher<N>,
    image: &FfuImage,
    skip_persistent_flags: bool,
) -> Result<FlashReport, FlashError> {
    flasher.flash(
        image,
        Vec::new(),
        &CustomFlashOptions {
            skip_persistent_flags,
            partition_edit: PartitionEdit::Relock,
            ..Default::default()
        },
    )
}

/// Flashes an unlocked EFIESP image along with `parts`. `IS_UNLOCKED` gets
/// added once the image is recognised.
pub fn unlock_bootloader<N: DeviceNotifier>(
    flasher: &mut CustomFlasher<N>,
    image: &FfuImage,
    parts: Vec<FlashPart>,
) -> Result<FlashReport, FlashError> {
    flasher.flash(
        image,
        parts,
        &CustomFlashOptions {
            skip_persistent_flags: true,
            partition_edit: PartitionEdit::Unlock,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::gpt::tests::sample_table;

    /// EFIESP image with the original volume moved into its second half.
    fn unlocked_efiesp(sectors: u64) -> Vec<u8> {
        let half = sectors / 2;
        let mut image = vec![0u8; sectors as usize * SECTOR_SIZE];
        image[3..11].copy_from_slice(b"MSWIN4.1");
        image[0x0E..0x10].copy_from_slice(&(half as u16).to_le_bytes());
        let inner = half as usize * SECTOR_SIZE;
        image[inner + 3..inner + 11].copy_from_slice(b"MSDOS5.0");
        image
    }

    #[test]
    fn unlocked_efiesp_adds_marker() {
        let mut gpt = sample_table();
        let mut parts = vec![FlashPart::new(0x800, Cursor::new(unlocked_efiesp(0x800)))];

        assert!(mark_unlocked_efiesp(&mut gpt, &mut parts).unwrap());
        let marker = gpt.partition(IS_UNLOCKED).unwrap();
        assert_eq!((marker.first_sector, marker.last_sector), (0x40, 0x40));

        assert!(!mark_unlocked_efiesp(&mut gpt, &mut parts).unwrap());
    }

    #[test]
    fn stock_efiesp_is_ignored() {
        let mut gpt = sample_table();
        let mut image = unlocked_efiesp(0x800);
        image[0x0E..0x10].copy_from_slice(&8u16.to_le_bytes());
        let mut parts = vec![FlashPart::new(0x800, Cursor::new(image))];

        assert!(!mark_unlocked_efiesp(&mut gpt, &mut parts).unwrap());
        assert!(gpt.partition(IS_UNLOCKED).is_none());
    }

    #[test]
    fn existing_nv_backup_is_untouched() {
        let mut gpt = sample_table();
        let backup = Partition::new(BACKUP_BS_NV, GptPartitionType::BASIC_DATA.0, 0x1400, 0x17FF);
        gpt.add_partition(backup.clone()).unwrap();

        assert!(!ensure_nv_backup(&mut gpt).unwrap());
        assert_eq!(gpt.partition(BACKUP_BS_NV), Some(&backup));
    }

    #[test]
    fn nv_backup_matches_nv_size() {
        let mut gpt = sample_table();
        assert!(ensure_nv_backup(&mut gpt).unwrap());

        let backup = gpt.partition(BACKUP_BS_NV).unwrap();
        assert_eq!(backup.size_in_sectors(), gpt.partition(UEFI_BS_NV).unwrap().size_in_sectors());
        gpt.validate().unwrap();
    }

    #[test]
    fn relock_undoes_unlock() {
        let mut gpt = sample_table();
        gpt.partition_mut(EFIESP).unwrap().first_sector = 0xC00;
        gpt.add_partition(Partition::new(
            BACKUP_EFIESP,
            GptPartitionType::BASIC_DATA.0,
            0x800,
            0xBFF,
        ))
            .unwrap();
        gpt.add_partition(Partition::new(IS_UNLOCKED, GptPartitionType::BASIC_DATA.0, 0x40, 0x40))
            .unwrap();

        assert!(relock_partition_table(&mut gpt).unwrap());
        assert!(gpt.partition(IS_UNLOCKED).is_none());
        assert!(gpt.partition(BACKUP_EFIESP).is_none());
        assert_eq!(gpt.partition(EFIESP).unwrap().first_sector, 0x800);
        assert!(gpt.partition(BACKUP_BS_NV).is_some());
    }
}
