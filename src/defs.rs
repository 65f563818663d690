/******************************************************************************
 * maXTouch object protocol: memory map layout, limits and timings.           *
*******************************************************************************/

/// Default application-mode I2C address.
pub const DEFAULT_ADDRESS: u8 = 0x4A;

pub(crate) const INFO_BLOCK_LEN: usize = 7;
pub(crate) const OBJECT_TABLE_START: u16 = 0x07;
pub(crate) const OBJECT_ENTRY_LEN: usize = 6;
pub(crate) const INFO_CRC_LEN: usize = 3;

/// Family id of silicon whose message records carry no CRC byte.
pub(crate) const FAMILY_FULL_MESSAGE: u8 = 0x80;

/// Largest payload written in a single transfer.
pub(crate) const MAX_BLOCK_WRITE: usize = 256;

/// Report id of an empty message slot.
pub(crate) const NO_MESSAGE: u8 = 0xFF;

pub(crate) const MAX_OBJECTS: usize = 64;
pub(crate) const MAX_MESSAGE_SIZE: usize = 16;
/// Records fetched per bus transfer.
pub(crate) const MESSAGE_BATCH: usize = 32;

/// Finger plus stylus slots tracked at once.
pub const MAX_SLOTS: usize = 16;
pub(crate) const MAX_KEYS: usize = 8;

// Timings, milliseconds
pub(crate) const RESET_TIME: u32 = 400;
pub(crate) const BACKUP_TIME: u32 = 25;
pub(crate) const BACKUP_POLL: u32 = 20;
pub(crate) const BACKUP_POLLS: u16 = 100;
pub(crate) const FW_RESET_TIME: u32 = 1000;
pub(crate) const REPORT_ALL_SETTLE: u32 = 30;
pub(crate) const CALIBRATE_POLL: u32 = 10;
pub(crate) const CALIBRATE_POLLS: u16 = 100;
pub(crate) const DIAGNOSTIC_POLLS: u16 = 500;
pub(crate) const GPIO_POLL: u32 = 1;
pub(crate) const GPIO_POLLS: u16 = 1000;
pub(crate) const BOOTLOADER_RETRIES: u8 = 10;
pub(crate) const SUSPEND_WAIT_POLL: u32 = 10;
pub(crate) const SUSPEND_WAIT_POLLS: u16 = 500;

/// Application to bootloader address pairs.
pub(crate) const BOOTLOADER_ADDRESSES: [(u8, u8); 6] =
  [(0x4A, 0x24), (0x4B, 0x25), (0x4C, 0x26), (0x4D, 0x27), (0x5A, 0x34), (0x5B, 0x35)];
pub(crate) const BOOTLOADER_LEAVE: [u8; 2] = [0x01, 0x01];
pub(crate) const BOOTLOADER_STATUS_MASK: u8 = 0x3F;
pub(crate) const BOOTLOADER_APP_CRC_FAIL: u8 = 0x40;

pub(crate) const fn bootloader_address(application: u8) -> Option<u8> {
  let mut i = 0;
  while i < BOOTLOADER_ADDRESSES.len() {
    if BOOTLOADER_ADDRESSES[i].0 == application {
      return Some(BOOTLOADER_ADDRESSES[i].1);
    }
    i += 1;
  }
  None
}
