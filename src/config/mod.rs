use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::{MAX_BLOCK_WRITE, REPORT_ALL_SETTLE};
use crate::reg::ObjectType;
use crate::{Error, Maxtouch};

mod file;
mod platform;
mod variant;

pub use file::*;
pub use platform::*;
pub use variant::*;

/// Result of [`Maxtouch::download_config`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigOutcome {
  /// The resident configuration already matches; nothing was written.
  UpToDate,
  /// A new image was written. Back it up to make it permanent.
  Applied,
}

impl<'a, M, I, E, D> Maxtouch<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  /// Fetch the resident config CRC through a T6 report if it is not known.
  pub(crate) async fn read_config_crc(&mut self) -> Result<(), Error<E>> {
    if self.config_crc != 0 {
      return Ok(());
    }
    self.bus.report_all(&self.directory).await?;
    self.bus.sleep(REPORT_ALL_SETTLE).await;
    self.drain(&mut ()).await
  }

  /// Write an `OBP_RAW` configuration to the controller's volatile registers.
  ///
  /// Every register between the object table and the end of the last object
  /// is written; registers no record covers are zeroed. Nothing is written
  /// when the info CRC matches and both config CRCs agree.
  pub async fn download_config(&mut self, text: &str) -> Result<ConfigOutcome, Error<E>> {
    let file = ConfigFile::parse(text)?;
    // Validate the whole file before touching the controller.
    for record in file.records() {
      record?.place(&self.directory)?;
    }
    self.read_config_crc().await?;

    if file.info_crc == self.info_crc {
      if file.config_crc == 0 || self.config_crc == 0 {
        info!("zero config CRC, applying");
      } else if file.config_crc == self.config_crc {
        info!("config CRC 0x{:06x} up to date", self.config_crc);
        return Ok(ConfigOutcome::UpToDate);
      } else {
        info!("config CRC 0x{:06x} differs from file 0x{:06x}", self.config_crc, file.config_crc);
      }
    } else {
      warn!("info block CRC mismatch, applying anyway");
    }

    let dir = &self.directory;
    let start = dir.config_start();
    let power = dir.lookup(ObjectType::Power).map(|o| o.start_address);
    if power.is_some_and(|addr| addr < start) {
      warn!("power object below config start, not writing");
      return Ok(ConfigOutcome::UpToDate);
    }

    let end = dir.mem_size();
    let mut block = [0u8; MAX_BLOCK_WRITE];
    let mut at = start as u32;
    while at < end {
      let len = (end - at).min(MAX_BLOCK_WRITE as u32) as usize;
      let window = at..at + len as u32;
      block[..len].fill(0);
      for record in file.records() {
        let record = record?;
        let (base, size) = record.place(&self.directory)?;
        for (i, byte) in record.bytes().take(size).enumerate() {
          let addr = base + i as u32;
          if window.contains(&addr) {
            block[(addr - at) as usize] = byte;
          }
        }
      }
      self.bus.write(at as u16, &block[..len]).await?;
      at += len as u32;
    }
    info!("config written, {} bytes", end - start as u32);
    self.config_crc = file.config_crc;
    Ok(ConfigOutcome::Applied)
  }
}
