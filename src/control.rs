use bitfield_struct::bitfield;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::config::DeviceConfig;
use crate::defs::*;
use crate::object::ObjectDirectory;
use crate::reg::{t102, t104, t6, t66, t8, ObjectType};
use crate::rw::Bus;
use crate::Error;

/// T6 status byte as reported in command processor messages.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct CommandStatus {
  #[bits(2)]
  __: u8,
  pub(crate) comms_error: bool,
  pub(crate) config_error: bool,
  pub(crate) calibrating: bool,
  pub(crate) signal_error: bool,
  pub(crate) overflow: bool,
  pub(crate) reset: bool,
}

/// Register values captured at initialize and restored when a temporary
/// override ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SavedSettings {
  /// T104 self touch threshold.
  pub self_threshold: u8,
  /// T104 self internal threshold.
  pub self_internal_threshold: u8,
  /// T80 anti-touch threshold.
  pub anti_touch_threshold: u8,
  /// T102 self recalibration config.
  pub self_recalib: u8,
  /// T8 anti-touch calibration block.
  pub anti_calib: [u8; 4],
}

/// Which pair of T104 thresholds a temporary override touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SelfThreshold {
  /// Touch thresholds, raised while suspended or until the first unlock.
  Touch,
  /// Internal thresholds while a passive stylus is enabled.
  InternalStylus,
  /// Internal thresholds while suspended or until the first unlock.
  InternalSuspend,
}

impl SelfThreshold {
  const fn registers(self) -> (u8, u8) {
    match self {
      Self::Touch => (t104::X_TOUCH_THRESHOLD, t104::Y_TOUCH_THRESHOLD),
      Self::InternalStylus | Self::InternalSuspend => (t104::X_INTERNAL_THRESHOLD, t104::Y_INTERNAL_THRESHOLD),
    }
  }

  /// `(override, saved)` values for this pair.
  const fn values(self, variant: &DeviceConfig<'_>, saved: &SavedSettings) -> (u8, u8) {
    match self {
      Self::Touch => (variant.self_threshold_suspend, saved.self_threshold),
      Self::InternalStylus => (variant.self_internal_threshold_stylus, saved.self_internal_threshold),
      Self::InternalSuspend => (variant.self_internal_threshold_suspend, saved.self_internal_threshold),
    }
  }
}

/// T66 command phases, written together with the enable bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum GoldenCommand {
  None = 0x00,
  Prime = 0x04,
  Generate = 0x08,
  Confirm = 0x0C,
}

impl<I, E, D> Bus<I, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  async fn poll_clear(
    &mut self,
    dir: &ObjectDirectory,
    kind: ObjectType,
    offset: u8,
    interval: u32,
    tries: u16,
  ) -> Result<(), Error<E>> {
    for _ in 0..tries {
      self.sleep(interval).await;
      if self.read_object(dir, kind, offset).await? == 0 {
        return Ok(());
      }
    }
    Err(Error::Timeout)
  }

  /// Restart the firmware. The resident config CRC is unknown afterwards.
  pub(crate) async fn soft_reset(&mut self, dir: &ObjectDirectory) -> Result<(), Error<E>> {
    info!("soft reset");
    self.write_object(dir, ObjectType::Command, t6::RESET, t6::RESET_VALUE).await?;
    self.sleep(RESET_TIME).await;
    Ok(())
  }

  /// Persist the running configuration and restart.
  pub(crate) async fn backup_nv(&mut self, dir: &ObjectDirectory) -> Result<(), Error<E>> {
    self.write_object(dir, ObjectType::Command, t6::BACKUP_NV, t6::BACKUP_VALUE).await?;
    self.sleep(BACKUP_TIME).await;
    self.poll_clear(dir, ObjectType::Command, t6::BACKUP_NV, BACKUP_POLL, BACKUP_POLLS).await?;
    self.soft_reset(dir).await
  }

  pub(crate) async fn calibrate(&mut self, dir: &ObjectDirectory) -> Result<(), Error<E>> {
    debug!("calibrate");
    self.write_object(dir, ObjectType::Command, t6::CALIBRATE, 1).await?;
    self.poll_clear(dir, ObjectType::Command, t6::CALIBRATE, CALIBRATE_POLL, CALIBRATE_POLLS).await
  }

  /// Select a T37 diagnostic mode and wait for the firmware to accept it.
  pub(crate) async fn diagnostic(&mut self, dir: &ObjectDirectory, mode: u8) -> Result<(), Error<E>> {
    self.write_object(dir, ObjectType::Command, t6::DIAGNOSTIC, mode).await?;
    for _ in 0..DIAGNOSTIC_POLLS {
      if self.read_object(dir, ObjectType::Command, t6::DIAGNOSTIC).await? == 0 {
        return Ok(());
      }
      self.sleep(1).await;
    }
    Err(Error::Timeout)
  }

  pub(crate) async fn report_all(&mut self, dir: &ObjectDirectory) -> Result<(), Error<E>> {
    self.write_object(dir, ObjectType::Command, t6::REPORT_ALL, 1).await
  }

  /// Anti-touch calibration on restores the saved T8 block.
  pub(crate) async fn set_anti_calib(
    &mut self,
    dir: &ObjectDirectory,
    saved: &SavedSettings,
    on: bool,
  ) -> Result<(), Error<E>> {
    let values = if on { saved.anti_calib } else { t8::ANTI_CALIB_OFF };
    debug!("anti-touch calibration {}", on);
    self.write_object_bytes(dir, ObjectType::Acquire, t8::ANTI_CALIB, &values).await
  }

  pub(crate) async fn set_self_recalib(
    &mut self,
    dir: &ObjectDirectory,
    saved: &SavedSettings,
    on: bool,
  ) -> Result<(), Error<E>> {
    let value = if on { saved.self_recalib } else { t102::RECALIB_OFF };
    self.write_optional(dir, ObjectType::SelfCap, t102::RECALCFG, value).await
  }

  /// Apply or restore one T104 threshold pair. A zero override leaves the
  /// registers alone.
  pub(crate) async fn adjust_self(
    &mut self,
    dir: &ObjectDirectory,
    variant: &DeviceConfig<'_>,
    saved: &SavedSettings,
    which: SelfThreshold,
    apply: bool,
  ) -> Result<(), Error<E>> {
    let (update, restore) = which.values(variant, saved);
    if update == 0 || !dir.contains(ObjectType::AuxTouch) {
      return Ok(());
    }
    let value = if apply { update } else { restore };
    let (x, y) = which.registers();
    debug!("{:?} self thresholds -> {}", which, value);
    self.write_object(dir, ObjectType::AuxTouch, x, value).await?;
    self.write_object(dir, ObjectType::AuxTouch, y, value).await
  }

  pub(crate) async fn set_golden(&mut self, dir: &ObjectDirectory, on: bool) -> Result<(), Error<E>> {
    let value = if on { t66::ENABLE | t66::REPORT_ENABLE } else { 0 };
    self.write_optional(dir, ObjectType::GoldenReference, t66::CTRL, value).await
  }

  pub(crate) async fn golden_command(
    &mut self,
    dir: &ObjectDirectory,
    command: GoldenCommand,
    use_current: bool,
  ) -> Result<(), Error<E>> {
    let mut value = t66::ENABLE | t66::REPORT_ENABLE | command as u8;
    if use_current {
      value |= t66::USE_CURRENT;
    }
    debug!("golden reference command {:?}", command);
    self.write_object(dir, ObjectType::GoldenReference, t66::CTRL, value).await
  }
}
