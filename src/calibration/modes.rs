use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use super::{Calibrator, Context};
use crate::config::DeviceConfig;
use crate::control::SelfThreshold;
use crate::reg::{t100, t15, t47, t72, t78, t80, ObjectType};
use crate::Error;

impl<'a, M, I, E, D> Calibrator<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  E: embedded_hal::i2c::Error,
  D: DelayNs,
{
  /// Write the T100 thresholds, mirroring a non-zero touch threshold into T71.
  async fn write_mutual_thresholds(&mut self, ctx: &Context, variant: &DeviceConfig<'a>, high: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    let (internal, touch) = variant.mutual(high);
    self.bus.write_object(dir, ObjectType::MultiTouch, t100::INTERNAL_THRESHOLD, internal).await?;
    if touch != 0 {
      self.bus.write_object(dir, ObjectType::MultiTouch, t100::TOUCH_THRESHOLD, touch).await?;
      self.bus.write_object(dir, ObjectType::DynamicData, variant.t71_touch_threshold_pos, touch).await?;
    }
    Ok(())
  }

  /// Glove and high-sensitivity mode.
  pub(super) async fn set_sensitivity(&mut self, on: bool) -> Result<(), Error<E>> {
    let ctx = self.context()?;
    let variant = self.variant(&ctx)?;
    let dir = &ctx.directory;
    let stylus = self.calibration.flags().stylus;

    let keys = if dir.contains(ObjectType::KeyArray) {
      Some(self.bus.read_object(dir, ObjectType::KeyArray, t15::CTRL).await?)
    } else {
      None
    };
    let glove = if on { t78::ALL_ENABLE } else { 0 };
    self.bus.write_object(dir, ObjectType::GloveDetection, t78::CTRL, glove).await?;

    let anti_touch = if on { variant.anti_touch_threshold_sensitive } else { ctx.saved.anti_touch_threshold };
    self.bus.write_object(dir, ObjectType::Retransmission, t80::ANTI_TOUCH_THRESHOLD, anti_touch).await?;
    self.write_mutual_thresholds(&ctx, &variant, on || stylus).await?;

    if let Some(ctrl) = keys {
      let ctrl = if on { ctrl | t15::ADAPTIVE_THRESHOLD } else { ctrl & !t15::ADAPTIVE_THRESHOLD };
      self.bus.write_object(dir, ObjectType::KeyArray, t15::CTRL, ctrl).await?;
    }

    self.calibration.update_flags(|f| f.sensitive = on);
    self.update_noise_mode(&ctx, on).await
  }

  /// Noisy mode and its linearity table follow the sensitivity setting.
  async fn update_noise_mode(&mut self, ctx: &Context, sensitive: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    if sensitive {
      let cfg = self.bus.read_object(dir, ObjectType::NoiseSuppressionDualX, t72::CFG1).await?;
      if cfg != t72::NOISY {
        self.bus.write_object(dir, ObjectType::NoiseSuppressionDualX, t72::CFG1, t72::NOISY).await?;
      }
    } else {
      self.bus.write_object(dir, ObjectType::NoiseSuppressionDualX, t72::CFG1, 0).await?;
    }
    let linearity = self.platform.linearity;
    for (reg, value) in linearity.values(sensitive) {
      self.bus.write_object(dir, ObjectType::MultiTouch, reg, value).await?;
    }
    Ok(())
  }

  /// Passive stylus mode.
  pub(super) async fn set_stylus(&mut self, on: bool) -> Result<(), Error<E>> {
    let ctx = self.context()?;
    let variant = self.variant(&ctx)?;
    let dir = &ctx.directory;
    let sensitive = self.calibration.flags().sensitive;

    let ctrl = self.bus.read_object(dir, ObjectType::Stylus, t47::CTRL).await?;
    let ctrl = if on { ctrl | t47::ENABLE } else { ctrl & !t47::ENABLE };
    self.bus.adjust_self(dir, &variant, &ctx.saved, SelfThreshold::InternalStylus, on).await?;
    self.bus.write_object(dir, ObjectType::Stylus, t47::CTRL, ctrl).await?;
    self.write_mutual_thresholds(&ctx, &variant, on || sensitive).await?;

    self.calibration.update_flags(|f| f.stylus = on);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use embassy_futures::block_on;
  use embassy_sync::blocking_mutex::raw::NoopRawMutex;

  use super::*;
  use crate::calibration::{Calibration, Command, CommandFailure};
  use crate::testing::{self, Clock, FakeBus, Layout};

  type Worker<'a> = Calibrator<'a, NoopRawMutex, FakeBus, Clock>;

  fn layout() -> Layout {
    Layout::new()
      .object(15, 11, 1, 1)
      .object(47, 10, 1, 1)
      .object(71, 40, 1, 0)
      .object(72, 20, 1, 1)
      .object(78, 12, 1, 1)
      .object(80, 8, 1, 1)
      .object(100, 60, 1, 12)
      .object(104, 12, 1, 0)
  }

  fn start(dir: &crate::object::ObjectDirectory) -> impl Fn(ObjectType) -> usize + '_ {
    move |kind| dir.lookup(kind).unwrap().start_address as usize
  }

  #[test]
  fn sensitivity_round_trip() {
    let (fake, dir) = layout().build();
    let cal: Calibration<NoopRawMutex> = Calibration::new();
    testing::publish(&cal, &dir);
    let at = start(&dir);
    fake.device().mem[at(ObjectType::KeyArray)] = 0x83;
    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), &cal);

    block_on(worker.execute(Command::Sensitivity(true))).unwrap();
    {
      let device = fake.device();
      let variant = testing::VARIANTS[0];
      assert_eq!(device.mem[at(ObjectType::GloveDetection)], 0xB9);
      assert_eq!(device.mem[at(ObjectType::KeyArray)], 0x87);
      assert_eq!(device.mem[at(ObjectType::Retransmission) + 4], variant.anti_touch_threshold_sensitive);
      assert_eq!(device.mem[at(ObjectType::MultiTouch) + 32], variant.mutual_internal_threshold_sensitive);
      assert_eq!(device.mem[at(ObjectType::MultiTouch) + 30], variant.mutual_touch_threshold_sensitive);
      assert_eq!(device.mem[at(ObjectType::DynamicData) + variant.t71_touch_threshold_pos as usize], variant.mutual_touch_threshold_sensitive);
      assert_eq!(device.mem[at(ObjectType::NoiseSuppressionDualX) + 2], 1);
      for (reg, value) in testing::platform().linearity.values(true) {
        assert_eq!(device.mem[at(ObjectType::MultiTouch) + reg as usize], value);
      }
    }
    assert!(cal.sensitive());

    block_on(worker.execute(Command::Sensitivity(false))).unwrap();
    let device = fake.device();
    let variant = testing::VARIANTS[0];
    assert_eq!(device.mem[at(ObjectType::GloveDetection)], 0);
    assert_eq!(device.mem[at(ObjectType::KeyArray)], 0x83);
    assert_eq!(device.mem[at(ObjectType::Retransmission) + 4], testing::saved().anti_touch_threshold);
    assert_eq!(device.mem[at(ObjectType::MultiTouch) + 32], variant.mutual_internal_threshold);
    assert_eq!(device.mem[at(ObjectType::NoiseSuppressionDualX) + 2], 0);
    assert!(!cal.sensitive());
  }

  #[test]
  fn stylus_keeps_high_thresholds_when_sensitivity_drops() {
    let (fake, dir) = layout().build();
    let cal: Calibration<NoopRawMutex> = Calibration::new();
    testing::publish(&cal, &dir);
    let at = start(&dir);
    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), &cal);
    let variant = testing::VARIANTS[0];

    block_on(worker.execute(Command::Stylus(true))).unwrap();
    assert_eq!(fake.device().mem[at(ObjectType::Stylus)] & 1, 1);
    assert_eq!(fake.device().mem[at(ObjectType::AuxTouch) + 4], variant.self_internal_threshold_stylus);
    block_on(worker.execute(Command::Sensitivity(true))).unwrap();
    block_on(worker.execute(Command::Sensitivity(false))).unwrap();
    assert_eq!(fake.device().mem[at(ObjectType::MultiTouch) + 32], variant.mutual_internal_threshold_sensitive);

    block_on(worker.execute(Command::Stylus(false))).unwrap();
    assert_eq!(fake.device().mem[at(ObjectType::Stylus)] & 1, 0);
    assert_eq!(fake.device().mem[at(ObjectType::AuxTouch) + 4], testing::saved().self_internal_threshold);
    assert_eq!(fake.device().mem[at(ObjectType::MultiTouch) + 32], variant.mutual_internal_threshold);
    assert!(!cal.stylus());
  }

  #[test]
  fn stylus_needs_t47() {
    let (fake, dir) = Layout::new().object(100, 60, 1, 12).build();
    let cal: Calibration<NoopRawMutex> = Calibration::new();
    testing::publish(&cal, &dir);
    let mut worker: Worker = Calibrator::new(fake, Clock::default(), testing::platform(), &cal);
    let result = block_on(worker.execute(Command::Stylus(true))).map_err(CommandFailure::from);
    assert_eq!(result, Err(CommandFailure::MissingObject(ObjectType::Stylus)));
    assert!(!cal.stylus());
  }
}
