use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use super::worker::MONITOR_PERIOD;
use super::{Calibrator, Context, GoldenFailure, Risk, SessionGuard, SessionKind};
use crate::control::GoldenCommand;
use crate::message::{GoldenPhase, GoldenStatus};
use crate::reg::{t72, t8, ObjectType};
use crate::Error;

const GOLDEN_RETRIES: u8 = 5;
const GOLDEN_POLL: u32 = 10;
const GOLDEN_POLLS: u16 = 1000;
const CURRENT_TUNE_POLLS: u16 = 200;
const PRIME_SETTLE: u32 = 100;
const VERIFY_SAMPLES: u8 = 3;

impl<'a, M, I, E, D> Calibrator<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  E: embedded_hal::i2c::Error,
  D: DelayNs,
{
  /// Generate, store and verify golden references for single and dual X
  /// noise modes. The controller is reset and recalibrated afterwards
  /// whatever the outcome.
  pub(super) async fn generate_golden(&mut self) -> Result<(), Error<E>> {
    let ctx = self.context()?;
    let dir = &ctx.directory;
    self.calibration.update_flags(|f| {
      f.recalib_available = false;
      f.golden_ok = false;
    });
    if !dir.contains(ObjectType::GoldenReference) {
      self.calibration.update_flags(|f| f.recalib_available = true);
      return Err(Error::MissingObject(ObjectType::GoldenReference));
    }

    let result = self.golden_sequence(&ctx).await;

    let restored = match self.bus.soft_reset(dir).await {
      Ok(()) => self.bus.calibrate(dir).await,
      Err(e) => Err(e),
    };
    let ok = result.is_ok();
    self.calibration.update_flags(|f| {
      f.recalib_available = true;
      f.golden_ok = ok;
    });
    info!("golden reference generation ok: {}", ok);
    result.and(restored)
  }

  async fn golden_sequence(&mut self, ctx: &Context) -> Result<(), Error<E>> {
    self.bus.soft_reset(&ctx.directory).await?;
    for dual_x in [false, true] {
      self.golden_tune(ctx, dual_x).await?;
      self.bus.soft_reset(&ctx.directory).await?;
      self.check_golden(ctx, dual_x).await?;
      if !self.verify_golden(ctx, dual_x).await? {
        return Err(Error::Golden(GoldenFailure::Unverified));
      }
    }
    Ok(())
  }

  async fn select_noise_mode(&mut self, ctx: &Context, dual_x: bool) -> Result<(), Error<E>> {
    if dual_x {
      self.bus.write_object(&ctx.directory, ObjectType::NoiseSuppressionDualX, t72::CALCFG, t72::VERY_NOISY).await?;
    }
    Ok(())
  }

  async fn prepare_golden(&mut self, ctx: &Context, dual_x: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    self.bus.write_object_bytes(dir, ObjectType::Acquire, t8::ANTI_CALIB, &t8::ANTI_CALIB_OFF).await?;
    self.bus.write_object(dir, ObjectType::Acquire, t8::MEAS_ALLOW, t8::MEAS_ALLOW_MUTUAL | t8::MEAS_ALLOW_SELF).await?;
    self.bus.set_golden(dir, false).await?;
    self.select_noise_mode(ctx, dual_x).await?;
    self.bus.calibrate(dir).await
  }

  /// Wait for the next golden status, or `None` once the deadline passes.
  async fn wait_golden(&mut self, session: &SessionGuard<'a, M>, polls: u16) -> Result<Option<GoldenStatus>, Error<E>> {
    session.arm(polls);
    loop {
      if let Some(status) = session.take_golden() {
        trace!("golden status 0x{:02x}", status.into_bits());
        return Ok(Some(status));
      }
      if !session.tick() {
        return Ok(None);
      }
      self.pause(GOLDEN_POLL).await?;
    }
  }

  async fn abandon(&mut self, ctx: &Context, failure: GoldenFailure) -> Result<(), Error<E>> {
    warn!("golden reference abandoned: {:?}", failure);
    self.bus.set_golden(&ctx.directory, false).await?;
    Err(Error::Golden(failure))
  }

  async fn golden_tune(&mut self, ctx: &Context, dual_x: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    let calibration = self.calibration;
    let session = calibration.begin(SessionKind::GoldenGenerate, GOLDEN_RETRIES).ok_or(Error::Busy)?;
    self.prepare_golden(ctx, dual_x).await?;
    self.pause(PRIME_SETTLE).await?;
    session.clear_golden();
    self.bus.golden_command(dir, GoldenCommand::Prime, false).await?;

    loop {
      let Some(status) = self.wait_golden(&session, GOLDEN_POLLS).await? else {
        warn!("no golden status");
        return Err(Error::Timeout);
      };
      match status.phase() {
        GoldenPhase::SeqError => {
          if !session.retry() {
            return self.abandon(ctx, GoldenFailure::RetriesExhausted).await;
          }
          self.bus.golden_command(dir, GoldenCommand::None, false).await?;
          self.pause(PRIME_SETTLE).await?;
          self.bus.golden_command(dir, GoldenCommand::Prime, false).await?;
        }
        GoldenPhase::Idle => {
          self.bus.golden_command(dir, GoldenCommand::None, false).await?;
          return Ok(());
        }
        GoldenPhase::Prime => self.bus.golden_command(dir, GoldenCommand::Generate, false).await?,
        GoldenPhase::GeneratePass => self.bus.golden_command(dir, GoldenCommand::Confirm, false).await?,
        GoldenPhase::GenerateFail => {
          self.bus.golden_command(dir, GoldenCommand::None, false).await?;
          return self.abandon(ctx, GoldenFailure::GenerateFailed).await;
        }
        GoldenPhase::Generate => {}
        GoldenPhase::Invalid => {
          if !session.retry() {
            return self.abandon(ctx, GoldenFailure::RetriesExhausted).await;
          }
          self.bus.golden_command(dir, GoldenCommand::Prime, false).await?;
        }
      }
    }
  }

  /// After reset the firmware reports whether the stored references loaded.
  async fn check_golden(&mut self, ctx: &Context, dual_x: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    self.select_noise_mode(ctx, dual_x).await?;
    let calibration = self.calibration;
    let session = calibration.begin(SessionKind::GoldenGenerate, 0).ok_or(Error::Busy)?;
    self.bus.set_golden(dir, true).await?;
    self.bus.report_all(dir).await?;
    match self.wait_golden(&session, GOLDEN_POLLS).await? {
      Some(status) if status.bad_stored_data() => Err(Error::Golden(GoldenFailure::BadStoredData)),
      Some(_) => Ok(()),
      None => Err(Error::Timeout),
    }
  }

  /// Stored references are good when a few mutual delta samples stay quiet.
  async fn verify_golden(&mut self, ctx: &Context, dual_x: bool) -> Result<bool, Error<E>> {
    self.select_noise_mode(ctx, dual_x).await?;
    self.pause(PRIME_SETTLE).await?;
    for sample in 0..VERIFY_SAMPLES {
      if sample > 0 {
        self.pause(MONITOR_PERIOD).await?;
      }
      if self.mutual_delta_risk(ctx).await? != Risk::None {
        return Ok(false);
      }
    }
    Ok(true)
  }

  /// Regenerate golden references from the current signal after the panel
  /// has settled.
  pub(super) async fn current_tune(&mut self, ctx: &Context) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    if !dir.contains(ObjectType::GoldenReference) {
      return Err(Error::MissingObject(ObjectType::GoldenReference));
    }
    let calibration = self.calibration;
    let session = calibration.begin(SessionKind::GoldenCurrentTune, GOLDEN_RETRIES).ok_or(Error::Busy)?;
    self.bus.golden_command(dir, GoldenCommand::Prime, true).await?;

    loop {
      let phase = self.wait_golden(&session, CURRENT_TUNE_POLLS).await?.map(|s| s.phase());
      match phase {
        Some(GoldenPhase::Prime) => self.bus.golden_command(dir, GoldenCommand::Generate, true).await?,
        Some(GoldenPhase::Idle) => {
          self.bus.golden_command(dir, GoldenCommand::None, true).await?;
          return Ok(());
        }
        _ => {
          if !session.retry() {
            return Err(Error::Golden(GoldenFailure::RetriesExhausted));
          }
          self.bus.golden_command(dir, GoldenCommand::Prime, true).await?;
        }
      }
    }
  }
}
