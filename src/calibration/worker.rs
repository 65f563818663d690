use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use super::queue::Entry;
use super::risk::{discount_touch, scan_delta, scan_reference, IgnoreLines, ReferenceMode};
use super::{Calibration, Command, CommandFailure, Context, Risk, SessionKind, Task};
use crate::config::{DeviceConfig, Platform};
use crate::reg::{t25, t37, t6, ObjectType};
use crate::rw::Bus;
use crate::Error;

pub(crate) const MUTUAL_DATA_LEN: usize = 0x438;
pub(crate) const SELF_DATA_LEN: usize = 0x5A;
const DIAG_PAGES: usize = MUTUAL_DATA_LEN.div_ceil(t37::PAGE_SIZE);
const DIAG_BUFFER: usize = DIAG_PAGES * t37::PAGE_SIZE;

/// Delay between monitor samples and before follow-up tasks.
pub(crate) const MONITOR_PERIOD: u32 = 1000;
const SETTLE_POLL: u32 = 100;
const SETTLE_POLLS: u16 = 50;
/// Added to the surveyed reference difference.
const REFERENCE_MARGIN: u16 = 50;
const SELF_TEST_POLL: u32 = 10;
const SELF_TEST_POLLS: u16 = 100;

/// Background half of the driver.
///
/// Owns its own bus handle and runs every long sequence: golden reference
/// generation, self-cap tuning, interference monitoring and mode switches.
/// Spawn [`Calibrator::run`] on an executor, or drive [`Calibrator::step`]
/// by hand.
pub struct Calibrator<'a, M: RawMutex, I, D> {
  pub(super) bus: Bus<I, D>,
  pub(super) platform: Platform<'a>,
  pub(super) calibration: &'a Calibration<M>,
  diag: [u8; DIAG_BUFFER],
}

impl<'a, M, I, E, D> Calibrator<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  E: embedded_hal::i2c::Error,
  D: DelayNs,
{
  pub fn new(i2c: I, delay: D, platform: Platform<'a>, calibration: &'a Calibration<M>) -> Self {
    Self {
      bus: Bus::new(i2c, delay, platform.address),
      platform,
      calibration,
      diag: [0; DIAG_BUFFER],
    }
  }

  pub async fn run(&mut self) -> ! {
    loop {
      self.step().await;
    }
  }

  /// Wait for one command or task and carry it out. Commands go first.
  pub async fn step(&mut self) {
    loop {
      if let Some(command) = self.calibration.take_command() {
        self.calibration.reset_cancel();
        let result = self.execute(command).await.map_err(CommandFailure::from);
        if let Err(e) = result {
          warn!("{:?} failed: {:?}", command, e);
        }
        self.calibration.finish_command(result);
        return;
      }
      let next = self.calibration.lock(|s| s.queue.next());
      if let Some(entry) = next {
        self.run_task(entry).await;
        return;
      }
      self.calibration.wait_for_work().await;
    }
  }

  /// Carry out `command` right away, bypassing the command slot.
  pub async fn execute(&mut self, command: Command) -> Result<(), Error<E>> {
    info!("{:?}", command);
    match command {
      Command::GenerateGoldenReference => self.generate_golden().await,
      Command::GoldenReference(on) => {
        let ctx = self.context()?;
        self.bus.set_golden(&ctx.directory, on).await?;
        self.calibration.update_flags(|f| f.golden_enabled = on);
        Ok(())
      }
      Command::SelfTune { persist } => {
        let ctx = self.context()?;
        self.self_tune(&ctx, persist).await
      }
      Command::Sensitivity(on) => self.set_sensitivity(on).await,
      Command::Stylus(on) => self.set_stylus(on).await,
      Command::DiagnosticMode(mode) => {
        self.calibration.lock(|s| s.diag_mode = mode);
        Ok(())
      }
      Command::ChipReset => {
        self.calibration.update_flags(|f| {
          f.recalib_available = false;
          f.reset_requested = true;
        });
        Ok(())
      }
    }
  }

  async fn run_task(&mut self, entry: Entry) {
    self.calibration.reset_cancel();
    if entry.delay_ms > 0 && self.pause(entry.delay_ms).await.is_err() {
      debug!("{:?} cancelled before start", entry.task);
      self.calibration.lock(|s| s.queue.finish());
      return;
    }
    self.calibration.lock(|s| s.queue.start());

    let result = match self.context() {
      Ok(ctx) => match entry.task {
        Task::UpdateSetting => self.update_setting(&ctx).await,
        Task::DisableAntiCalib => self.disable_anti_calib(&ctx).await,
        Task::PreUse => self.pre_use(&ctx).await,
      },
      Err(e) => Err(e),
    };
    match result {
      Ok(()) => {}
      Err(Error::Cancelled) => debug!("{:?} cancelled", entry.task),
      Err(e) => warn!("{:?} failed: {:?}", entry.task, CommandFailure::from(e)),
    }
    self.calibration.lock(|s| s.queue.finish());
  }

  pub(super) fn context(&self) -> Result<Context, Error<E>> {
    self.calibration.context().ok_or(Error::NotInitialized)
  }

  pub(super) fn variant(&self, ctx: &Context) -> Result<DeviceConfig<'a>, Error<E>> {
    self.platform.variant(ctx.variant).copied().ok_or(Error::NotInitialized)
  }

  /// Sleep that ends early, with `Cancelled`, when the running task is
  /// cancelled.
  pub(super) async fn pause(&mut self, ms: u32) -> Result<(), Error<E>> {
    if self.calibration.cancelled() {
      return Err(Error::Cancelled);
    }
    select(self.bus.delay.delay_ms(ms), self.calibration.wait_cancel()).await;
    if self.calibration.cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }

  fn reschedule(&self, task: Task) -> Result<(), Error<E>> {
    if self.calibration.cancelled() {
      return Err(Error::Cancelled);
    }
    self.calibration.schedule(task, MONITOR_PERIOD);
    Ok(())
  }

  async fn update_setting(&mut self, ctx: &Context) -> Result<(), Error<E>> {
    let flags = self.calibration.flags();
    let risk = if flags.golden_enabled { self.self_delta_risk(ctx).await? } else { self.reference_risk(ctx).await? };
    let (saturated, count) = self.calibration.lock(|s| (s.ratchet.record(risk), s.ratchet.count()));
    debug!("monitor {:?}, ratchet {}", risk, count);

    if risk == Risk::Present && (!flags.golden_enabled || flags.sensitive) {
      self.bus.calibrate(&ctx.directory).await?;
    }
    if saturated {
      info!("panel settled");
      self.reschedule(Task::DisableAntiCalib)
    } else {
      self.reschedule(Task::UpdateSetting)
    }
  }

  async fn disable_anti_calib(&mut self, ctx: &Context) -> Result<(), Error<E>> {
    {
      let calibration = self.calibration;
      let _session = calibration.begin(SessionKind::AntiCalib, 0).ok_or(Error::Busy)?;
      self.bus.set_anti_calib(&ctx.directory, &ctx.saved, false).await?;
      self.bus.set_self_recalib(&ctx.directory, &ctx.saved, false).await?;
    }

    let flags = self.calibration.flags();
    if !flags.use_last_golden && !flags.golden_enabled {
      match self.current_tune(ctx).await {
        Ok(()) => self.calibration.update_flags(|f| f.use_last_golden = true),
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => warn!("golden tune from current data failed: {:?}", CommandFailure::from(e)),
      }
    }
    Ok(())
  }

  /// Sample until mutual delta, or self delta when asked, shows no risk.
  async fn settle(&mut self, ctx: &Context, include_self: bool) -> Result<bool, Error<E>> {
    for _ in 0..SETTLE_POLLS {
      if self.mutual_delta_risk(ctx).await? == Risk::None {
        return Ok(true);
      }
      if include_self && self.self_delta_risk(ctx).await? == Risk::None {
        return Ok(true);
      }
      self.pause(SETTLE_POLL).await?;
    }
    Ok(false)
  }

  /// First use after initialize: tune self-cap, survey noisy reference
  /// lines once, then let the panel settle and calibrate.
  async fn pre_use(&mut self, ctx: &Context) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    match self.self_tune(ctx, false).await {
      Err(Error::Cancelled) => return Err(Error::Cancelled),
      Err(e) => warn!("self-cap tune failed: {:?}", CommandFailure::from(e)),
      Ok(()) => {}
    }

    let flags = self.calibration.flags();
    if !flags.golden_enabled && !flags.ignore_lines_saved {
      self.bus.set_golden(dir, true).await?;
      self.bus.set_anti_calib(dir, &ctx.saved, false).await?;
      self.bus.set_self_recalib(dir, &ctx.saved, false).await?;
      self.pause(MONITOR_PERIOD).await?;
      if !self.settle(ctx, false).await? {
        warn!("mutual delta never settled");
      }

      self.bus.set_anti_calib(dir, &ctx.saved, true).await?;
      self.bus.set_self_recalib(dir, &ctx.saved, true).await?;
      self.bus.set_golden(dir, false).await?;
      self.bus.calibrate(dir).await?;
      self.pause(2 * MONITOR_PERIOD).await?;

      let max = self.survey_reference(ctx).await?;
      let configured = self.platform.reference_threshold;
      self.calibration.lock(|s| {
        if s.ignore.saturated() {
          s.reference_threshold = if max > configured || max <= configured / 2 {
            max.saturating_add(REFERENCE_MARGIN)
          } else {
            configured
          };
          s.ignore.clear();
        } else {
          s.reference_threshold = max.saturating_add(REFERENCE_MARGIN);
        }
        s.flags.ignore_lines_saved = true;
        info!("reference threshold {}", s.reference_threshold);
      });
    }

    self.calibration.update_flags(|f| f.recalib_available = true);
    if !self.settle(ctx, true).await? {
      warn!("panel never settled before first use");
    }
    self.bus.calibrate(dir).await
  }

  /// Read `len` bytes of T37 data in `mode` into the scratch buffer.
  async fn read_diagnostic(&mut self, ctx: &Context, mode: u8, len: usize) -> Result<&[u8], Error<E>> {
    let dir = &ctx.directory;
    let t37 = dir.lookup(ObjectType::Diagnostic).ok_or(Error::MissingObject(ObjectType::Diagnostic))?;
    let data = t37.start_address + t37::DATA;
    let len = len.min(DIAG_BUFFER);

    self.bus.diagnostic(dir, mode).await?;
    let mut read = 0;
    while read < len {
      self.bus.read(data, &mut self.diag[read..read + t37::PAGE_SIZE]).await?;
      read += t37::PAGE_SIZE;
      if read < len {
        self.bus.diagnostic(dir, t6::DIAG_PAGE_UP).await?;
      }
    }
    Ok(&self.diag[..len])
  }

  pub(super) async fn mutual_delta_risk(&mut self, ctx: &Context) -> Result<Risk, Error<E>> {
    let threshold = self.variant(ctx)?.mutual_no_touch_threshold;
    let buf = self.read_diagnostic(ctx, t6::DIAG_MUTUAL_DELTA, MUTUAL_DATA_LEN).await?;
    Ok(scan_delta(buf, threshold))
  }

  pub(super) async fn self_delta_risk(&mut self, ctx: &Context) -> Result<Risk, Error<E>> {
    let threshold = self.variant(ctx)?.self_no_touch_threshold;
    let buf = self.read_diagnostic(ctx, t6::DIAG_SELF_DELTA, SELF_DATA_LEN).await?;
    let risk = scan_delta(buf, threshold);
    let (unlocked, touches) = self.calibration.lock(|s| (s.flags.unlocked, s.touch_count));
    Ok(discount_touch(risk, unlocked, touches))
  }

  async fn reference_risk(&mut self, ctx: &Context) -> Result<Risk, Error<E>> {
    let (rx, tx) = (self.platform.rx_lines, self.platform.tx_lines);
    let (ignore, threshold) = self.calibration.lock(|s| (s.ignore.clone(), s.reference_threshold));
    let buf = self.read_diagnostic(ctx, t6::DIAG_MUTUAL_REFERENCE, MUTUAL_DATA_LEN).await?;
    Ok(scan_reference(buf, rx, tx, threshold, ReferenceMode::Check(&ignore)).0)
  }

  /// Record noisy reference lines and return the largest neighbour difference.
  async fn survey_reference(&mut self, ctx: &Context) -> Result<u16, Error<E>> {
    let (rx, tx) = (self.platform.rx_lines, self.platform.tx_lines);
    let threshold = self.platform.reference_threshold;
    let buf = self.read_diagnostic(ctx, t6::DIAG_MUTUAL_REFERENCE, MUTUAL_DATA_LEN).await?;
    let mut ignore = IgnoreLines::new();
    let (_, max) = scan_reference(buf, rx, tx, threshold, ReferenceMode::Survey(&mut ignore));
    debug!("reference survey: max {}, {} rx and {} tx lines ignored", max, ignore.rx.len(), ignore.tx.len());
    self.calibration.lock(|s| s.ignore = ignore);
    Ok(max)
  }

  /// Copy one full diagnostic dump in the selected mode into `out`.
  pub async fn diagnostic_data(&mut self, out: &mut [u8]) -> Result<usize, Error<E>> {
    let ctx = self.context()?;
    let mode = self.calibration.lock(|s| s.diag_mode);
    let buf = self.read_diagnostic(&ctx, mode, MUTUAL_DATA_LEN).await?;
    let n = buf.len().min(out.len());
    out[..n].copy_from_slice(&buf[..n]);
    Ok(n)
  }

  /// Run every T25 self test. The report arrives as a message; read it with
  /// [`Calibration::self_test_result`].
  pub async fn self_test(&mut self) -> Result<(), Error<E>> {
    let ctx = self.context()?;
    let dir = &ctx.directory;
    self.calibration.lock(|s| s.self_test = None);
    self.bus.write_object(dir, ObjectType::SelfTest, t25::CMD, t25::RUN_ALL).await?;
    for _ in 0..SELF_TEST_POLLS {
      self.bus.sleep(SELF_TEST_POLL).await;
      if self.bus.read_object(dir, ObjectType::SelfTest, t25::CMD).await? == 0 {
        return Ok(());
      }
    }
    Err(Error::Timeout)
  }
}
