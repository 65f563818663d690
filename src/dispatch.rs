//! Message transport and per-object handlers.
//!
//! With a T44 message count object the first transfer returns the count and
//! the first record together. Without one the driver guesses from the last
//! interrupt and keeps reading pairs until it sees the `0xFF` sentinel.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};
use heapless::Vec;

use crate::calibration::{Task, MONITOR_PERIOD};
use crate::control::{CommandStatus, SelfThreshold};
use crate::defs::{MAX_KEYS, MAX_MESSAGE_SIZE, MESSAGE_BATCH, NO_MESSAGE};
use crate::event::{Frame, InputEvent, InputSink};
use crate::message::*;
use crate::object::ObjectDirectory;
use crate::reg::{t100, ObjectType};
use crate::touchpad::{Outcome, Report};
use crate::{Error, Maxtouch, State};

/// Handler for one report id, with the index local to its object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Route {
  LegacyTouch(u8),
  Touch(u8),
  Stylus(u8),
  Keys,
  Gpio,
  SelfTest,
  Command,
  Suppression,
  Noise,
  Golden,
  SelfCap,
}

/// Objects whose messages are handled, in lookup order.
const ROUTED: [ObjectType; 11] = [
  ObjectType::LegacyMultiTouch,
  ObjectType::ActiveStylus,
  ObjectType::KeyArray,
  ObjectType::Gpio,
  ObjectType::SelfTest,
  ObjectType::Command,
  ObjectType::NoiseSuppression,
  ObjectType::TouchSuppression,
  ObjectType::GoldenReference,
  ObjectType::MultiTouch,
  ObjectType::SelfCap,
];

/// Report id ranges of the handled objects, cached at initialize.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReportRoutes {
  ranges: Vec<(ObjectType, u8, u8), { ROUTED.len() }>,
}

impl ReportRoutes {
  pub(crate) const fn new() -> Self {
    Self { ranges: Vec::new() }
  }

  pub(crate) fn build(dir: &ObjectDirectory) -> Self {
    let mut ranges = Vec::new();
    for kind in ROUTED {
      if let Some(ids) = dir.lookup(kind).and_then(|o| o.report_ids()) {
        // One entry per kind, never more than ROUTED.len().
        let _ = ranges.push((kind, *ids.start(), *ids.end()));
      }
    }
    Self { ranges }
  }

  pub(crate) fn classify(&self, id: u8) -> Option<Route> {
    let &(kind, min, _) = self.ranges.iter().find(|(_, min, max)| (*min..=*max).contains(&id))?;
    let local = id - min;
    Some(match kind {
      ObjectType::LegacyMultiTouch => Route::LegacyTouch(local),
      ObjectType::ActiveStylus => Route::Stylus(local),
      ObjectType::KeyArray => Route::Keys,
      ObjectType::Gpio => Route::Gpio,
      ObjectType::SelfTest => Route::SelfTest,
      ObjectType::Command => Route::Command,
      ObjectType::NoiseSuppression => Route::Noise,
      ObjectType::TouchSuppression => Route::Suppression,
      ObjectType::GoldenReference => Route::Golden,
      ObjectType::MultiTouch => Route::Touch(local),
      ObjectType::SelfCap => Route::SelfCap,
      _ => return None,
    })
  }

  /// Report ids claimed by `kind`, counted across instances.
  pub(crate) fn count(&self, kind: ObjectType) -> u16 {
    self
      .ranges
      .iter()
      .find(|(k, _, _)| *k == kind)
      .map(|(_, min, max)| (*max - *min) as u16 + 1)
      .unwrap_or(0)
  }
}

impl<'a, M, I, E, D> Maxtouch<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  /// Service the CHG interrupt.
  ///
  /// Handles a pending chip reset request, then reads and dispatches every
  /// pending message. A bus error triggers one attempt to initialize the
  /// controller again; the error surfaces if that fails too.
  pub async fn service<S: InputSink + ?Sized>(&mut self, now_ms: u32, sink: &mut S) -> Result<usize, Error<E>> {
    let reset = self.calibration.lock(|s| core::mem::take(&mut s.flags.reset_requested));
    if reset {
      info!("chip reset requested");
      self.release_all(sink);
      self.soft_reset().await?;
      self.initialize().await?;
      return Ok(0);
    }

    match self.poll(now_ms, sink).await {
      Err(Error::I2c(e)) if !self.reinit_tried => {
        warn!("bus error, initializing again");
        self.reinit_tried = true;
        self.release_all(sink);
        match self.initialize().await {
          Ok(()) => Ok(0),
          Err(Error::I2c(_)) => Err(Error::I2c(e)),
          Err(other) => Err(other),
        }
      }
      Ok(n) => {
        self.reinit_tried = false;
        Ok(n)
      }
      Err(e) => Err(e),
    }
  }

  /// Read and dispatch pending messages. Returns the number of records
  /// handled. A suspended driver reads nothing.
  pub async fn poll<S: InputSink + ?Sized>(&mut self, now_ms: u32, sink: &mut S) -> Result<usize, Error<E>> {
    if self.state != State::Application {
      return Err(Error::NotInitialized);
    }
    if self.suspended {
      return Ok(0);
    }
    self.now = now_ms;
    let mut frame = Frame::new(sink);
    let result = if self.directory.contains(ObjectType::MessageCount) {
      self.read_counted(&mut frame).await
    } else {
      self.read_polled(&mut frame).await
    };
    frame.close();
    result
  }

  async fn read_counted<S: InputSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize, Error<E>> {
    let size = self.directory.message_size();
    let t44 = self.directory.lookup(ObjectType::MessageCount).ok_or(Error::MissingObject(ObjectType::MessageCount))?;
    self.bus.read(t44.start_address, &mut self.messages[..size + 1]).await?;

    let mut count = self.messages[0];
    if count == 0 {
      warn!("interrupt without messages");
      return Ok(0);
    }
    let max = self.directory.max_report_id();
    if count > max {
      warn!("message count {} above {}, clamped", count, max);
      count = max;
    }

    let mut first: Record = [0; MAX_MESSAGE_SIZE];
    first[..size].copy_from_slice(&self.messages[1..size + 1]);
    if first[0] == NO_MESSAGE {
      warn!("message count {} but queue empty", count);
      return Err(Error::UnexpectedMessage);
    }
    self.handle(&first, sink).await?;
    let rest = self.read_batch(count as usize - 1, sink).await?;
    Ok(1 + rest)
  }

  async fn read_polled<S: InputSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize, Error<E>> {
    let max = self.directory.max_report_id() as usize;
    let count = if (1..=max).contains(&self.last_count) { self.last_count } else { 1 };
    // A full queue holds at most one record per touch report id.
    let touch_ids = self.routes.count(ObjectType::MultiTouch).max(self.routes.count(ObjectType::LegacyMultiTouch)) as usize;
    let ceiling = if touch_ids == 0 { max } else { touch_ids };

    let mut total = self.read_batch(count + 1, sink).await?;
    if total > count {
      loop {
        let n = self.read_batch(2, sink).await?;
        total += n;
        if n < 2 {
          break;
        }
        if total >= ceiling {
          warn!("message queue stuck after {} records", total);
          self.last_count = total;
          return Err(Error::MessageStuck);
        }
      }
    }
    self.last_count = total;
    Ok(total)
  }

  /// Read up to `count` records from T5 and handle them in order, stopping
  /// at the first empty slot. Returns how many were valid.
  async fn read_batch<S: InputSink + ?Sized>(&mut self, count: usize, sink: &mut S) -> Result<usize, Error<E>> {
    let size = self.directory.message_size();
    let t5 = self.directory.lookup(ObjectType::Message).ok_or(Error::MissingObject(ObjectType::Message))?.start_address;
    let mut handled = 0;
    let mut left = count;
    while left > 0 {
      let n = left.min(MESSAGE_BATCH);
      self.bus.read(t5, &mut self.messages[..n * size]).await?;
      for i in 0..n {
        let mut record: Record = [0; MAX_MESSAGE_SIZE];
        record[..size].copy_from_slice(&self.messages[i * size..(i + 1) * size]);
        if record[0] == NO_MESSAGE {
          return Ok(handled);
        }
        self.handle(&record, sink).await?;
        handled += 1;
      }
      left -= n;
    }
    Ok(handled)
  }

  /// Handle everything queued, without events. Gives up with
  /// `MessageStuck` after two full batches.
  pub(crate) async fn drain<S: InputSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), Error<E>> {
    let max = self.directory.max_report_id() as usize;
    if max == 0 {
      return Ok(());
    }
    for _ in 0..2 {
      if self.read_batch(max, sink).await? < max {
        return Ok(());
      }
    }
    warn!("message queue never drained");
    Err(Error::MessageStuck)
  }

  /// Empty the queue without dispatching, reporting whether the controller
  /// announced a calibration meanwhile.
  pub(crate) async fn drain_for_calibration(&mut self) -> Result<bool, Error<E>> {
    let size = self.directory.message_size();
    let t5 = self.directory.lookup(ObjectType::Message).ok_or(Error::MissingObject(ObjectType::Message))?.start_address;
    let t6 = self.directory.lookup(ObjectType::Command).and_then(|o| o.report_ids());
    let mut calibrating = false;
    for _ in 0..2 * self.directory.max_report_id() as usize {
      self.bus.read(t5, &mut self.messages[..size]).await?;
      let id = self.messages[0];
      if id == NO_MESSAGE {
        return Ok(calibrating);
      }
      if t6.as_ref().is_some_and(|ids| ids.contains(&id)) && CommandStatus::from_bits(self.messages[1]).calibrating() {
        calibrating = true;
      }
    }
    Err(Error::MessageStuck)
  }

  async fn handle<S: InputSink + ?Sized>(&mut self, msg: &Record, sink: &mut S) -> Result<(), Error<E>> {
    let Some(route) = self.routes.classify(msg[0]) else {
      trace!("report id {} unhandled", msg[0]);
      return Ok(());
    };
    match route {
      Route::Command => self.command_status(msg).await?,
      Route::LegacyTouch(index) => {
        let report = decode_legacy_touch(index, msg, self.max_x, self.max_y);
        self.finger(&report, sink).await?;
      }
      Route::Touch(0) => {
        let status = ScreenStatus::from_bits(msg[1]);
        let count = msg[2];
        self.tracker.screen_status(count, status.suppressed(), sink);
        self.calibration.lock(|s| s.touch_count = count);
      }
      Route::Touch(index) if index < t100::FIRST_FINGER => {}
      Route::Touch(index) => {
        let report = decode_touch(index - t100::FIRST_FINGER, msg, self.aux);
        self.finger(&report, sink).await?;
      }
      Route::Stylus(index) => {
        let (report, tool) = decode_stylus(index, msg);
        self.tracker.stylus(&report, tool, sink);
      }
      Route::Keys => self.keys(msg[2], sink),
      Route::Gpio => {
        let vendor = msg[1] & self.platform.gpio_mask;
        debug!("vendor id 0x{:02x}", vendor);
        self.vendor_id = Some(vendor);
      }
      Route::SelfTest => {
        let mut result = [0u8; 6];
        result.copy_from_slice(&msg[1..7]);
        info!("self test result {:?}", result);
        self.calibration.lock(|s| s.self_test = Some(result));
      }
      Route::Suppression => {
        if msg[1] & 0x01 != 0 {
          info!("touch suppressed");
        } else {
          info!("touch suppression released");
        }
      }
      Route::Noise => {
        let status = NoiseStatus::from_bits(msg[1]);
        debug!("noise status 0x{:02x} state {} level {}", status.into_bits(), msg[4], msg[3]);
      }
      Route::Golden => self.calibration.deliver_golden(msg[1]),
      Route::SelfCap => {
        if msg[2] == SELF_CAP_TUNE_DONE {
          self.calibration.deliver_selfcap(SelfCapStatus { cause: msg[2], error: msg[3] });
        }
      }
    }
    Ok(())
  }

  async fn finger<S: InputSink + ?Sized>(&mut self, report: &Report, sink: &mut S) -> Result<(), Error<E>> {
    if self.tracker.finger(self.now, report, sink) == Outcome::Unlocked {
      self.calibration.update_flags(|f| f.unlocked = true);
      self.restore_self_thresholds().await?;
    }
    Ok(())
  }

  async fn restore_self_thresholds(&mut self) -> Result<(), Error<E>> {
    let Some(variant) = self.variant().copied() else {
      return Ok(());
    };
    for which in [SelfThreshold::Touch, SelfThreshold::InternalSuspend] {
      self.bus.adjust_self(&self.directory, &variant, &self.saved, which, false).await?;
    }
    Ok(())
  }

  async fn command_status(&mut self, msg: &Record) -> Result<(), Error<E>> {
    let crc = config_crc(msg);
    if crc != self.config_crc {
      debug!("config CRC 0x{:06x}", crc);
      self.config_crc = crc;
    }

    let status = CommandStatus::from_bits(msg[1]);
    if status.into_bits() != 0 {
      debug!(
        "T6 status reset {} overflow {} signal error {} calibrating {} config error {} comms error {}",
        status.reset(),
        status.overflow(),
        status.signal_error(),
        status.calibrating(),
        status.config_error(),
        status.comms_error()
      );
    }

    let flags = self.calibration.flags();
    if status.calibrating() {
      info!("calibration started");
      if flags.recalib_available {
        self.bus.set_anti_calib(&self.directory, &self.saved, true).await?;
        self.bus.set_self_recalib(&self.directory, &self.saved, true).await?;
        self.calibration.update_flags(|f| f.calibrating = true);
      }
    } else if flags.calibrating && flags.recalib_available {
      self.calibration.schedule(Task::UpdateSetting, MONITOR_PERIOD);
      self.calibration.update_flags(|f| f.calibrating = false);
    }
    Ok(())
  }

  fn keys<S: InputSink + ?Sized>(&mut self, state: u8, sink: &mut S) {
    let Some(codes) = self.variant().map(|v| v.key_codes) else {
      return;
    };
    for (key, &code) in codes.iter().enumerate().take(MAX_KEYS) {
      let bit = 1u8 << key;
      let (was, now) = (self.keys & bit != 0, state & bit != 0);
      if was != now {
        debug!("key {} {}", key, now);
        sink.emit(InputEvent::Key { code, pressed: now });
      }
    }
    self.keys = state;
  }

  /// Lift every contact and key.
  pub(crate) fn release_all<S: InputSink + ?Sized>(&mut self, sink: &mut S) {
    let mut frame = Frame::new(sink);
    self.tracker.release_all(&mut frame);
    if let Some(codes) = self.variant().map(|v| v.key_codes) {
      for (key, &code) in codes.iter().enumerate().take(MAX_KEYS) {
        if self.keys & (1 << key) != 0 {
          frame.emit(InputEvent::Key { code, pressed: false });
        }
      }
    }
    self.keys = 0;
    frame.close();
  }
}

#[cfg(test)]
mod tests {
  use embassy_futures::block_on;

  use super::*;
  use crate::event::{Contact, Tool};
  use crate::testing::{self, Layout};

  type Events = Vec<InputEvent, 64>;

  fn touch_layout() -> Layout {
    Layout::new().object(8, 12, 1, 0).object(15, 11, 1, 1).object(19, 6, 1, 1).object(66, 5, 1, 1).object(100, 60, 1, 12).object(102, 30, 1, 1).object(104, 12, 1, 0)
  }

  fn ids(dir: &ObjectDirectory, kind: ObjectType) -> u8 {
    dir.lookup(kind).unwrap().min_report_id
  }

  #[test]
  fn routes_follow_the_table() {
    let (_, dir) = touch_layout().build();
    let routes = ReportRoutes::build(&dir);
    let t100 = ids(&dir, ObjectType::MultiTouch);
    assert_eq!(routes.classify(ids(&dir, ObjectType::Command)), Some(Route::Command));
    assert_eq!(routes.classify(t100), Some(Route::Touch(0)));
    assert_eq!(routes.classify(t100 + 5), Some(Route::Touch(5)));
    assert_eq!(routes.classify(ids(&dir, ObjectType::SelfCap)), Some(Route::SelfCap));
    assert_eq!(routes.classify(0), None);
    assert_eq!(routes.classify(0xFF), None);
    assert_eq!(routes.count(ObjectType::MultiTouch), 12);
  }

  #[test]
  fn finger_lands_moves_and_lifts() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let t100 = ids(&dir, ObjectType::MultiTouch);
    let mut events = Events::new();

    // Screen status with one touch, then finger 0 landing at (500, 300).
    fake.device().push_message(&[t100, 0x00, 1]);
    fake.device().push_message(&[t100 + 2, 0x90, 0xF4, 0x01, 0x2C, 0x01]);
    assert_eq!(block_on(driver.service(0, &mut events)), Ok(2));
    assert_eq!(
      events.as_slice(),
      &[InputEvent::Contact(Contact::new(0, Tool::Finger, 500, 300)), InputEvent::Sync]
    );
    assert_eq!(driver.touch_count(), 1);
    assert_eq!(cal.lock(|s| s.touch_count), 1);

    // A one count wobble stays at the landing position.
    events.clear();
    fake.device().push_message(&[t100 + 2, 0x90, 0xF5, 0x01, 0x2C, 0x01]);
    block_on(driver.service(10, &mut events)).unwrap();
    assert_eq!(events[0], InputEvent::Contact(Contact::new(0, Tool::Finger, 500, 300)));

    events.clear();
    fake.device().push_message(&[t100, 0x00, 0]);
    fake.device().push_message(&[t100 + 2, 0x10, 0xF5, 0x01, 0x2C, 0x01]);
    block_on(driver.service(20, &mut events)).unwrap();
    assert_eq!(events.as_slice(), &[InputEvent::Lift { slot: 0, tool: Tool::Finger }, InputEvent::Sync]);
  }

  #[test]
  fn unlock_restores_self_thresholds() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    let t104 = dir.lookup(ObjectType::AuxTouch).unwrap().start_address as usize;
    fake.device().mem[t104 + 2] = 22;
    fake.device().mem[t104 + 4] = 11;
    block_on(driver.initialize()).unwrap();
    fake.device().mem[t104 + 2] = 40;
    let t100 = ids(&dir, ObjectType::MultiTouch);
    let mut events = Events::new();

    fake.device().push_message(&[t100, 0x00, 1]);
    fake.device().push_message(&[t100 + 2, 0x90, 100, 0, 100, 0]);
    fake.device().push_message(&[t100 + 2, 0x90, 250, 0, 100, 0]);
    fake.device().push_message(&[t100, 0x00, 0]);
    fake.device().push_message(&[t100 + 2, 0x10, 250, 0, 100, 0]);
    block_on(driver.service(0, &mut events)).unwrap();

    assert!(driver.unlocked());
    assert!(cal.flags().unlocked);
    assert_eq!(fake.device().mem[t104 + 2], 22);
    assert_eq!(fake.device().mem[t104 + 7], 22);
  }

  #[test]
  fn keys_emit_edges() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let t15 = ids(&dir, ObjectType::KeyArray);
    let mut events = Events::new();

    fake.device().push_message(&[t15, 0x80, 0b101]);
    fake.device().push_message(&[t15, 0x80, 0b100]);
    block_on(driver.service(0, &mut events)).unwrap();
    assert_eq!(
      events.as_slice(),
      &[
        InputEvent::Key { code: 158, pressed: true },
        InputEvent::Key { code: 139, pressed: true },
        InputEvent::Key { code: 158, pressed: false },
        InputEvent::Sync,
      ]
    );
  }

  #[test]
  fn status_messages_reach_the_calibration_mailboxes() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let mut events = Events::new();

    fake.device().push_message(&[ids(&dir, ObjectType::GoldenReference), 0x02]);
    fake.device().push_message(&[ids(&dir, ObjectType::SelfCap), 0, 3, 0x02]);
    // Other T102 causes are not tune results.
    fake.device().push_message(&[ids(&dir, ObjectType::SelfCap), 0, 1, 0x01]);
    block_on(driver.service(0, &mut events)).unwrap();

    assert_eq!(cal.lock(|s| s.golden.front().copied()), Some(0x02));
    assert_eq!(cal.lock(|s| s.selfcap), Some(SelfCapStatus { cause: 3, error: 0x02 }));
    assert!(events.is_empty());
  }

  #[test]
  fn calibration_message_arms_monitor() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    let t8 = dir.lookup(ObjectType::Acquire).unwrap().start_address;
    fake.device().mem[t8 as usize + 6..t8 as usize + 10].copy_from_slice(&[5, 10, 0x30, 0x14]);
    block_on(driver.initialize()).unwrap();
    cal.update_flags(|f| f.recalib_available = true);
    fake.device().mem[t8 as usize + 6] = 0xFF;
    let t6 = ids(&dir, ObjectType::Command);
    let mut events = Events::new();

    fake.device().push_message(&[t6, 0x10]);
    block_on(driver.service(0, &mut events)).unwrap();
    assert!(cal.flags().calibrating);
    assert_eq!(fake.device().read_mem(t8 + 6, 4), [5, 10, 0x30, 0x14]);
    assert!(!cal.is_pending(Task::UpdateSetting));

    fake.device().push_message(&[t6, 0x00]);
    block_on(driver.service(10, &mut events)).unwrap();
    assert!(!cal.flags().calibrating);
    assert!(cal.is_pending(Task::UpdateSetting));
  }

  #[test]
  fn reset_request_reinitializes() {
    let (fake, dir) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let t100 = ids(&dir, ObjectType::MultiTouch);
    let mut events = Events::new();
    fake.device().push_message(&[t100, 0x00, 1]);
    fake.device().push_message(&[t100 + 2, 0x90, 100, 0, 100, 0]);
    block_on(driver.service(0, &mut events)).unwrap();

    events.clear();
    fake.device().writes.clear();
    cal.update_flags(|f| f.reset_requested = true);
    assert_eq!(block_on(driver.service(10, &mut events)), Ok(0));
    assert_eq!(events.as_slice(), &[InputEvent::Lift { slot: 0, tool: Tool::Finger }, InputEvent::Sync]);
    let t6 = dir.lookup(ObjectType::Command).unwrap().start_address;
    assert_eq!(fake.device().writes[0], (t6, std::vec![0x01]));
    assert!(!cal.flags().reset_requested);
    assert_eq!(driver.state(), State::Application);
  }

  #[test]
  fn count_above_max_report_id_is_clamped() {
    let (fake, dir) = Layout::new().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    assert_eq!(dir.max_report_id(), 1);
    let t6 = ids(&dir, ObjectType::Command);
    for _ in 0..5 {
      fake.device().push_message(&[t6, 0, 0x11, 0x22, 0x33]);
    }
    assert_eq!(block_on(driver.service(0, &mut ())), Ok(1));
    assert_eq!(driver.config_crc(), 0x332211);
    assert_eq!(fake.device().messages.len(), 4);
  }

  #[test]
  fn empty_record_after_nonzero_count() {
    let (fake, _) = Layout::new().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    fake.device().push_message(&[NO_MESSAGE]);
    assert_eq!(block_on(driver.poll(0, &mut ())), Err(Error::UnexpectedMessage));
  }

  #[test]
  fn polled_queue_that_never_empties_is_stuck() {
    let (fake, dir) = Layout::polled().object(100, 60, 1, 12).build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let t6 = ids(&dir, ObjectType::Command);
    for _ in 0..40 {
      fake.device().push_message(&[t6, 0]);
    }
    assert_eq!(block_on(driver.poll(0, &mut ())), Err(Error::MessageStuck));
  }

  #[test]
  fn polled_reads_stop_at_the_touch_id_count() {
    let (fake, dir) = Layout::polled().object(100, 60, 1, 12).build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    assert_eq!(dir.max_report_id(), 13);
    let t6 = ids(&dir, ObjectType::Command);
    for _ in 0..12 {
      fake.device().push_message(&[t6, 0]);
    }
    assert_eq!(block_on(driver.poll(0, &mut ())), Err(Error::MessageStuck));
    assert!(fake.device().messages.is_empty());
    assert_eq!(driver.last_count, 12);
  }

  #[test]
  fn polled_reads_remember_the_last_count() {
    let (fake, dir) = Layout::polled().object(100, 60, 1, 12).build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();
    let t6 = ids(&dir, ObjectType::Command);
    for _ in 0..5 {
      fake.device().push_message(&[t6, 0]);
    }
    assert_eq!(block_on(driver.poll(0, &mut ())), Ok(5));
    assert_eq!(driver.last_count, 5);
    assert!(fake.device().messages.is_empty());

    // The next interrupt reads last_count + 1 records in one transfer.
    fake.device().push_message(&[t6, 0]);
    assert_eq!(block_on(driver.poll(0, &mut ())), Ok(1));
    assert_eq!(driver.last_count, 1);
  }

  #[test]
  fn bus_error_reinitializes_once() {
    let (fake, _) = touch_layout().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    block_on(driver.initialize()).unwrap();

    fake.device().fail_next = 1;
    assert_eq!(block_on(driver.service(0, &mut ())), Ok(0));
    assert_eq!(driver.state(), State::Application);

    // The retry is spent until a poll succeeds again.
    fake.device().fail = true;
    assert!(matches!(block_on(driver.service(0, &mut ())), Err(Error::I2c(_))));
    fake.device().fail = false;
    fake.device().fail_next = 1;
    assert!(matches!(block_on(driver.service(0, &mut ())), Err(Error::I2c(_))));
    assert_eq!(block_on(driver.service(0, &mut ())), Ok(0));
  }

  #[test]
  fn uninitialized_driver_refuses_to_poll() {
    let (fake, _) = Layout::new().build();
    let cal = testing::leak_calibration();
    let mut driver = testing::driver(&fake, cal);
    assert_eq!(block_on(driver.poll(0, &mut ())), Err(Error::NotInitialized));
  }
}
