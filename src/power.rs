use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::calibration::{Task, MONITOR_PERIOD};
use crate::control::SelfThreshold;
use crate::defs::{SUSPEND_WAIT_POLL, SUSPEND_WAIT_POLLS};
use crate::event::InputSink;
use crate::reg::{t22, t7, ObjectType};
use crate::{Error, Maxtouch, State};

/// Registers zeroed for deep sleep, in write order.
const DEEP_SLEEP: [(ObjectType, u8); 4] = [
  (ObjectType::Noise, t22::CTRL),
  (ObjectType::Power, t7::IDLE_ACQ_INT),
  (ObjectType::Power, t7::ACTIVE_ACQ_INT),
  (ObjectType::Power, t7::ACTIVE_TO_IDLE),
];

pub(crate) const SLEEP_REGISTERS: usize = DEEP_SLEEP.len();

const MONITOR_TASKS: [Task; 2] = [Task::UpdateSetting, Task::DisableAntiCalib];

impl<'a, M, I, E, D> Maxtouch<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  /// Put the controller into deep sleep.
  ///
  /// Stops the interference monitor, raises the self-cap thresholds to their
  /// suspend values, turns anti-touch and self recalibration on so the panel
  /// recovers on resume, then zeroes the acquisition intervals. Every active
  /// contact and key is released into `sink`.
  pub async fn enter_low_power<S: InputSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), Error<E>> {
    if self.state != State::Application {
      return Err(Error::NotInitialized);
    }
    if self.suspended {
      return Ok(());
    }
    info!("entering low power");
    self.suspended = true;

    self.calibration.cancel(&MONITOR_TASKS);
    let mut idle = false;
    for _ in 0..SUSPEND_WAIT_POLLS {
      if !self.calibration.running().is_some_and(|t| MONITOR_TASKS.contains(&t)) {
        idle = true;
        break;
      }
      self.bus.sleep(SUSPEND_WAIT_POLL).await;
    }
    if !idle {
      warn!("monitor task still running");
      self.suspended = false;
      return Err(Error::Timeout);
    }
    self.calibration.lock(|s| s.ratchet.reset());

    if let Some(variant) = self.variant().copied() {
      for which in [SelfThreshold::Touch, SelfThreshold::InternalSuspend] {
        self.bus.adjust_self(&self.directory, &variant, &self.saved, which, true).await?;
      }
    }
    self.bus.set_anti_calib(&self.directory, &self.saved, true).await?;
    self.bus.set_self_recalib(&self.directory, &self.saved, true).await?;

    for (saved, &(kind, offset)) in self.sleep_saves.iter_mut().zip(DEEP_SLEEP.iter()) {
      if !self.directory.contains(kind) {
        *saved = None;
        continue;
      }
      *saved = Some(self.bus.read_object(&self.directory, kind, offset).await?);
      self.bus.write_object(&self.directory, kind, offset, 0).await?;
    }

    self.release_all(sink);
    self.tracker.clear_lock();
    self.calibration.update_flags(|f| f.unlocked = false);
    Ok(())
  }

  /// Wake the controller and recalibrate.
  ///
  /// If the controller already started a calibration of its own while
  /// waking, the interference monitor is rearmed instead.
  pub async fn resume_full_power(&mut self) -> Result<(), Error<E>> {
    if self.state != State::Application {
      return Err(Error::NotInitialized);
    }
    if !self.suspended {
      return Ok(());
    }
    info!("resuming full power");

    for (saved, &(kind, offset)) in self.sleep_saves.iter_mut().zip(DEEP_SLEEP.iter()).rev() {
      if let Some(value) = saved.take() {
        self.bus.write_object(&self.directory, kind, offset, value).await?;
      }
    }

    if self.drain_for_calibration().await? {
      if self.calibration.golden_in_flight() {
        debug!("golden reference in flight, monitor not armed");
      } else {
        self.calibration.schedule(Task::UpdateSetting, MONITOR_PERIOD);
      }
    } else {
      self.bus.calibrate(&self.directory).await?;
    }
    self.suspended = false;
    Ok(())
  }
}
