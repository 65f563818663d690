use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use super::{Calibrator, Context, SessionKind};
use crate::reg::{t102, ObjectType};
use crate::Error;

const TUNE_RETRIES: u8 = 10;
const TUNE_POLL: u32 = 10;
const TUNE_POLLS: u16 = 1000;

impl<'a, M, I, E, D> Calibrator<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  E: embedded_hal::i2c::Error,
  D: DelayNs,
{
  /// Run the T102 self-cap tune, nudging the charge time between attempts
  /// when the controller asks for it. Panels without T102 succeed trivially.
  pub(super) async fn self_tune(&mut self, ctx: &Context, persist: bool) -> Result<(), Error<E>> {
    let dir = &ctx.directory;
    if !dir.contains(ObjectType::SelfCap) {
      debug!("no self-cap object, tune skipped");
      return Ok(());
    }
    let variant = self.variant(ctx)?;
    let calibration = self.calibration;
    let session = calibration.begin(SessionKind::SelfCapTune, TUNE_RETRIES).ok_or(Error::Busy)?;

    while session.retry() {
      session.take_selfcap();
      self.bus.write_object(dir, ObjectType::SelfCap, t102::CMD, t102::TUNE).await?;

      session.arm(TUNE_POLLS);
      let status = loop {
        if let Some(status) = session.take_selfcap() {
          break Some(status);
        }
        if !session.tick() {
          break None;
        }
        self.pause(TUNE_POLL).await?;
      };
      let Some(status) = status else {
        debug!("self-cap tune timed out");
        continue;
      };

      if status.needs_more_charge() || status.needs_less_charge() {
        let current = self.bus.read_object(dir, ObjectType::SelfCap, t102::CHARGE_TIME).await?;
        let next = if status.needs_more_charge() {
          current.checked_add(t102::CHARGE_TIME_STEP).filter(|v| *v <= variant.self_charge_time_max)
        } else {
          current.checked_sub(t102::CHARGE_TIME_STEP).filter(|v| *v >= variant.self_charge_time_min)
        };
        let Some(next) = next else {
          warn!("self-cap charge time {} out of range", current);
          return Err(Error::Range);
        };
        debug!("self-cap charge time {} -> {}", current, next);
        self.bus.write_object(dir, ObjectType::SelfCap, t102::CHARGE_TIME, next).await?;
        continue;
      }

      info!("self-cap tune passed");
      if persist {
        self.bus.write_object(dir, ObjectType::SelfCap, t102::CMD, t102::STORE).await?;
      }
      return Ok(());
    }
    warn!("self-cap tune never passed");
    Err(Error::Timeout)
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::rc::Rc;

  use embassy_futures::block_on;
  use embassy_sync::blocking_mutex::raw::NoopRawMutex;

  use super::*;
  use crate::calibration::{Calibration, Command};
  use crate::message::SelfCapStatus;
  use crate::testing::{self, Clock, Device, FakeBus, Layout};

  type Worker<'a> = Calibrator<'a, NoopRawMutex, FakeBus, Clock>;

  fn layout() -> Layout {
    Layout::new().object(102, 30, 1, 1)
  }

  /// Answer each tune command with the next error code in `errors`, then pass.
  fn answer(cal: &'static Calibration<NoopRawMutex>, t102: u16, errors: &'static [u8], tunes: Rc<Cell<usize>>) -> testing::OnWrite {
    std::boxed::Box::new(move |_: &mut Device, addr: u16, data: &[u8]| {
      if addr == t102 + 1 && data == [t102::TUNE] {
        let n = tunes.get();
        tunes.set(n + 1);
        let error = errors.get(n).copied().unwrap_or(0);
        cal.deliver_selfcap(SelfCapStatus { cause: 3, error });
      }
    })
  }

  #[test]
  fn charge_time_steps_until_pass_then_stores() {
    let (fake, dir) = layout().build();
    let cal = testing::leak_calibration();
    testing::publish(cal, &dir);
    let t102 = dir.lookup(ObjectType::SelfCap).unwrap().start_address;
    fake.device().mem[(t102 + 13) as usize] = 40;
    let tunes = Rc::new(Cell::new(0));
    fake.device().on_write = Some(answer(cal, t102, &[0x02, 0x02, 0x01], tunes.clone()));

    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), cal);
    assert_eq!(block_on(worker.execute(Command::SelfTune { persist: true })), Ok(()));
    assert_eq!(tunes.get(), 4);
    assert_eq!(fake.device().mem[(t102 + 13) as usize], 45);
    assert_eq!(fake.device().writes.last().unwrap(), &(t102 + 1, std::vec![t102::STORE]));
  }

  #[test]
  fn charge_time_past_limit_is_range() {
    let (fake, dir) = layout().build();
    let cal = testing::leak_calibration();
    testing::publish(cal, &dir);
    let t102 = dir.lookup(ObjectType::SelfCap).unwrap().start_address;
    // The test variant allows charge times up to 60.
    fake.device().mem[(t102 + 13) as usize] = 58;
    let tunes = Rc::new(Cell::new(0));
    fake.device().on_write = Some(answer(cal, t102, &[0x02; 10], tunes.clone()));

    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), cal);
    assert_eq!(block_on(worker.execute(Command::SelfTune { persist: false })), Err(Error::Range));
    assert_eq!(tunes.get(), 1);
    assert_eq!(fake.device().mem[(t102 + 13) as usize], 58);
  }

  #[test]
  fn silent_controller_times_out_after_retries() {
    let (fake, dir) = layout().build();
    let cal = testing::leak_calibration();
    testing::publish(cal, &dir);
    let t102 = dir.lookup(ObjectType::SelfCap).unwrap().start_address;

    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), cal);
    assert_eq!(block_on(worker.execute(Command::SelfTune { persist: false })), Err(Error::Timeout));
    let tunes = fake.device().writes.iter().filter(|(a, d)| *a == t102 + 1 && d == &[t102::TUNE]).count();
    assert_eq!(tunes, TUNE_RETRIES as usize);
  }

  #[test]
  fn no_self_cap_object() {
    let (fake, dir) = Layout::new().build();
    let cal = testing::leak_calibration();
    testing::publish(cal, &dir);
    let mut worker: Worker = Calibrator::new(fake.clone(), Clock::default(), testing::platform(), cal);
    assert_eq!(block_on(worker.execute(Command::SelfTune { persist: true })), Ok(()));
    assert!(fake.device().writes.is_empty());
  }
}
