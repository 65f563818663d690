//! Background calibration.
//!
//! The dispatch side ([`crate::Maxtouch`]) and the background side
//! ([`Calibrator`]) share one [`Calibration`] block. The dispatcher only
//! records what it sees (golden and self-cap status, touch counts, lock
//! state) and queues work; the calibrator performs every long-running
//! sequence on its own bus handle.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embedded_hal::i2c::ErrorKind;
use heapless::Deque;

use crate::control::SavedSettings;
use crate::message::SelfCapStatus;
use crate::object::ObjectDirectory;
use crate::reg::{t6, ObjectType};
use crate::Error;

mod golden;
mod modes;
mod queue;
mod risk;
mod selfcap;
mod session;
mod worker;

pub use queue::Task;
pub use risk::Risk;
pub use session::SessionKind;
pub use worker::Calibrator;

pub(crate) use worker::{MONITOR_PERIOD, MUTUAL_DATA_LEN};

pub(crate) use risk::{IgnoreLines, Ratchet};
pub(crate) use session::{Session, SessionGuard};

use queue::WorkQueue;

/// Requests handled by the [`Calibrator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
  /// Generate and verify golden references in both noise modes.
  GenerateGoldenReference,
  /// Switch the golden reference object on or off.
  GoldenReference(bool),
  /// Tune the self-cap charge time, optionally storing the result.
  SelfTune { persist: bool },
  Sensitivity(bool),
  Stylus(bool),
  /// T37 mode used by [`Calibrator::diagnostic_data`].
  DiagnosticMode(u8),
  /// Reset the controller and initialize again from the dispatch side.
  ChipReset,
}

/// Why a golden reference sequence failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GoldenFailure {
  /// The controller reported a failed generate step.
  GenerateFailed,
  /// Too many sequence errors or unexpected statuses.
  RetriesExhausted,
  /// Stored references were rejected after reset.
  BadStoredData,
  /// References were stored but the panel still shows interference.
  Unverified,
}

/// Outcome of a [`Command`] submitted through [`Calibration::command`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandFailure {
  Bus(ErrorKind),
  MissingObject(ObjectType),
  Timeout,
  Range,
  Busy,
  Cancelled,
  NotInitialized,
  Golden(GoldenFailure),
  Other,
}

impl<E: embedded_hal::i2c::Error> From<Error<E>> for CommandFailure {
  fn from(e: Error<E>) -> Self {
    match e {
      Error::I2c(e) => Self::Bus(e.kind()),
      Error::MissingObject(kind) => Self::MissingObject(kind),
      Error::Timeout => Self::Timeout,
      Error::Range => Self::Range,
      Error::Busy => Self::Busy,
      Error::Cancelled => Self::Cancelled,
      Error::NotInitialized => Self::NotInitialized,
      Error::Golden(g) => Self::Golden(g),
      _ => Self::Other,
    }
  }
}

/// What the calibrator needs to know about the initialized controller.
#[derive(Clone, Debug)]
pub(crate) struct Context {
  pub(crate) directory: ObjectDirectory,
  pub(crate) variant: usize,
  pub(crate) saved: SavedSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Flags {
  pub(crate) recalib_available: bool,
  /// A T6 calibration is running and anti-touch was forced on for it.
  pub(crate) calibrating: bool,
  pub(crate) golden_enabled: bool,
  pub(crate) golden_ok: bool,
  pub(crate) sensitive: bool,
  pub(crate) stylus: bool,
  pub(crate) use_last_golden: bool,
  pub(crate) ignore_lines_saved: bool,
  pub(crate) unlocked: bool,
  pub(crate) reset_requested: bool,
}

impl Flags {
  const fn new() -> Self {
    Self {
      recalib_available: false,
      calibrating: false,
      golden_enabled: false,
      golden_ok: false,
      sensitive: false,
      stylus: false,
      use_last_golden: false,
      ignore_lines_saved: false,
      unlocked: false,
      reset_requested: false,
    }
  }
}

const GOLDEN_MAILBOX: usize = 8;

pub(crate) struct Shared {
  pub(crate) context: Option<Context>,
  pub(crate) session: Option<Session>,
  pub(crate) golden: Deque<u8, GOLDEN_MAILBOX>,
  pub(crate) selfcap: Option<SelfCapStatus>,
  pub(crate) flags: Flags,
  pub(crate) touch_count: u8,
  pub(crate) ratchet: Ratchet,
  pub(crate) ignore: IgnoreLines,
  pub(crate) reference_threshold: u16,
  pub(crate) queue: WorkQueue,
  pub(crate) command: Option<Command>,
  pub(crate) diag_mode: u8,
  pub(crate) self_test: Option<[u8; 6]>,
}

impl Shared {
  const fn new() -> Self {
    Self {
      context: None,
      session: None,
      golden: Deque::new(),
      selfcap: None,
      flags: Flags::new(),
      touch_count: 0,
      ratchet: Ratchet::new(),
      ignore: IgnoreLines::new(),
      reference_threshold: 0,
      queue: WorkQueue::new(),
      command: None,
      diag_mode: DEFAULT_DIAGNOSTIC_MODE,
      self_test: None,
    }
  }
}

const DEFAULT_DIAGNOSTIC_MODE: u8 = t6::DIAG_MUTUAL_DELTA;

/// State shared by the dispatch and calibration sides. Const-constructible so
/// it can live in a `static`.
pub struct Calibration<M: RawMutex> {
  shared: Mutex<M, RefCell<Shared>>,
  wake: Signal<M, ()>,
  cancel: Signal<M, ()>,
  outcome: Signal<M, Result<(), CommandFailure>>,
}

impl<M: RawMutex> Calibration<M> {
  pub const fn new() -> Self {
    Self {
      shared: Mutex::new(RefCell::new(Shared::new())),
      wake: Signal::new(),
      cancel: Signal::new(),
      outcome: Signal::new(),
    }
  }

  pub(crate) fn lock<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
    self.shared.lock(|cell| f(&mut cell.borrow_mut()))
  }

  /// Submit a command and wait for the calibrator to finish it. Only one
  /// command may be outstanding.
  pub async fn command(&self, command: Command) -> Result<(), CommandFailure> {
    self.outcome.reset();
    let accepted = self.lock(|s| match s.command {
      Some(_) => false,
      None => {
        s.command = Some(command);
        true
      }
    });
    if !accepted {
      return Err(CommandFailure::Busy);
    }
    self.wake.signal(());
    self.outcome.wait().await
  }

  pub(crate) fn take_command(&self) -> Option<Command> {
    self.lock(|s| s.command.take())
  }

  pub(crate) fn finish_command(&self, result: Result<(), CommandFailure>) {
    self.outcome.signal(result);
  }

  pub(crate) async fn wait_for_work(&self) {
    self.wake.wait().await
  }

  pub(crate) fn schedule(&self, task: Task, delay_ms: u32) {
    if self.lock(|s| s.queue.schedule(task, delay_ms)) {
      debug!("{:?} scheduled in {} ms", task, delay_ms);
      self.wake.signal(());
    }
  }

  /// Cancel queued and running work of these kinds.
  pub(crate) fn cancel(&self, tasks: &[Task]) {
    if self.lock(|s| s.queue.cancel(tasks)) {
      self.cancel.signal(());
    }
  }

  pub(crate) fn cancelled(&self) -> bool {
    self.lock(|s| s.queue.is_cancelled())
  }

  pub(crate) async fn wait_cancel(&self) {
    self.cancel.wait().await
  }

  pub(crate) fn reset_cancel(&self) {
    self.cancel.reset();
  }

  /// Task currently held by the worker, if any.
  pub fn running(&self) -> Option<Task> {
    self.lock(|s| s.queue.running())
  }

  pub fn is_pending(&self, task: Task) -> bool {
    self.lock(|s| s.queue.is_pending(task))
  }

  pub(crate) fn publish(&self, context: Context, reference_threshold: u16) {
    self.lock(|s| {
      s.context = Some(context);
      s.flags.recalib_available = false;
      s.flags.calibrating = false;
      s.flags.unlocked = false;
      s.touch_count = 0;
      s.ratchet.reset();
      if !s.flags.ignore_lines_saved {
        s.reference_threshold = reference_threshold;
      }
    });
  }

  pub(crate) fn context(&self) -> Option<Context> {
    self.lock(|s| s.context.clone())
  }

  /// Golden status from a T66 message. The oldest unread status is dropped
  /// if the reader falls behind.
  pub(crate) fn deliver_golden(&self, raw: u8) {
    self.lock(|s| {
      if s.golden.is_full() {
        warn!("golden status mailbox full");
        s.golden.pop_front();
      }
      let _ = s.golden.push_back(raw);
    });
  }

  pub(crate) fn deliver_selfcap(&self, status: SelfCapStatus) {
    self.lock(|s| s.selfcap = Some(status));
  }

  pub(crate) fn flags(&self) -> Flags {
    self.lock(|s| s.flags)
  }

  pub(crate) fn update_flags(&self, f: impl FnOnce(&mut Flags)) {
    self.lock(|s| f(&mut s.flags));
  }

  pub(crate) fn golden_in_flight(&self) -> bool {
    self.lock(|s| s.session.is_some_and(|x| x.kind.is_golden()))
  }

  pub fn recalibration_available(&self) -> bool {
    self.flags().recalib_available
  }

  pub fn golden_ok(&self) -> bool {
    self.flags().golden_ok
  }

  pub fn sensitive(&self) -> bool {
    self.flags().sensitive
  }

  pub fn stylus(&self) -> bool {
    self.flags().stylus
  }

  /// Last T25 self-test report.
  pub fn self_test_result(&self) -> Option<[u8; 6]> {
    self.lock(|s| s.self_test)
  }
}

impl<M: RawMutex> Default for Calibration<M> {
  fn default() -> Self {
    Self::new()
  }
}
