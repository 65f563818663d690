#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Async, `no_std` driver for Atmel/Microchip maXTouch touchscreen
//! controllers.
//!
//! maXTouch parts expose every function as an "object" whose location is
//! only known after reading the object table at start-up. This crate
//! discovers that table, decodes the message stream into contact and key
//! events, and runs the controller's calibration protocols in the
//! background:
//!
//! - Object table discovery and report id routing
//! - Count-prefixed (T44) and polled message transports
//! - Per-slot jitter filtering and the resume unlock latch
//! - Anti-touch and self recalibration, golden references, self-cap tuning
//!   and interference monitoring on a separate [`Calibrator`] task
//! - `OBP_RAW` configuration download with NV backup
//! - Suspend and resume that keep the panel quiet while asleep
//!
//! The driver is split in two. [`Maxtouch`] owns one bus handle and services
//! the interrupt line; [`Calibrator`] owns a second handle and carries out
//! the long-running sequences. Both borrow one [`Calibration`] block, which
//! can live in a `static`.
//!
//! ```no_run
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embedded_hal_async::{delay::DelayNs, digital::Wait, i2c::{I2c, SevenBitAddress}};
//! use maxtouch::{Calibration, DeviceConfig, InputEvent, Maxtouch, Platform};
//!
//! static CALIBRATION: Calibration<CriticalSectionRawMutex> = Calibration::new();
//! static VARIANTS: [DeviceConfig<'static>; 1] = [DeviceConfig::new(0xA6, 0x12, 0x10, 0xAA)];
//!
//! async fn example<I2C, DELAY, CHG, E>(i2c: I2C, delay: DELAY, mut chg: CHG, now: impl Fn() -> u32) -> Result<(), maxtouch::Error<E>>
//! where
//!   I2C: I2c<SevenBitAddress, Error = E>,
//!   DELAY: DelayNs,
//!   CHG: Wait,
//! {
//!   let platform = Platform::new(&VARIANTS).with_matrix(18, 30, 100);
//!   let mut touch = Maxtouch::new(i2c, delay, platform, &CALIBRATION);
//!   touch.initialize().await?;
//!
//!   let mut events: heapless::Vec<InputEvent, 64> = heapless::Vec::new();
//!   loop {
//!     let _ = chg.wait_for_low().await;
//!     touch.service(now(), &mut events).await?;
//!     events.clear();
//!   }
//! }
//! ```

mod fmt;

mod calibration;
mod config;
mod control;
mod defs;
mod dispatch;
mod event;
mod init;
mod message;
mod object;
mod power;
mod reg;
mod rw;
mod touchpad;

#[cfg(test)]
mod testing;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

pub use calibration::{Calibration, Calibrator, Command, CommandFailure, GoldenFailure, Risk, SessionKind, Task};
pub use config::*;
pub use control::SavedSettings;
pub use defs::{DEFAULT_ADDRESS, MAX_SLOTS};
pub use event::{Contact, InputEvent, InputSink, Tool};
pub use message::GoldenPhase;
pub use object::{InfoBlock, ObjectDescriptor, ObjectDirectory, TableError};
pub use reg::ObjectType;

use defs::{MAX_MESSAGE_SIZE, MESSAGE_BATCH};
use dispatch::ReportRoutes;
use message::TouchAux;
use rw::Bus;
use touchpad::Tracker;

/// Errors that can occur while interacting with the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
  /// I²C bus transaction failed with the underlying driver error.
  I2c(E),
  /// The object table read at initialize is inconsistent.
  MalformedTable(TableError),
  /// A configuration file could not be parsed or does not fit the part.
  Config(ConfigError),
  /// The operation needs an object this part does not have.
  MissingObject(ObjectType),
  /// No variant in the platform data matches the part.
  NoConfig,
  /// The controller did not finish an operation in time.
  Timeout,
  /// A tuned value would leave its allowed range.
  Range,
  /// The message queue never ran empty.
  MessageStuck,
  /// The message count promised a record that was not there.
  UnexpectedMessage,
  /// Another calibration session holds the controller.
  Busy,
  /// The running background task was cancelled.
  Cancelled,
  /// The controller is stuck in its bootloader.
  Bootloader,
  /// The driver has not been initialized, or is in bootloader mode.
  NotInitialized,
  Golden(GoldenFailure),
}

impl<E> From<TableError> for Error<E> {
  fn from(e: TableError) -> Self {
    Self::MalformedTable(e)
  }
}

impl<E> From<ConfigError> for Error<E> {
  fn from(e: ConfigError) -> Self {
    Self::Config(e)
  }
}

/// Mode the controller was last found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
  Uninitialized,
  Application,
  /// Only the bootloader answers; the part needs new firmware.
  Bootloader,
}

const MESSAGE_BUFFER: usize = MESSAGE_BATCH * MAX_MESSAGE_SIZE + 1;

/// Dispatch side of the driver.
///
/// Owns one bus handle, reads and decodes messages, tracks contacts and
/// drives initialize, suspend and resume. Create it with [`Maxtouch::new`],
/// call [`Maxtouch::initialize`], then [`Maxtouch::service`] whenever the CHG
/// line goes low.
pub struct Maxtouch<'a, M: RawMutex, I, D> {
  bus: Bus<I, D>,
  platform: Platform<'a>,
  calibration: &'a Calibration<M>,
  state: State,
  directory: ObjectDirectory,
  routes: ReportRoutes,
  variant: Option<usize>,
  saved: SavedSettings,
  info_crc: u32,
  config_crc: u32,
  vendor_id: Option<u8>,
  aux: TouchAux,
  max_x: u16,
  max_y: u16,
  tracker: Tracker,
  /// Pressed T15 keys, one bit per key.
  keys: u8,
  /// Records handled by the last polled read.
  last_count: usize,
  now: u32,
  suspended: bool,
  reinit_tried: bool,
  /// Registers zeroed for deep sleep, restored on resume.
  sleep_saves: [Option<u8>; power::SLEEP_REGISTERS],
  messages: [u8; MESSAGE_BUFFER],
}

impl<'a, M, I, E, D> Maxtouch<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  /// Create a driver over `i2c`. Nothing is sent until
  /// [`Maxtouch::initialize`].
  pub fn new(i2c: I, delay: D, platform: Platform<'a>, calibration: &'a Calibration<M>) -> Self {
    Self {
      bus: Bus::new(i2c, delay, platform.address),
      platform,
      calibration,
      state: State::Uninitialized,
      directory: ObjectDirectory::empty(),
      routes: ReportRoutes::new(),
      variant: None,
      saved: SavedSettings::default(),
      info_crc: 0,
      config_crc: 0,
      vendor_id: None,
      aux: TouchAux::new(),
      max_x: 0,
      max_y: 0,
      tracker: Tracker::new(platform.filter),
      keys: 0,
      last_count: 0,
      now: 0,
      suspended: false,
      reinit_tried: false,
      sleep_saves: [None; power::SLEEP_REGISTERS],
      messages: [0; MESSAGE_BUFFER],
    }
  }

  pub fn state(&self) -> State {
    self.state
  }

  pub fn directory(&self) -> &ObjectDirectory {
    &self.directory
  }

  pub fn info(&self) -> &InfoBlock {
    self.directory.info()
  }

  /// 24-bit CRC over the info block and object table.
  pub fn info_crc(&self) -> u32 {
    self.info_crc
  }

  /// 24-bit CRC of the resident configuration, 0 while unknown.
  pub fn config_crc(&self) -> u32 {
    self.config_crc
  }

  /// Vendor id read from T19, if the part has one and it answered.
  pub fn vendor_id(&self) -> Option<u8> {
    self.vendor_id
  }

  /// The platform variant selected at initialize.
  pub fn variant(&self) -> Option<&DeviceConfig<'a>> {
    self.variant.and_then(|i| self.platform.variant(i))
  }

  pub fn saved_settings(&self) -> &SavedSettings {
    &self.saved
  }

  /// Largest reportable `(x, y)` after orientation is applied.
  pub fn resolution(&self) -> (u16, u16) {
    (self.max_x, self.max_y)
  }

  pub fn is_suspended(&self) -> bool {
    self.suspended
  }

  /// Contacts the controller last reported on screen.
  pub fn touch_count(&self) -> u8 {
    self.tracker.touch_count()
  }

  /// Whether a finger has travelled far enough since resume to restore the
  /// normal self-cap thresholds.
  pub fn unlocked(&self) -> bool {
    self.tracker.unlocked()
  }

  /// Forget the cached config CRC after the firmware restarted.
  async fn soft_reset(&mut self) -> Result<(), Error<E>> {
    self.bus.soft_reset(&self.directory).await?;
    self.config_crc = 0;
    Ok(())
  }
}
