use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::calibration::{Context, Task};
use crate::config::ConfigOutcome;
use crate::control::SavedSettings;
use crate::defs::*;
use crate::dispatch::ReportRoutes;
use crate::message::TouchAux;
use crate::object::{InfoBlock, ObjectDirectory, TableError};
use crate::reg::{t100, t102, t104, t19, t7, t78, t8, t80, t9, ObjectType};
use crate::{Error, Maxtouch, State};

/// Orientation bit that swaps the X and Y axes, in T9 ORIENT and T100 CFG1 >> 5.
const SWITCH_XY: u8 = 1 << 0;
const T100_ORIENT_SHIFT: u8 = 5;
const DEFAULT_RANGE: u16 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum InitState {
  ReadInfo,
  ReadObjectTable,
  ReadInfoCrc,
  ProbePower,
  ReadVendor,
  SelectVariant,
  DownloadConfig,
  ReadSettings,
  Publish,
}

impl<'a, M, I, E, D> Maxtouch<'a, M, I, D>
where
  M: RawMutex,
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  /// Discover the controller and bring it into a known state.
  ///
  /// Reads the info block and object table, leaves the bootloader if the
  /// part is stuck there, selects the platform variant, downloads its
  /// configuration when it differs, caches the settings later overrides
  /// restore, and hands the result to the calibration side.
  ///
  /// Safe to call again at any time; all cached state is rebuilt.
  pub async fn initialize(&mut self) -> Result<(), Error<E>> {
    let mut state = InitState::ReadInfo;
    let mut info = InfoBlock::default();
    let mut leave_attempts = 0u8;
    let mut rechecked = false;
    let mut sensitive = false;

    self.state = State::Uninitialized;
    self.calibration.cancel(&[Task::UpdateSetting, Task::DisableAntiCalib, Task::PreUse]);
    self.calibration.update_flags(|f| {
      f.recalib_available = false;
      f.calibrating = false;
    });

    loop {
      trace!("init {:?}", state);
      match state {
        InitState::ReadInfo => {
          let mut raw = [0u8; INFO_BLOCK_LEN];
          match self.bus.read(0, &mut raw).await {
            Ok(()) => {
              info = InfoBlock::from(raw);
              info!(
                "family 0x{:02x} variant 0x{:02x} firmware {}.{} build 0x{:02x}, {} objects",
                info.family_id,
                info.variant_id,
                info.firmware().0,
                info.firmware().1,
                info.build,
                info.object_count
              );
              state = InitState::ReadObjectTable;
            }
            Err(e) => {
              let Some(address) = bootloader_address(self.platform.address) else {
                return Err(e);
              };
              let mut status = [0u8; 1];
              if self.bus.bootloader_read(address, &mut status).await.is_err() {
                return Err(e);
              }
              if status[0] & !BOOTLOADER_STATUS_MASK == BOOTLOADER_APP_CRC_FAIL {
                error!("application CRC failure, firmware needed");
                self.state = State::Bootloader;
                return Err(Error::Bootloader);
              }
              if leave_attempts >= BOOTLOADER_RETRIES {
                error!("controller stuck in bootloader");
                self.state = State::Bootloader;
                return Err(Error::Bootloader);
              }
              leave_attempts += 1;
              warn!("bootloader answered at 0x{:02x}, leaving ({})", address, leave_attempts);
              self.bus.bootloader_write(address, &BOOTLOADER_LEAVE).await?;
              self.bus.sleep(FW_RESET_TIME).await;
            }
          }
        }

        InitState::ReadObjectTable => {
          let count = info.object_count as usize;
          if count > MAX_OBJECTS {
            return Err(TableError::TooManyObjects.into());
          }
          let mut table = [0u8; MAX_OBJECTS * OBJECT_ENTRY_LEN];
          let table = &mut table[..count * OBJECT_ENTRY_LEN];
          self.bus.read(OBJECT_TABLE_START, table).await?;
          self.directory = ObjectDirectory::build(info, table)?;
          self.routes = ReportRoutes::build(&self.directory);
          state = InitState::ReadInfoCrc;
        }

        InitState::ReadInfoCrc => {
          let mut crc = [0u8; INFO_CRC_LEN];
          self.bus.read(self.directory.info_crc_address(), &mut crc).await?;
          self.info_crc = u32::from_le_bytes([crc[0], crc[1], crc[2], 0]);
          debug!("info block CRC 0x{:06x}", self.info_crc);
          state = InitState::ProbePower;
        }

        InitState::ProbePower => {
          self.probe_power().await?;
          state = InitState::ReadVendor;
        }

        InitState::ReadVendor => {
          self.vendor_id = self.read_vendor().await?;
          state = InitState::SelectVariant;
        }

        InitState::SelectVariant => {
          let selected = self.platform.select(&info, self.vendor_id).or_else(|| {
            let fallback = self.platform.select(&info, None);
            if fallback.is_some() {
              warn!("no variant for vendor {:?}, using default", self.vendor_id);
            }
            fallback
          });
          let Some(index) = selected else {
            error!("no platform variant for this part");
            return Err(Error::NoConfig);
          };
          debug!("variant {} selected", index);
          self.variant = Some(index);
          state = InitState::DownloadConfig;
        }

        InitState::DownloadConfig => {
          self.read_config_crc().await?;
          state = InitState::ReadSettings;

          let Some(text) = self.variant().and_then(|v| v.config) else {
            continue;
          };
          if self.download_config(text).await? == ConfigOutcome::Applied {
            self.bus.backup_nv(&self.directory).await?;
            self.config_crc = 0;
            self.probe_power().await?;
            // GPIO may only answer once its configuration is in place.
            if self.vendor_id.is_none() && !rechecked && self.directory.contains(ObjectType::Gpio) {
              rechecked = true;
              state = InitState::ReadVendor;
            }
          }
        }

        InitState::ReadSettings => {
          sensitive = self.read_settings().await?;
          self.read_resolution().await?;
          state = InitState::Publish;
        }

        InitState::Publish => {
          let Some(variant) = self.variant else {
            return Err(Error::NoConfig);
          };
          let fingers = if self.directory.contains(ObjectType::MultiTouch) {
            self.routes.count(ObjectType::MultiTouch).saturating_sub(t100::FIRST_FINGER as u16)
          } else {
            self.routes.count(ObjectType::LegacyMultiTouch)
          };
          self.tracker.configure(fingers, self.routes.count(ObjectType::ActiveStylus), self.max_x);

          let context = Context { directory: self.directory.clone(), variant, saved: self.saved };
          self.calibration.publish(context, self.platform.reference_threshold);
          self.calibration.update_flags(|f| f.sensitive = sensitive);

          self.keys = 0;
          self.last_count = 0;
          self.suspended = false;
          self.sleep_saves = [None; crate::power::SLEEP_REGISTERS];
          self.state = State::Application;
          self.calibration.schedule(Task::PreUse, 0);
          info!("initialized, {}x{} with {} fingers", self.max_x, self.max_y, self.tracker.fingers());
          return Ok(());
        }
      }
    }
  }

  /// A zero idle or active acquisition interval puts the part to sleep for
  /// good. Reset once, then fall back to free run.
  async fn probe_power(&mut self) -> Result<(), Error<E>> {
    if !self.directory.contains(ObjectType::Power) {
      return Ok(());
    }
    let mut acq = [0u8; 2];
    self.bus.read_object_bytes(&self.directory, ObjectType::Power, t7::IDLE_ACQ_INT, &mut acq).await?;
    if !acq.contains(&0) {
      return Ok(());
    }

    warn!("power config zero, resetting");
    self.soft_reset().await?;
    self.bus.read_object_bytes(&self.directory, ObjectType::Power, t7::IDLE_ACQ_INT, &mut acq).await?;
    if acq.contains(&0) {
      warn!("power config still zero, using free run");
      let free_run = [t7::FREE_RUN, t7::FREE_RUN];
      self.bus.write_object_bytes(&self.directory, ObjectType::Power, t7::IDLE_ACQ_INT, &free_run).await?;
    }
    Ok(())
  }

  /// Force a T19 report and let the GPIO handler pick up the vendor id.
  async fn read_vendor(&mut self) -> Result<Option<u8>, Error<E>> {
    if !self.directory.contains(ObjectType::Gpio) {
      return Ok(None);
    }
    self.vendor_id = None;
    self.bus.write_object(&self.directory, ObjectType::Gpio, t19::CTRL, t19::FORCE_REPORT).await?;
    for _ in 0..GPIO_POLLS {
      self.bus.sleep(GPIO_POLL).await;
      let ctrl = self.bus.read_object(&self.directory, ObjectType::Gpio, t19::CTRL).await?;
      if ctrl & 0x07 == t19::FORCE_REPORT_DONE {
        self.drain(&mut ()).await?;
        return Ok(self.vendor_id);
      }
    }
    warn!("GPIO force report timed out");
    Ok(None)
  }

  async fn read_optional(&mut self, kind: ObjectType, offset: u8) -> Result<Option<u8>, Error<E>> {
    if !self.directory.contains(kind) {
      return Ok(None);
    }
    self.bus.read_object(&self.directory, kind, offset).await.map(Some)
  }

  /// Cache TCHAUX and the registers temporary overrides restore. Returns
  /// whether glove detection, and so sensitive mode, is on.
  async fn read_settings(&mut self) -> Result<bool, Error<E>> {
    self.aux = self.read_optional(ObjectType::MultiTouch, t100::TCHAUX).await?.map_or(TouchAux::new(), TouchAux::from_bits);

    let mut saved = SavedSettings::default();
    if let Some(v) = self.read_optional(ObjectType::AuxTouch, t104::X_TOUCH_THRESHOLD).await? {
      saved.self_threshold = v;
    }
    if let Some(v) = self.read_optional(ObjectType::AuxTouch, t104::X_INTERNAL_THRESHOLD).await? {
      saved.self_internal_threshold = v;
    }
    if let Some(v) = self.read_optional(ObjectType::Retransmission, t80::ANTI_TOUCH_THRESHOLD).await? {
      saved.anti_touch_threshold = v;
    }
    if let Some(v) = self.read_optional(ObjectType::SelfCap, t102::RECALCFG).await? {
      saved.self_recalib = v;
    }
    if self.directory.contains(ObjectType::Acquire) {
      self.bus.read_object_bytes(&self.directory, ObjectType::Acquire, t8::ANTI_CALIB, &mut saved.anti_calib).await?;
    }
    debug!("saved settings {:?}", saved);
    self.saved = saved;

    let glove = self.read_optional(ObjectType::GloveDetection, t78::CTRL).await?;
    Ok(glove.is_some_and(|ctrl| ctrl & t78::ENABLE != 0))
  }

  async fn read_resolution(&mut self) -> Result<(), Error<E>> {
    let dir = &self.directory;
    let mut x = [0u8; 2];
    let mut y = [0u8; 2];
    let orient = if dir.contains(ObjectType::MultiTouch) {
      self.bus.read_object_bytes(dir, ObjectType::MultiTouch, t100::XRANGE_LSB, &mut x).await?;
      self.bus.read_object_bytes(dir, ObjectType::MultiTouch, t100::YRANGE_LSB, &mut y).await?;
      self.bus.read_object(dir, ObjectType::MultiTouch, t100::CFG1).await? >> T100_ORIENT_SHIFT
    } else if dir.contains(ObjectType::LegacyMultiTouch) {
      self.bus.read_object_bytes(dir, ObjectType::LegacyMultiTouch, t9::XRANGE_LSB, &mut x).await?;
      self.bus.read_object_bytes(dir, ObjectType::LegacyMultiTouch, t9::YRANGE_LSB, &mut y).await?;
      self.bus.read_object(dir, ObjectType::LegacyMultiTouch, t9::ORIENT).await?
    } else {
      0
    };

    let (mut max_x, mut max_y) = (u16::from_le_bytes(x), u16::from_le_bytes(y));
    if orient & SWITCH_XY != 0 {
      core::mem::swap(&mut max_x, &mut max_y);
    }
    if max_x == 0 {
      max_x = DEFAULT_RANGE;
    }
    if max_y == 0 {
      max_y = DEFAULT_RANGE;
    }
    self.max_x = max_x;
    self.max_y = max_y;
    Ok(())
  }
}
