/******************************************************************************
 * maXTouch object protocol: object types, register offsets and values.       *
 * ========================================================================== *
 * Every functional unit of the controller is an "object" whose location is   *
 * discovered at runtime from the object table. Offsets below are relative    *
 * to the start address of the first instance of the owning object.           *
*******************************************************************************/

/// Object kinds this driver knows how to talk to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectType {
  /// T5, message processor.
  Message,
  /// T6, command processor.
  Command,
  /// T7, power configuration.
  Power,
  /// T8, acquisition configuration.
  Acquire,
  /// T9, legacy multiple touch screen.
  LegacyMultiTouch,
  /// T15, key array.
  KeyArray,
  /// T19, GPIO/PWM.
  Gpio,
  /// T22, noise suppression.
  Noise,
  /// T25, self test.
  SelfTest,
  /// T37, diagnostic debug.
  Diagnostic,
  /// T38, user data.
  UserData,
  /// T42, touch suppression.
  TouchSuppression,
  /// T44, message count.
  MessageCount,
  /// T47, passive stylus.
  Stylus,
  /// T48, noise suppression.
  NoiseSuppression,
  /// T63, active stylus.
  ActiveStylus,
  /// T66, golden references.
  GoldenReference,
  /// T71, dynamic configuration data.
  DynamicData,
  /// T72, noise suppression (dual-X).
  NoiseSuppressionDualX,
  /// T78, glove detection.
  GloveDetection,
  /// T80, retransmission compensation.
  Retransmission,
  /// T100, multiple touch screen.
  MultiTouch,
  /// T102, self capacitance configuration.
  SelfCap,
  /// T104, auxiliary touch configuration.
  AuxTouch,
  /// Anything else. Kept so the directory can still index it.
  Other(u8),
}

impl ObjectType {
  pub const fn from_number(n: u8) -> Self {
    match n {
      5 => Self::Message,
      6 => Self::Command,
      7 => Self::Power,
      8 => Self::Acquire,
      9 => Self::LegacyMultiTouch,
      15 => Self::KeyArray,
      19 => Self::Gpio,
      22 => Self::Noise,
      25 => Self::SelfTest,
      37 => Self::Diagnostic,
      38 => Self::UserData,
      42 => Self::TouchSuppression,
      44 => Self::MessageCount,
      47 => Self::Stylus,
      48 => Self::NoiseSuppression,
      63 => Self::ActiveStylus,
      66 => Self::GoldenReference,
      71 => Self::DynamicData,
      72 => Self::NoiseSuppressionDualX,
      78 => Self::GloveDetection,
      80 => Self::Retransmission,
      100 => Self::MultiTouch,
      102 => Self::SelfCap,
      104 => Self::AuxTouch,
      other => Self::Other(other),
    }
  }

  /// The `Tnn` number of this object.
  pub const fn number(self) -> u8 {
    match self {
      Self::Message => 5,
      Self::Command => 6,
      Self::Power => 7,
      Self::Acquire => 8,
      Self::LegacyMultiTouch => 9,
      Self::KeyArray => 15,
      Self::Gpio => 19,
      Self::Noise => 22,
      Self::SelfTest => 25,
      Self::Diagnostic => 37,
      Self::UserData => 38,
      Self::TouchSuppression => 42,
      Self::MessageCount => 44,
      Self::Stylus => 47,
      Self::NoiseSuppression => 48,
      Self::ActiveStylus => 63,
      Self::GoldenReference => 66,
      Self::DynamicData => 71,
      Self::NoiseSuppressionDualX => 72,
      Self::GloveDetection => 78,
      Self::Retransmission => 80,
      Self::MultiTouch => 100,
      Self::SelfCap => 102,
      Self::AuxTouch => 104,
      Self::Other(n) => n,
    }
  }
}

impl From<u8> for ObjectType {
  fn from(n: u8) -> Self {
    Self::from_number(n)
  }
}

impl From<ObjectType> for u8 {
  fn from(t: ObjectType) -> Self {
    t.number()
  }
}

/// T6 command processor.
pub(crate) mod t6 {
  pub(crate) const RESET: u8 = 0;
  pub(crate) const BACKUP_NV: u8 = 1;
  pub(crate) const CALIBRATE: u8 = 2;
  pub(crate) const REPORT_ALL: u8 = 3;
  pub(crate) const DIAGNOSTIC: u8 = 5;

  pub(crate) const RESET_VALUE: u8 = 0x01;
  pub(crate) const BACKUP_VALUE: u8 = 0x55;

  // Diagnostic modes
  pub(crate) const DIAG_PAGE_UP: u8 = 0x01;
  pub(crate) const DIAG_MUTUAL_DELTA: u8 = 0x10;
  pub(crate) const DIAG_MUTUAL_REFERENCE: u8 = 0x11;
  pub(crate) const DIAG_SELF_DELTA: u8 = 0xFC;
}

/// T7 power configuration.
pub(crate) mod t7 {
  pub(crate) const IDLE_ACQ_INT: u8 = 0;
  pub(crate) const ACTIVE_ACQ_INT: u8 = 1;
  pub(crate) const ACTIVE_TO_IDLE: u8 = 2;

  pub(crate) const FREE_RUN: u8 = 255;
}

/// T8 acquisition configuration.
pub(crate) mod t8 {
  pub(crate) const ANTI_CALIB: u8 = 6;
  pub(crate) const MEAS_ALLOW: u8 = 10;

  pub(crate) const MEAS_ALLOW_MUTUAL: u8 = 1 << 0;
  pub(crate) const MEAS_ALLOW_SELF: u8 = 1 << 1;

  /// ATCHCALST, ATCHCALSTHR, ATCHFRCCALTHR, ATCHFRCCALRATIO with anti-touch off.
  pub(crate) const ANTI_CALIB_OFF: [u8; 4] = [0xFF, 0x01, 0x00, 0x00];
}

/// T9 legacy multiple touch.
pub(crate) mod t9 {
  pub(crate) const ORIENT: u8 = 9;
  pub(crate) const XRANGE_LSB: u8 = 18;
  pub(crate) const YRANGE_LSB: u8 = 20;
}

/// T15 key array.
pub(crate) mod t15 {
  pub(crate) const CTRL: u8 = 0;
  pub(crate) const ADAPTIVE_THRESHOLD: u8 = 1 << 2;
}

/// T19 GPIO/PWM.
pub(crate) mod t19 {
  pub(crate) const CTRL: u8 = 0;
  pub(crate) const FORCE_REPORT: u8 = 0x07;
  pub(crate) const FORCE_REPORT_DONE: u8 = 0x03;
}

/// T22 noise suppression.
pub(crate) mod t22 {
  pub(crate) const CTRL: u8 = 0;
}

/// T25 self test.
pub(crate) mod t25 {
  pub(crate) const CMD: u8 = 1;
  pub(crate) const RUN_ALL: u8 = 0xFE;
}

/// T37 diagnostic debug.
pub(crate) mod t37 {
  /// Diagnostic data starts after the mode and page bytes.
  pub(crate) const DATA: u16 = 2;
  pub(crate) const PAGE_SIZE: usize = 0x80;
}

/// T47 passive stylus.
pub(crate) mod t47 {
  pub(crate) const CTRL: u8 = 0;
  pub(crate) const ENABLE: u8 = 1 << 0;
}

/// T66 golden references.
pub(crate) mod t66 {
  pub(crate) const CTRL: u8 = 0;

  pub(crate) const ENABLE: u8 = 1 << 0;
  pub(crate) const REPORT_ENABLE: u8 = 1 << 1;
  pub(crate) const USE_CURRENT: u8 = 1 << 7;
}

/// T72 noise suppression (dual-X).
pub(crate) mod t72 {
  pub(crate) const CALCFG: u8 = 1;
  pub(crate) const CFG1: u8 = 2;

  pub(crate) const NOISY: u8 = 1 << 0;
  pub(crate) const VERY_NOISY: u8 = 1 << 1;
}

/// T78 glove detection.
pub(crate) mod t78 {
  pub(crate) const CTRL: u8 = 0;
  pub(crate) const ALL_ENABLE: u8 = 0xB9;
  pub(crate) const ENABLE: u8 = 1 << 0;
}

/// T80 retransmission compensation.
pub(crate) mod t80 {
  pub(crate) const ANTI_TOUCH_THRESHOLD: u8 = 4;
}

/// T100 multiple touch.
pub(crate) mod t100 {
  pub(crate) const CFG1: u8 = 1;
  pub(crate) const TCHAUX: u8 = 3;
  pub(crate) const XRANGE_LSB: u8 = 13;
  pub(crate) const YRANGE_LSB: u8 = 24;
  pub(crate) const TOUCH_THRESHOLD: u8 = 30;
  pub(crate) const INTERNAL_THRESHOLD: u8 = 32;

  /// Report ids 0 and 1 carry screen status; fingers start at 2.
  pub(crate) const FIRST_FINGER: u8 = 2;
}

/// T102 self capacitance.
pub(crate) mod t102 {
  pub(crate) const CMD: u8 = 1;
  pub(crate) const CHARGE_TIME: u8 = 13;
  pub(crate) const RECALCFG: u8 = 28;

  pub(crate) const TUNE: u8 = 0x01;
  pub(crate) const STORE: u8 = 0x05;

  pub(crate) const RECALIB_OFF: u8 = 0x3F;
  pub(crate) const CHARGE_TIME_STEP: u8 = 5;
}

/// T104 auxiliary touch configuration.
pub(crate) mod t104 {
  pub(crate) const X_TOUCH_THRESHOLD: u8 = 2;
  pub(crate) const X_INTERNAL_THRESHOLD: u8 = 4;
  pub(crate) const Y_TOUCH_THRESHOLD: u8 = 7;
  pub(crate) const Y_INTERNAL_THRESHOLD: u8 = 9;
}
