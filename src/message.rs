use bitfield_struct::bitfield;

use crate::defs::MAX_MESSAGE_SIZE;
use crate::event::Tool;
use crate::touchpad::Report;

/// One message record. Byte 0 is the report id; the rest is object payload.
pub(crate) type Record = [u8; MAX_MESSAGE_SIZE];

/// T9 per-touch status.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct LegacyTouchStatus {
  pub(crate) ungrip: bool,
  pub(crate) suppress: bool,
  pub(crate) amplitude: bool,
  pub(crate) vector: bool,
  pub(crate) moving: bool,
  pub(crate) release: bool,
  pub(crate) press: bool,
  pub(crate) detect: bool,
}

/// T100 per-touch status.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct TouchStatus {
  #[bits(4)]
  pub(crate) event: u8,
  #[bits(3)]
  pub(crate) kind: TouchKind,
  pub(crate) detect: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub(crate) enum TouchKind {
  Reserved = 0,
  Finger = 1,
  PassiveStylus = 2,
  ActiveStylus = 3,
  Hover = 4,
  Glove = 5,
  LargeTouch = 6,
}

impl TouchKind {
  pub(crate) const fn into_bits(self) -> u8 {
    self as _
  }

  pub(crate) const fn from_bits(bits: u8) -> Self {
    match bits {
      1 => Self::Finger,
      2 => Self::PassiveStylus,
      3 => Self::ActiveStylus,
      4 => Self::Hover,
      5 => Self::Glove,
      6 => Self::LargeTouch,
      _ => Self::Reserved,
    }
  }
}

/// T100 screen status, report id offset 0.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct ScreenStatus {
  #[bits(6)]
  __: u8,
  pub(crate) suppressed: bool,
  ___: bool,
}

/// T100 TCHAUX: which auxiliary bytes follow the coordinates, in bit order.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct TouchAux {
  pub(crate) vector: bool,
  pub(crate) amplitude: bool,
  pub(crate) area: bool,
  __: bool,
  pub(crate) peak: bool,
  #[bits(3)]
  ___: u8,
}

/// T63 active stylus status, byte 2.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct StylusStatus {
  #[bits(4)]
  __: u8,
  pub(crate) detect: bool,
  pub(crate) tip: bool,
  pub(crate) eraser: bool,
  pub(crate) barrel: bool,
}

/// T48 noise suppression status.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct NoiseStatus {
  pub(crate) frequency_change: bool,
  pub(crate) adaptive_change: bool,
  pub(crate) algorithm_error: bool,
  __: bool,
  pub(crate) state_change: bool,
  pub(crate) level_change: bool,
  #[bits(2)]
  ___: u8,
}

/// T66 golden reference status.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub(crate) struct GoldenStatus {
  pub(crate) bad_stored_data: bool,
  #[bits(2)]
  pub(crate) state: u8,
  pub(crate) sequence_error: bool,
  pub(crate) sequence_timeout: bool,
  pub(crate) sequence_done: bool,
  pub(crate) pass: bool,
  pub(crate) fail: bool,
}

/// Where a golden reference sequence stands after one status message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GoldenPhase {
  /// Unrecognized status.
  Invalid,
  Prime,
  Generate,
  GeneratePass,
  GenerateFail,
  /// Sequence finished and the object is idle again.
  Idle,
  SeqError,
}

const GOLDEN_STATE_PRIME: u8 = 1;
const GOLDEN_STATE_GENERATE: u8 = 2;
const GOLDEN_IDLE: u8 = 0x20;
const GOLDEN_GENERATE_PASS: u8 = 0x44;
const GOLDEN_GENERATE_FAIL: u8 = 0x84;

impl GoldenStatus {
  pub(crate) fn phase(self) -> GoldenPhase {
    let raw = self.into_bits();
    if self.sequence_error() {
      GoldenPhase::SeqError
    } else if raw == GOLDEN_IDLE {
      GoldenPhase::Idle
    } else {
      match self.state() {
        GOLDEN_STATE_PRIME => GoldenPhase::Prime,
        GOLDEN_STATE_GENERATE => match raw {
          GOLDEN_GENERATE_PASS => GoldenPhase::GeneratePass,
          GOLDEN_GENERATE_FAIL => GoldenPhase::GenerateFail,
          _ => GoldenPhase::Generate,
        },
        _ => GoldenPhase::Invalid,
      }
    }
  }
}

/// T102 tune report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct SelfCapStatus {
  pub(crate) cause: u8,
  pub(crate) error: u8,
}

/// Cause byte of a T102 message that reports the end of a tune.
pub(crate) const SELF_CAP_TUNE_DONE: u8 = 3;

impl SelfCapStatus {
  /// Charge time too short for at least one line.
  pub(crate) const fn needs_more_charge(&self) -> bool {
    self.error & 0x02 != 0
  }

  pub(crate) const fn needs_less_charge(&self) -> bool {
    self.error & 0x01 != 0
  }
}

/// 24-bit config checksum carried by T6 messages.
pub(crate) fn config_crc(msg: &Record) -> u32 {
  u32::from_le_bytes([msg[2], msg[3], msg[4], 0])
}

/// T9 packs 12-bit coordinates; panels under 1024 counts use the top 10 bits.
pub(crate) fn decode_legacy_touch(index: u8, msg: &Record, max_x: u16, max_y: u16) -> Report {
  let status = LegacyTouchStatus::from_bits(msg[1]);
  let mut x = ((msg[2] as u16) << 4) | (msg[4] >> 4) as u16;
  let mut y = ((msg[3] as u16) << 4) | (msg[4] & 0x0F) as u16;
  if max_x < 1024 {
    x >>= 2;
  }
  if max_y < 1024 {
    y >>= 2;
  }
  Report {
    index,
    detect: status.detect(),
    release: status.release(),
    x,
    y,
    area: Some(msg[5]),
    pressure: Some(msg[6]),
    orientation: Some(msg[7]),
    peak: None,
  }
}

/// T100 finger record. Auxiliary bytes are present only for the fields
/// enabled in TCHAUX, packed from byte 6. Zero aux values are reported as 1.
pub(crate) fn decode_touch(index: u8, msg: &Record, aux: TouchAux) -> Report {
  let status = TouchStatus::from_bits(msg[1]);
  let mut at = 6;
  let mut next = |enabled: bool| {
    enabled.then(|| {
      let v = msg.get(at).copied().unwrap_or(0);
      at += 1;
      v.max(1)
    })
  };
  let orientation = next(aux.vector());
  let pressure = next(aux.amplitude());
  let area = next(aux.area());
  let peak = next(aux.peak());

  Report {
    index,
    detect: status.detect(),
    release: false,
    x: u16::from_le_bytes([msg[2], msg[3]]),
    y: u16::from_le_bytes([msg[4], msg[5]]),
    pressure,
    area,
    orientation,
    peak,
  }
}

/// T63 active stylus record.
pub(crate) fn decode_stylus(index: u8, msg: &Record) -> (Report, Tool) {
  let status = StylusStatus::from_bits(msg[2]);
  let report = Report {
    index,
    detect: status.detect(),
    x: u16::from_le_bytes([msg[3], msg[4]]),
    y: u16::from_le_bytes([msg[5], msg[6]]),
    pressure: Some(msg[7] & 0x3F),
    ..Report::default()
  };
  (report, Tool::Pen { eraser: status.eraser(), barrel: status.barrel() })
}
