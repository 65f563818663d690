//! `OBP_RAW V1` configuration text.
//!
//! ```text
//! OBP_RAW
//! V1
//! a6 12 10 aa 1c 10 09     info block (7 bytes)
//! 3c2a91                   info block CRC
//! 00e1f0                   config CRC
//! 0007 0000 0004 ff 0a 32 00
//! 0009 0000 0023 ...
//! ```
//!
//! Every token after the magic is hexadecimal. Records are `type instance
//! size` followed by `size` data bytes.

use crate::object::{InfoBlock, ObjectDirectory};
use crate::reg::ObjectType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
  BadMagic,
  /// Text ended inside the header or a record.
  Truncated,
  /// A token is not a hex number of the expected width.
  BadToken,
  UnknownObject(u8),
  BadInstance(u8),
  /// A record lands outside the writable configuration area.
  OutOfRange(u8),
}

struct Cursor<'a> {
  text: &'a str,
  pos: usize,
}

impl<'a> Cursor<'a> {
  fn token(&mut self) -> Option<&'a str> {
    let bytes = self.text.as_bytes();
    while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
      self.pos += 1;
    }
    if self.pos == bytes.len() {
      return None;
    }
    let start = self.pos;
    while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
      self.pos += 1;
    }
    Some(&self.text[start..self.pos])
  }

  fn hex(&mut self, max: u32) -> Result<u32, ConfigError> {
    let token = self.token().ok_or(ConfigError::Truncated)?;
    match u32::from_str_radix(token, 16) {
      Ok(v) if v <= max => Ok(v),
      _ => Err(ConfigError::BadToken),
    }
  }

  fn byte(&mut self) -> Result<u8, ConfigError> {
    self.hex(u8::MAX as u32).map(|v| v as u8)
  }
}

/// Parsed header of a configuration file. Records are decoded lazily.
#[derive(Clone, Copy, Debug)]
pub struct ConfigFile<'a> {
  pub info: InfoBlock,
  pub info_crc: u32,
  pub config_crc: u32,
  body: &'a str,
}

impl<'a> ConfigFile<'a> {
  pub fn parse(text: &'a str) -> Result<Self, ConfigError> {
    let mut cursor = Cursor { text, pos: 0 };
    if cursor.token() != Some("OBP_RAW") || cursor.token() != Some("V1") {
      return Err(ConfigError::BadMagic);
    }

    let mut info = [0u8; 7];
    for b in info.iter_mut() {
      *b = cursor.byte()?;
    }
    let info_crc = cursor.hex(0xFF_FFFF)?;
    let config_crc = cursor.hex(0xFF_FFFF)?;

    Ok(Self { info: InfoBlock::from(info), info_crc, config_crc, body: &text[cursor.pos..] })
  }

  pub fn records(&self) -> Records<'a> {
    Records { cursor: Cursor { text: self.body, pos: 0 }, failed: false }
  }
}

/// One object record. Data bytes are validated when the record is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record<'a> {
  pub kind: u8,
  pub instance: u8,
  pub size: u16,
  data: &'a str,
}

impl<'a> Record<'a> {
  pub fn bytes(&self) -> impl Iterator<Item = u8> + 'a {
    let data: &'a str = self.data;
    data.split_ascii_whitespace().filter_map(|t| u8::from_str_radix(t, 16).ok())
  }

  /// Absolute start address and number of bytes this record writes.
  /// Bytes beyond the object's element size are dropped.
  pub(crate) fn place(&self, dir: &ObjectDirectory) -> Result<(u32, usize), ConfigError> {
    let object = dir.lookup(ObjectType::from_number(self.kind)).ok_or(ConfigError::UnknownObject(self.kind))?;
    if self.instance as u16 >= object.instance_count {
      return Err(ConfigError::BadInstance(self.kind));
    }
    if self.size > object.element_size {
      warn!("T{} record of {} bytes truncated to {}", self.kind, self.size, object.element_size);
    }
    let len = self.size.min(object.element_size) as usize;
    let start = object.address(self.instance as u16, 0) as u32;
    if len > 0 && (start < dir.config_start() as u32 || start + len as u32 > dir.mem_size()) {
      return Err(ConfigError::OutOfRange(self.kind));
    }
    Ok((start, len))
  }
}

pub struct Records<'a> {
  cursor: Cursor<'a>,
  failed: bool,
}

impl<'a> Records<'a> {
  fn record(&mut self, kind: &'a str) -> Result<Record<'a>, ConfigError> {
    let kind = match u32::from_str_radix(kind, 16) {
      Ok(v) if v <= u8::MAX as u32 => v as u8,
      _ => return Err(ConfigError::BadToken),
    };
    let instance = self.cursor.byte()?;
    let size = self.cursor.hex(u16::MAX as u32)? as u16;
    let start = self.cursor.pos;
    for _ in 0..size {
      self.cursor.byte()?;
    }
    Ok(Record { kind, instance, size, data: &self.cursor.text[start..self.cursor.pos] })
  }
}

impl<'a> Iterator for Records<'a> {
  type Item = Result<Record<'a>, ConfigError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.failed {
      return None;
    }
    let kind = self.cursor.token()?;
    let record = self.record(kind);
    self.failed = record.is_err();
    Some(record)
  }
}
