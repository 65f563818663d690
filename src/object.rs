use core::ops::RangeInclusive;

use heapless::Vec;

use crate::defs::*;
use crate::reg::ObjectType;

/// Identification block at the very start of the register space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InfoBlock {
  pub family_id: u8,
  pub variant_id: u8,
  pub version: u8,
  pub build: u8,
  pub matrix_x: u8,
  pub matrix_y: u8,
  pub object_count: u8,
}

impl InfoBlock {
  pub const fn to_bytes(self) -> [u8; INFO_BLOCK_LEN] {
    [self.family_id, self.variant_id, self.version, self.build, self.matrix_x, self.matrix_y, self.object_count]
  }

  /// Firmware version as `(major, minor)`.
  pub const fn firmware(&self) -> (u8, u8) {
    (self.version >> 4, self.version & 0x0F)
  }

  /// Same silicon and firmware, ignoring matrix size and object count.
  pub const fn same_part(&self, other: &InfoBlock) -> bool {
    self.family_id == other.family_id
      && self.variant_id == other.variant_id
      && self.version == other.version
      && self.build == other.build
  }
}

impl From<[u8; INFO_BLOCK_LEN]> for InfoBlock {
  fn from(b: [u8; INFO_BLOCK_LEN]) -> Self {
    Self {
      family_id: b[0],
      variant_id: b[1],
      version: b[2],
      build: b[3],
      matrix_x: b[4],
      matrix_y: b[5],
      object_count: b[6],
    }
  }
}

/// One entry of the object table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ObjectDescriptor {
  pub kind: ObjectType,
  pub start_address: u16,
  pub element_size: u16,
  pub instance_count: u16,
  pub report_id_count: u8,
  pub min_report_id: u8,
  pub max_report_id: u8,
}

impl ObjectDescriptor {
  fn parse(raw: &[u8]) -> Self {
    Self {
      kind: ObjectType::from_number(raw[0]),
      start_address: u16::from_le_bytes([raw[1], raw[2]]),
      element_size: raw[3] as u16 + 1,
      instance_count: raw[4] as u16 + 1,
      report_id_count: raw[5],
      min_report_id: 0,
      max_report_id: 0,
    }
  }

  /// Report ids claimed by this object, if it reports at all.
  pub fn report_ids(&self) -> Option<RangeInclusive<u8>> {
    (self.report_id_count > 0).then(|| self.min_report_id..=self.max_report_id)
  }

  pub fn owns_report_id(&self, id: u8) -> bool {
    self.report_id_count > 0 && (self.min_report_id..=self.max_report_id).contains(&id)
  }

  /// Number of report ids across all instances.
  pub fn total_report_ids(&self) -> u16 {
    self.report_id_count as u16 * self.instance_count
  }

  /// Register address of `offset` within the given instance.
  pub fn address(&self, instance: u16, offset: u16) -> u16 {
    self.start_address.wrapping_add(self.element_size * instance).wrapping_add(offset)
  }

  /// One past the last register of the last instance.
  pub fn end_address(&self) -> u32 {
    self.start_address as u32 + self.element_size as u32 * self.instance_count as u32
  }
}

/// Reasons an object table is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TableError {
  /// Raw table length does not match the object count.
  Length,
  TooManyObjects,
  /// More report ids than fit below the `0xFF` sentinel.
  ReportIdOverflow,
  /// An object extends past the 16-bit register space.
  AddressOverflow,
  NoMessageObject,
  /// Message records are larger than the decoder buffer.
  MessageTooLarge,
  /// The message count object is not directly followed by the message object.
  CountNotAdjacent,
}

/// Index of all objects exposed by the controller, built once per initialize.
#[derive(Clone, Debug)]
pub struct ObjectDirectory {
  info: InfoBlock,
  objects: Vec<ObjectDescriptor, MAX_OBJECTS>,
  max_report_id: u8,
  message_size: u8,
  mem_size: u32,
}

impl ObjectDirectory {
  pub(crate) const fn empty() -> Self {
    Self {
      info: InfoBlock {
        family_id: 0,
        variant_id: 0,
        version: 0,
        build: 0,
        matrix_x: 0,
        matrix_y: 0,
        object_count: 0,
      },
      objects: Vec::new(),
      max_report_id: 0,
      message_size: 0,
      mem_size: 0,
    }
  }

  /// Parse the raw object table that follows `info` in the register space.
  pub fn build(info: InfoBlock, table: &[u8]) -> Result<Self, TableError> {
    let count = info.object_count as usize;
    if table.len() != count * OBJECT_ENTRY_LEN {
      return Err(TableError::Length);
    }

    let mut objects = Vec::new();
    let mut report_id: u16 = 0;
    let mut mem_size: u32 = 0;

    for raw in table.chunks_exact(OBJECT_ENTRY_LEN) {
      let mut object = ObjectDescriptor::parse(raw);

      if object.report_id_count > 0 {
        report_id += object.total_report_ids();
        if report_id >= NO_MESSAGE as u16 {
          return Err(TableError::ReportIdOverflow);
        }
        object.max_report_id = report_id as u8;
        object.min_report_id = (report_id + 1 - object.total_report_ids()) as u8;
      }

      let end = object.end_address();
      if end > 0x1_0000 {
        return Err(TableError::AddressOverflow);
      }
      mem_size = mem_size.max(end);

      debug!(
        "T{} start {} size {} instances {} report ids {}..{}",
        object.kind.number(),
        object.start_address,
        object.element_size,
        object.instance_count,
        object.min_report_id,
        object.max_report_id
      );
      objects.push(object).map_err(|_| TableError::TooManyObjects)?;
    }

    let message = objects
      .iter()
      .find(|o| o.kind == ObjectType::Message)
      .ok_or(TableError::NoMessageObject)?;

    // Parts without the full-message family id append a CRC byte that is never read.
    let message_size = if info.family_id == FAMILY_FULL_MESSAGE {
      message.element_size
    } else {
      message.element_size.saturating_sub(1)
    };
    if message_size < 2 || message_size as usize > MAX_MESSAGE_SIZE {
      return Err(TableError::MessageTooLarge);
    }

    if let Some(count) = objects.iter().find(|o| o.kind == ObjectType::MessageCount) {
      if message.start_address != count.start_address.wrapping_add(1) {
        return Err(TableError::CountNotAdjacent);
      }
    }

    Ok(Self {
      info,
      objects,
      max_report_id: report_id as u8,
      message_size: message_size as u8,
      mem_size,
    })
  }

  pub fn info(&self) -> &InfoBlock {
    &self.info
  }

  pub fn objects(&self) -> &[ObjectDescriptor] {
    &self.objects
  }

  pub fn lookup(&self, kind: ObjectType) -> Option<&ObjectDescriptor> {
    self.objects.iter().find(|o| o.kind == kind)
  }

  pub fn contains(&self, kind: ObjectType) -> bool {
    self.lookup(kind).is_some()
  }

  pub fn lookup_by_report_id(&self, id: u8) -> Option<ObjectType> {
    self.objects.iter().find(|o| o.owns_report_id(id)).map(|o| o.kind)
  }

  /// Highest report id in use.
  pub fn max_report_id(&self) -> u8 {
    self.max_report_id
  }

  /// Size of one message record in bytes.
  pub fn message_size(&self) -> usize {
    self.message_size as usize
  }

  /// One past the highest object register.
  pub fn mem_size(&self) -> u32 {
    self.mem_size
  }

  /// First register after the info block and object table. The info block
  /// CRC lives here and is overwritten by a configuration image.
  pub fn config_start(&self) -> u16 {
    OBJECT_TABLE_START + (self.info.object_count as usize * OBJECT_ENTRY_LEN) as u16
  }

  /// Register holding the info block CRC.
  pub(crate) fn info_crc_address(&self) -> u16 {
    self.config_start()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.objects.is_empty()
  }
}
