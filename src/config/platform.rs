use crate::defs::DEFAULT_ADDRESS;
use crate::object::InfoBlock;

use super::DeviceConfig;

/// Jitter filter and unlock distances, in controller counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TouchFilter {
  /// Freeze distance for a fresh contact.
  pub landing: u16,
  /// Freeze distance for a fresh contact close to either x edge.
  pub landing_edge: u16,
  /// Freeze distance once the landing window has passed without movement.
  pub staying: u16,
  /// Freeze distance for a contact that has moved.
  pub moving: u16,
  /// Travel that unlocks the panel after resume, as a straight-line
  /// distance. Board files that give this as a squared distance need the
  /// square root taken before it lands here.
  pub unlock_move: u16,
  /// Length of the landing window, milliseconds.
  pub landing_ms: u32,
  /// Width of the x edge band.
  pub edge_clip: u16,
}

impl TouchFilter {
  pub const fn new() -> Self {
    Self {
      landing: 0,
      landing_edge: 0,
      staying: 0,
      moving: 0,
      unlock_move: 0,
      landing_ms: 0,
      edge_clip: 0,
    }
  }

  pub const fn with_landing(mut self, landing: u16, edge: u16, window_ms: u32, edge_clip: u16) -> Self {
    self.landing = landing;
    self.landing_edge = edge;
    self.landing_ms = window_ms;
    self.edge_clip = edge_clip;
    self
  }

  pub const fn with_staying(mut self, staying: u16) -> Self {
    self.staying = staying;
    self
  }

  pub const fn with_moving(mut self, moving: u16) -> Self {
    self.moving = moving;
    self
  }

  pub const fn with_unlock_move(mut self, distance: u16) -> Self {
    self.unlock_move = distance;
    self
  }
}

impl Default for TouchFilter {
  fn default() -> Self {
    Self::new()
  }
}

/// T100 linearity registers and the values written for each noise mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linearity<'a> {
  pub positions: &'a [u8],
  pub single_x: &'a [u8],
  pub dual_x: &'a [u8],
}

impl<'a> Linearity<'a> {
  pub const fn new(positions: &'a [u8], single_x: &'a [u8], dual_x: &'a [u8]) -> Self {
    Self { positions, single_x, dual_x }
  }

  /// `(register, value)` pairs for the selected mode.
  pub(crate) fn values(&self, dual_x: bool) -> impl Iterator<Item = (u8, u8)> + 'a {
    let positions: &'a [u8] = self.positions;
    let table: &'a [u8] = if dual_x { self.dual_x } else { self.single_x };
    positions.iter().copied().zip(table.iter().copied())
  }
}

/// Everything the board tells the driver.
#[derive(Debug, Clone, Copy)]
pub struct Platform<'a> {
  pub address: u8,
  pub variants: &'a [DeviceConfig<'a>],
  /// LCD id of the fitted panel, matched against non-default variants.
  pub lcd_id: u8,
  /// Mask applied to the T19 GPIO report to form the vendor id.
  pub gpio_mask: u8,
  pub filter: TouchFilter,
  /// Receive lines of the sensor matrix.
  pub rx_lines: u8,
  /// Transmit lines of the sensor matrix.
  pub tx_lines: u8,
  /// Neighbour difference that marks a reference line as noisy.
  pub reference_threshold: u16,
  pub linearity: Linearity<'a>,
}

impl<'a> Platform<'a> {
  pub const fn new(variants: &'a [DeviceConfig<'a>]) -> Self {
    Self {
      address: DEFAULT_ADDRESS,
      variants,
      lcd_id: 1,
      gpio_mask: 0xFF,
      filter: TouchFilter::new(),
      rx_lines: 0,
      tx_lines: 0,
      reference_threshold: 0,
      linearity: Linearity::new(&[], &[], &[]),
    }
  }

  pub const fn with_address(mut self, address: u8) -> Self {
    self.address = address;
    self
  }

  pub const fn with_lcd_id(mut self, lcd_id: u8) -> Self {
    self.lcd_id = lcd_id;
    self
  }

  pub const fn with_gpio_mask(mut self, mask: u8) -> Self {
    self.gpio_mask = mask;
    self
  }

  pub const fn with_filter(mut self, filter: TouchFilter) -> Self {
    self.filter = filter;
    self
  }

  pub const fn with_matrix(mut self, rx_lines: u8, tx_lines: u8, reference_threshold: u16) -> Self {
    self.rx_lines = rx_lines;
    self.tx_lines = tx_lines;
    self.reference_threshold = reference_threshold;
    self
  }

  pub const fn with_linearity(mut self, linearity: Linearity<'a>) -> Self {
    self.linearity = linearity;
    self
  }

  /// Pick the variant for this part. Without a vendor id the first part
  /// match wins.
  pub fn select(&self, info: &InfoBlock, vendor_id: Option<u8>) -> Option<usize> {
    self.variants.iter().position(|v| {
      v.same_part(info)
        && match vendor_id {
          Some(id) => v.vendor_id == id && v.lcd_id == self.lcd_id,
          None => true,
        }
    })
  }

  pub(crate) fn variant(&self, index: usize) -> Option<&DeviceConfig<'a>> {
    self.variants.get(index)
  }
}

impl Default for Platform<'_> {
  fn default() -> Self {
    Self::new(&[])
  }
}
