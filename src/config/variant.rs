use crate::object::InfoBlock;

/// Board data for one silicon/firmware/panel combination.
///
/// The driver picks the first entry whose identity matches the info block
/// and, when the vendor id could be read, whose vendor and LCD ids match too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig<'a> {
  pub family_id: u8,
  pub variant_id: u8,
  pub version: u8,
  pub build: u8,
  pub vendor_id: u8,
  pub lcd_id: u8,
  /// Raw `OBP_RAW V1` configuration text to download, if any.
  pub config: Option<&'a str>,
  /// Key codes for the T15 key array, one per key bit.
  pub key_codes: &'a [u16],

  pub self_threshold_suspend: u8,
  pub self_internal_threshold_suspend: u8,
  pub self_internal_threshold_stylus: u8,

  pub mutual_internal_threshold: u8,
  pub mutual_touch_threshold: u8,
  pub mutual_internal_threshold_sensitive: u8,
  pub mutual_touch_threshold_sensitive: u8,
  pub anti_touch_threshold_sensitive: u8,
  /// Byte of T71 that mirrors the T100 touch threshold.
  pub t71_touch_threshold_pos: u8,

  /// Self-cap delta above which a sample counts as a risk.
  pub self_no_touch_threshold: u16,
  /// Mutual delta above which a sample counts as a risk.
  pub mutual_no_touch_threshold: u16,

  pub self_charge_time_min: u8,
  pub self_charge_time_max: u8,
}

impl<'a> DeviceConfig<'a> {
  pub const fn new(family_id: u8, variant_id: u8, version: u8, build: u8) -> Self {
    Self {
      family_id,
      variant_id,
      version,
      build,
      vendor_id: 0,
      lcd_id: 1,
      config: None,
      key_codes: &[],
      self_threshold_suspend: 0,
      self_internal_threshold_suspend: 0,
      self_internal_threshold_stylus: 0,
      mutual_internal_threshold: 0,
      mutual_touch_threshold: 0,
      mutual_internal_threshold_sensitive: 0,
      mutual_touch_threshold_sensitive: 0,
      anti_touch_threshold_sensitive: 0,
      t71_touch_threshold_pos: 0,
      self_no_touch_threshold: 0,
      mutual_no_touch_threshold: 0,
      self_charge_time_min: 0,
      self_charge_time_max: u8::MAX,
    }
  }

  pub const fn with_vendor(mut self, vendor_id: u8, lcd_id: u8) -> Self {
    self.vendor_id = vendor_id;
    self.lcd_id = lcd_id;
    self
  }

  pub const fn with_config(mut self, text: &'a str) -> Self {
    self.config = Some(text);
    self
  }

  pub const fn with_keys(mut self, codes: &'a [u16]) -> Self {
    self.key_codes = codes;
    self
  }

  /// T104 overrides: touch while suspended, internal while suspended,
  /// internal while a stylus is enabled. Zero leaves a pair untouched.
  pub const fn with_self_thresholds(mut self, suspend: u8, internal_suspend: u8, internal_stylus: u8) -> Self {
    self.self_threshold_suspend = suspend;
    self.self_internal_threshold_suspend = internal_suspend;
    self.self_internal_threshold_stylus = internal_stylus;
    self
  }

  /// T100 thresholds in normal mode. A zero touch threshold is never written.
  pub const fn with_mutual_thresholds(mut self, internal: u8, touch: u8) -> Self {
    self.mutual_internal_threshold = internal;
    self.mutual_touch_threshold = touch;
    self
  }

  pub const fn with_sensitive_thresholds(mut self, internal: u8, touch: u8, anti_touch: u8) -> Self {
    self.mutual_internal_threshold_sensitive = internal;
    self.mutual_touch_threshold_sensitive = touch;
    self.anti_touch_threshold_sensitive = anti_touch;
    self
  }

  pub const fn with_t71_touch_threshold_pos(mut self, pos: u8) -> Self {
    self.t71_touch_threshold_pos = pos;
    self
  }

  pub const fn with_no_touch_thresholds(mut self, self_cap: u16, mutual: u16) -> Self {
    self.self_no_touch_threshold = self_cap;
    self.mutual_no_touch_threshold = mutual;
    self
  }

  pub const fn with_charge_time(mut self, min: u8, max: u8) -> Self {
    self.self_charge_time_min = min;
    self.self_charge_time_max = max;
    self
  }

  /// Thresholds for the current mode as `(internal, touch)`.
  pub(crate) const fn mutual(&self, sensitive: bool) -> (u8, u8) {
    if sensitive {
      (self.mutual_internal_threshold_sensitive, self.mutual_touch_threshold_sensitive)
    } else {
      (self.mutual_internal_threshold, self.mutual_touch_threshold)
    }
  }

  pub(crate) const fn same_part(&self, info: &InfoBlock) -> bool {
    self.family_id == info.family_id
      && self.variant_id == info.variant_id
      && self.version == info.version
      && self.build == info.build
  }
}
