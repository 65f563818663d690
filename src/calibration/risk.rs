use heapless::Vec;

/// Interference verdict for one diagnostic sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Risk {
  None,
  Present,
  /// Present, but explained by a finger on the panel.
  Ignore,
}

/// Consecutive clean samples needed to turn anti-touch calibration off.
pub(crate) const RATCHET_CEILING: u8 = 8;

/// Saturating counter of clean monitor samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Ratchet {
  count: u8,
}

impl Ratchet {
  pub(crate) const fn new() -> Self {
    Self { count: 0 }
  }

  /// Feed one sample. Returns true when the ceiling is reached; the counter
  /// starts over from zero afterwards.
  pub(crate) fn record(&mut self, risk: Risk) -> bool {
    match risk {
      Risk::None => self.count += 1,
      Risk::Present => self.count = self.count.saturating_sub(2),
      Risk::Ignore => {}
    }
    if self.count >= RATCHET_CEILING {
      self.count = 0;
      true
    } else {
      false
    }
  }

  pub(crate) fn reset(&mut self) {
    self.count = 0;
  }

  pub(crate) fn count(&self) -> u8 {
    self.count
  }
}

const MAX_IGNORED: usize = 8;

/// Matrix lines excluded from reference scans because they are noisy by
/// construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct IgnoreLines {
  pub(crate) rx: Vec<u8, MAX_IGNORED>,
  pub(crate) tx: Vec<u8, MAX_IGNORED>,
}

impl IgnoreLines {
  pub(crate) const fn new() -> Self {
    Self { rx: Vec::new(), tx: Vec::new() }
  }

  pub(crate) fn clear(&mut self) {
    self.rx.clear();
    self.tx.clear();
  }

  fn add(lines: &mut Vec<u8, MAX_IGNORED>, line: u8) {
    if !lines.contains(&line) && lines.push(line).is_err() {
      warn!("ignore list full, line {} kept", line);
    }
  }

  /// Enough lines were flagged to distrust the whole scan.
  pub(crate) fn saturated(&self) -> bool {
    self.rx.len() >= 3 || self.tx.len() >= 3
  }
}

fn sample(buf: &[u8], index: usize) -> i32 {
  i16::from_le_bytes([buf[2 * index], buf[2 * index + 1]]) as i32
}

/// Any delta above `threshold` in magnitude is a risk.
pub(crate) fn scan_delta(buf: &[u8], threshold: u16) -> Risk {
  let samples = buf.len() / 2;
  if (0..samples).any(|i| sample(buf, i).abs() > threshold as i32) {
    Risk::Present
  } else {
    Risk::None
  }
}

/// How a reference scan treats a neighbour difference above threshold.
pub(crate) enum ReferenceMode<'l> {
  /// Record the offending lines and track the largest difference.
  Survey(&'l mut IgnoreLines),
  /// Report risk unless the line is already ignored.
  Check(&'l IgnoreLines),
}

/// Walk the reference matrix row by row comparing each node with its left
/// and upper neighbours. The last column, the bottom four rows and the
/// middle row are skipped.
///
/// Returns the verdict and the largest difference recorded in survey mode.
pub(crate) fn scan_reference(buf: &[u8], rx: u8, tx: u8, threshold: u16, mut mode: ReferenceMode<'_>) -> (Risk, u16) {
  let (rx, tx) = (rx as i32, tx as i32);
  if rx == 0 || tx == 0 {
    return (Risk::None, 0);
  }
  let limit = (rx * tx) as usize;
  let samples = (buf.len() / 2).min(limit);
  let mut max_diff = 0u16;
  let mut row = 0i32;
  let mut col = 0i32;
  let mut prev = 0i32;

  for k in 0..samples {
    let value = sample(buf, k);
    col += 1;

    let interior = row < tx - 4;
    let mut flagged = |diff: i32, rx_line: Option<u8>, tx_line: Option<u8>| -> bool {
      let magnitude = diff.unsigned_abs();
      let over = magnitude >= threshold as u32;
      match &mut mode {
        ReferenceMode::Survey(lines) => {
          // The maximum covers every interior step, not just the flagged ones.
          max_diff = max_diff.max(magnitude.min(u16::MAX as u32) as u16);
          if over {
            if let Some(l) = rx_line {
              IgnoreLines::add(&mut lines.rx, l);
            }
            if let Some(l) = tx_line {
              IgnoreLines::add(&mut lines.tx, l);
            }
          }
          false
        }
        ReferenceMode::Check(lines) => {
          let ignored = rx_line.is_some_and(|l| lines.rx.contains(&l)) || tx_line.is_some_and(|l| lines.tx.contains(&l));
          over && !ignored
        }
      }
    };

    if col >= 2 && col < rx - 1 && interior && flagged(value - prev, Some(col as u8), None) {
      return (Risk::Present, max_diff);
    }
    if row >= 1 && interior && row != tx / 2 {
      let above = sample(buf, k - rx as usize);
      if flagged(value - above, None, Some(row as u8)) {
        return (Risk::Present, max_diff);
      }
    }

    if col == rx {
      col = 0;
      row += 1;
    }
    prev = value;
  }
  (Risk::None, max_diff)
}

/// Self-cap risk is discounted while a finger explains it.
pub(crate) fn discount_touch(risk: Risk, unlocked: bool, touch_count: u8) -> Risk {
  match risk {
    Risk::Present if (unlocked && touch_count > 0) || (!unlocked && touch_count == 1) => Risk::Ignore,
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn matrix(rx: usize, tx: usize, f: impl Fn(usize, usize) -> i16) -> std::vec::Vec<u8> {
    let mut out = std::vec::Vec::new();
    for row in 0..tx {
      for col in 0..rx {
        out.extend_from_slice(&f(row, col).to_le_bytes());
      }
    }
    out
  }

  #[test]
  fn ratchet_climbs_and_drops() {
    let mut r = Ratchet::new();
    assert!(!r.record(Risk::Present));
    assert_eq!(r.count(), 0);
    for _ in 0..7 {
      assert!(!r.record(Risk::None));
    }
    assert!(!r.record(Risk::Present));
    assert_eq!(r.count(), 5);
    assert!(!r.record(Risk::Ignore));
    assert_eq!(r.count(), 5);
    for _ in 0..2 {
      assert!(!r.record(Risk::None));
    }
    assert!(r.record(Risk::None));
    assert_eq!(r.count(), 0);
  }

  #[test]
  fn delta_threshold_is_strict() {
    let buf = matrix(4, 2, |_, c| if c == 2 { -40 } else { 3 });
    assert_eq!(scan_delta(&buf, 40), Risk::None);
    assert_eq!(scan_delta(&buf, 39), Risk::Present);
  }

  #[test]
  fn survey_flags_column_and_row_lines() {
    // 8 columns by 10 rows; a step at column 3 and another at row 2.
    let buf = matrix(8, 10, |r, c| {
      let mut v = 1000;
      if c >= 3 {
        v += 200;
      }
      if r >= 2 {
        v += 300;
      }
      v
    });
    let mut lines = IgnoreLines::new();
    let (risk, max) = scan_reference(&buf, 8, 10, 100, ReferenceMode::Survey(&mut lines));
    assert_eq!(risk, Risk::None);
    assert_eq!(max, 300);
    assert_eq!(lines.rx.as_slice(), &[4]);
    assert_eq!(lines.tx.as_slice(), &[2]);

    // Ignored lines no longer count; a fresh one does.
    let (risk, _) = scan_reference(&buf, 8, 10, 100, ReferenceMode::Check(&lines));
    assert_eq!(risk, Risk::None);
    let (risk, _) = scan_reference(&buf, 8, 10, 100, ReferenceMode::Check(&IgnoreLines::new()));
    assert_eq!(risk, Risk::Present);
  }

  #[test]
  fn survey_maximum_includes_quiet_steps() {
    // Column steps of 60 and row steps of 70, all below the threshold.
    let buf = matrix(8, 10, |r, c| (c * 60 + r * 70) as i16);
    let mut lines = IgnoreLines::new();
    let (risk, max) = scan_reference(&buf, 8, 10, 100, ReferenceMode::Survey(&mut lines));
    assert_eq!(risk, Risk::None);
    assert_eq!(max, 70);
    assert!(lines.rx.is_empty());
    assert!(lines.tx.is_empty());
  }

  #[test]
  fn skipped_regions_never_flag() {
    // Steps only in the last column, the middle row and the bottom rows.
    let buf = matrix(6, 10, |r, c| if c == 5 || r == 5 || r >= 6 { 5000 } else { 0 });
    let (risk, _) = scan_reference(&buf, 6, 10, 100, ReferenceMode::Check(&IgnoreLines::new()));
    assert_eq!(risk, Risk::None);
  }

  #[test]
  fn touch_discount() {
    assert_eq!(discount_touch(Risk::Present, false, 1), Risk::Ignore);
    assert_eq!(discount_touch(Risk::Present, false, 2), Risk::Present);
    assert_eq!(discount_touch(Risk::Present, true, 2), Risk::Ignore);
    assert_eq!(discount_touch(Risk::Present, true, 0), Risk::Present);
    assert_eq!(discount_touch(Risk::None, true, 3), Risk::None);
  }
}
