//! Contact slot tracking.
//!
//! Every finger or stylus the controller reports lands in a fixed slot. The
//! tracker keeps the last reported position of each slot and turns decoded
//! touch records into [`InputEvent`]s.
//!
//! # Jitter filter
//!
//! A finger that rests on the panel still wobbles by a few counts. Each slot
//! holds a baseline position; a new sample whose distance from the baseline is
//! below the current threshold is reported *at the baseline*, so resting
//! contacts stand perfectly still. The threshold depends on the slot's
//! history:
//!
//! | slot state                                 | threshold       |
//! |--------------------------------------------|-----------------|
//! | has moved since landing                    | `moving`        |
//! | inside the landing window, near an x edge  | `landing_edge`  |
//! | inside the landing window                  | `landing`       |
//! | landed long ago, never moved               | `staying`       |
//!
//! Once a sample clears the threshold the slot is marked moving and the
//! baseline follows the raw position.
//!
//! # Unlock latch
//!
//! While the panel is "locked" (after power-up or resume), the first single
//! finger position is remembered. If that finger travels at least
//! `unlock_move` counts before lifting, the panel unlocks and the raised
//! suspend thresholds can be restored. A second finger arriving clears the
//! latch.

use crate::config::TouchFilter;
use crate::defs::MAX_SLOTS;
use crate::event::{Contact, InputEvent, InputSink, Tool};

/// One decoded touch record, before filtering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Report {
  /// Index within the reporting object's own slots.
  pub index: u8,
  pub detect: bool,
  /// Explicit release edge. A record without `detect` also releases.
  pub release: bool,
  pub x: u16,
  pub y: u16,
  pub pressure: Option<u8>,
  pub area: Option<u8>,
  pub orientation: Option<u8>,
  pub peak: Option<u8>,
}

/// What a finger record did to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
  Ignored,
  Reported,
  /// The latched finger travelled far enough to unlock the panel.
  Unlocked,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
  tool: Option<Tool>,
  moving: bool,
  x: u16,
  y: u16,
  landed_at: u32,
}

pub(crate) struct Tracker {
  slots: [Slot; MAX_SLOTS],
  fingers: u8,
  styli: u8,
  filter: TouchFilter,
  max_x: u16,
  touch_count: u8,
  latch: Option<(u16, u16)>,
  unlocked: bool,
}

const fn distance_sq(ax: u16, ay: u16, bx: u16, by: u16) -> u64 {
  let dx = ax.abs_diff(bx) as u64;
  let dy = ay.abs_diff(by) as u64;
  dx * dx + dy * dy
}

impl Tracker {
  pub(crate) const fn new(filter: TouchFilter) -> Self {
    Self {
      slots: [Slot { tool: None, moving: false, x: 0, y: 0, landed_at: 0 }; MAX_SLOTS],
      fingers: 0,
      styli: 0,
      filter,
      max_x: 0,
      touch_count: 0,
      latch: None,
      unlocked: false,
    }
  }

  /// Size the slot table. Existing contacts are forgotten without events.
  pub(crate) fn configure(&mut self, fingers: u16, styli: u16, max_x: u16) {
    if fingers + styli > MAX_SLOTS as u16 {
      warn!("{} fingers and {} styli truncated to {} slots", fingers, styli, MAX_SLOTS);
    }
    let fingers = fingers.min(MAX_SLOTS as u16);
    self.fingers = fingers as u8;
    self.styli = styli.min(MAX_SLOTS as u16 - fingers) as u8;
    self.max_x = max_x;
    self.slots = [Slot::default(); MAX_SLOTS];
    self.touch_count = 0;
    self.clear_lock();
  }

  pub(crate) fn fingers(&self) -> u8 {
    self.fingers
  }

  pub(crate) fn styli(&self) -> u8 {
    self.styli
  }

  pub(crate) fn touch_count(&self) -> u8 {
    self.touch_count
  }

  pub(crate) fn unlocked(&self) -> bool {
    self.unlocked
  }

  /// Forget the latch and lock the panel again.
  pub(crate) fn clear_lock(&mut self) {
    self.latch = None;
    self.unlocked = false;
  }

  fn threshold(&self, slot: &Slot, now: u32) -> u16 {
    let f = &self.filter;
    if slot.moving {
      f.moving
    } else if now.wrapping_sub(slot.landed_at) < f.landing_ms {
      if slot.x <= f.edge_clip || slot.x >= self.max_x.saturating_sub(f.edge_clip) {
        f.landing_edge
      } else {
        f.landing
      }
    } else {
      f.staying
    }
  }

  fn lift<S: InputSink + ?Sized>(&mut self, index: usize, sink: &mut S) {
    if let Some(tool) = self.slots[index].tool.take() {
      self.slots[index].moving = false;
      sink.emit(InputEvent::Lift { slot: index as u8, tool });
    }
  }

  /// Apply one finger record.
  pub(crate) fn finger<S: InputSink + ?Sized>(&mut self, now: u32, r: &Report, sink: &mut S) -> Outcome {
    if r.index >= self.fingers {
      warn!("finger {} outside {} slots", r.index, self.fingers);
      return Outcome::Ignored;
    }
    let index = r.index as usize;

    if r.release || !r.detect {
      let was_active = self.slots[index].tool.is_some();
      self.lift(index, sink);
      if !r.detect {
        return if was_active && self.release_latch(r.x, r.y) { Outcome::Unlocked } else { Outcome::Reported };
      }
    }

    let (x, y) = match self.slots[index].tool {
      None => {
        self.slots[index] = Slot { tool: Some(Tool::Finger), moving: false, x: r.x, y: r.y, landed_at: now };
        (r.x, r.y)
      }
      Some(_) => {
        let slot = self.slots[index];
        let t = self.threshold(&slot, now) as u64;
        if distance_sq(r.x, r.y, slot.x, slot.y) < t * t {
          trace!("slot {} frozen at ({}, {})", index, slot.x, slot.y);
          (slot.x, slot.y)
        } else {
          let s = &mut self.slots[index];
          s.moving = true;
          s.x = r.x;
          s.y = r.y;
          (r.x, r.y)
        }
      }
    };

    if self.touch_count == 1 && self.latch.is_none() && !self.unlocked {
      self.latch = Some((x, y));
    }

    sink.emit(InputEvent::Contact(Contact {
      pressure: r.pressure,
      area: r.area,
      orientation: r.orientation,
      peak: r.peak,
      ..Contact::new(r.index, Tool::Finger, x, y)
    }));
    Outcome::Reported
  }

  /// A finger lifted; returns true when the panel unlocks.
  fn release_latch(&mut self, x: u16, y: u16) -> bool {
    if self.touch_count != 0 || self.unlocked {
      return false;
    }
    let Some((lx, ly)) = self.latch.take() else {
      return false;
    };
    let travel = self.filter.unlock_move as u64;
    if distance_sq(x, y, lx, ly) >= travel * travel {
      info!("unlocked after travel from ({}, {})", lx, ly);
      self.unlocked = true;
      true
    } else {
      false
    }
  }

  /// Apply one active stylus record. Pens skip the jitter filter.
  pub(crate) fn stylus<S: InputSink + ?Sized>(&mut self, r: &Report, tool: Tool, sink: &mut S) {
    if r.index >= self.styli {
      warn!("stylus {} outside {} slots", r.index, self.styli);
      return;
    }
    let index = (self.fingers + r.index) as usize;
    if !r.detect {
      self.lift(index, sink);
      return;
    }
    let slot = &mut self.slots[index];
    slot.tool = Some(tool);
    slot.x = r.x;
    slot.y = r.y;
    sink.emit(InputEvent::Contact(Contact { pressure: r.pressure, ..Contact::new(index as u8, tool, r.x, r.y) }));
  }

  /// Screen-wide status: touch count and the suppression flag.
  pub(crate) fn screen_status<S: InputSink + ?Sized>(&mut self, count: u8, suppressed: bool, sink: &mut S) {
    self.touch_count = count;
    if suppressed {
      debug!("touch suppressed, releasing fingers");
      for i in 0..self.fingers as usize {
        self.lift(i, sink);
      }
    }
    if count > 1 && !self.unlocked {
      self.latch = None;
    }
  }

  pub(crate) fn release_all<S: InputSink + ?Sized>(&mut self, sink: &mut S) {
    for i in 0..(self.fingers + self.styli) as usize {
      self.lift(i, sink);
    }
  }
}
