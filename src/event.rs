/// What is touching the panel in a given slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tool {
  Finger,
  /// Active stylus with its button states.
  Pen { eraser: bool, barrel: bool },
}

/// One active contact, in controller coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Contact {
  pub slot: u8,
  pub tool: Tool,
  pub x: u16,
  pub y: u16,
  /// Amplitude for fingers, tip pressure for pens.
  pub pressure: Option<u8>,
  pub area: Option<u8>,
  pub orientation: Option<u8>,
  pub peak: Option<u8>,
}

impl Contact {
  pub const fn new(slot: u8, tool: Tool, x: u16, y: u16) -> Self {
    Self { slot, tool, x, y, pressure: None, area: None, orientation: None, peak: None }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputEvent {
  Contact(Contact),
  Lift { slot: u8, tool: Tool },
  Key { code: u16, pressed: bool },
  /// End of one coherent frame of slot and key updates.
  Sync,
}

/// Destination for decoded input.
pub trait InputSink {
  fn emit(&mut self, event: InputEvent);
}

impl<const N: usize> InputSink for heapless::Vec<InputEvent, N> {
  fn emit(&mut self, event: InputEvent) {
    if self.push(event).is_err() {
      warn!("input queue full, event dropped");
    }
  }
}

/// Discards everything.
impl InputSink for () {
  fn emit(&mut self, _: InputEvent) {}
}

/// Wraps a sink for one message batch and remembers whether anything was
/// emitted, so the batch can be closed with a single sync.
pub(crate) struct Frame<'s, S: ?Sized> {
  sink: &'s mut S,
  dirty: bool,
}

impl<'s, S: InputSink + ?Sized> Frame<'s, S> {
  pub(crate) fn new(sink: &'s mut S) -> Self {
    Self { sink, dirty: false }
  }

  pub(crate) fn close(self) {
    if self.dirty {
      self.sink.emit(InputEvent::Sync);
    }
  }
}

impl<S: InputSink + ?Sized> InputSink for Frame<'_, S> {
  fn emit(&mut self, event: InputEvent) {
    self.dirty = true;
    self.sink.emit(event);
  }
}
