use embassy_sync::blocking_mutex::raw::RawMutex;

use super::Calibration;
use crate::message::{GoldenPhase, GoldenStatus, SelfCapStatus};

/// Calibration sequences that need exclusive use of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionKind {
  AntiCalib,
  SelfRecalib,
  GoldenGenerate,
  GoldenCurrentTune,
  SelfCapTune,
}

impl SessionKind {
  pub(crate) const fn is_golden(self) -> bool {
    matches!(self, Self::GoldenGenerate | Self::GoldenCurrentTune)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Session {
  pub(crate) kind: SessionKind,
  pub(crate) phase: GoldenPhase,
  /// Status polls left before the current wait times out.
  pub(crate) polls_remaining: u16,
  pub(crate) retries_remaining: u8,
}

/// Exclusive hold on the session slot, released on drop.
pub(crate) struct SessionGuard<'c, M: RawMutex> {
  calibration: &'c Calibration<M>,
}

impl<M: RawMutex> Calibration<M> {
  /// Open a session, or `None` while another one is active.
  pub(crate) fn begin(&self, kind: SessionKind, retries: u8) -> Option<SessionGuard<'_, M>> {
    let opened = self.lock(|s| {
      if s.session.is_some() {
        return false;
      }
      s.session = Some(Session { kind, phase: GoldenPhase::Invalid, polls_remaining: 0, retries_remaining: retries });
      if kind.is_golden() {
        s.golden.clear();
      } else {
        s.selfcap = None;
      }
      true
    });
    if opened {
      debug!("{:?} session open", kind);
      Some(SessionGuard { calibration: self })
    } else {
      warn!("{:?} refused, session busy", kind);
      None
    }
  }

  pub(crate) fn session(&self) -> Option<Session> {
    self.lock(|s| s.session)
  }
}

impl<M: RawMutex> SessionGuard<'_, M> {
  fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
    self.calibration.lock(|s| s.session.as_mut().map(f))
  }

  /// Restart the wait deadline.
  pub(crate) fn arm(&self, polls: u16) {
    self.with(|s| s.polls_remaining = polls);
  }

  /// Spend one poll; false once the deadline has passed.
  pub(crate) fn tick(&self) -> bool {
    self
      .with(|s| {
        s.polls_remaining = s.polls_remaining.saturating_sub(1);
        s.polls_remaining > 0
      })
      .unwrap_or(false)
  }

  /// Spend one recovery; false when none are left.
  pub(crate) fn retry(&self) -> bool {
    self
      .with(|s| match s.retries_remaining.checked_sub(1) {
        Some(left) => {
          s.retries_remaining = left;
          true
        }
        None => false,
      })
      .unwrap_or(false)
  }

  /// Consume the oldest golden status and record its phase.
  pub(crate) fn take_golden(&self) -> Option<GoldenStatus> {
    self.calibration.lock(|s| {
      let status = GoldenStatus::from_bits(s.golden.pop_front()?);
      if let Some(session) = s.session.as_mut() {
        session.phase = status.phase();
      }
      Some(status)
    })
  }

  pub(crate) fn clear_golden(&self) {
    self.calibration.lock(|s| s.golden.clear());
  }

  pub(crate) fn take_selfcap(&self) -> Option<SelfCapStatus> {
    self.calibration.lock(|s| s.selfcap.take())
  }
}

impl<M: RawMutex> Drop for SessionGuard<'_, M> {
  fn drop(&mut self) {
    self.calibration.lock(|s| s.session = None);
  }
}
