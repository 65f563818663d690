use heapless::Vec;

/// Background jobs run by the calibration worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Task {
  /// Periodic interference monitor feeding the ratchet.
  UpdateSetting,
  /// Turn anti-touch calibration off once the panel has settled.
  DisableAntiCalib,
  /// First-use tuning after initialize.
  PreUse,
}

impl Task {
  const fn slot(self) -> usize {
    match self {
      Self::UpdateSetting => 0,
      Self::DisableAntiCalib => 1,
      Self::PreUse => 2,
    }
  }
}

const TASKS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
  pub(crate) task: Task,
  pub(crate) delay_ms: u32,
  generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Running {
  task: Task,
  generation: u32,
  /// Past the initial delay and doing work.
  started: bool,
}

/// Pending delayed tasks, at most one of each kind, plus the task the worker
/// currently holds.
///
/// Cancelling a kind bumps its generation. The worker compares the
/// generation it started with at every wake and abandons a stale task.
pub(crate) struct WorkQueue {
  pending: Vec<Entry, TASKS>,
  running: Option<Running>,
  generations: [u32; TASKS],
}

impl WorkQueue {
  pub(crate) const fn new() -> Self {
    Self { pending: Vec::new(), running: None, generations: [0; TASKS] }
  }

  /// Queue `task` after `delay_ms`. A kind already waiting is left alone.
  pub(crate) fn schedule(&mut self, task: Task, delay_ms: u32) -> bool {
    let waiting = self.pending.iter().any(|e| e.task == task)
      || matches!(self.running, Some(r) if r.task == task && !r.started);
    if waiting {
      return false;
    }
    let entry = Entry { task, delay_ms, generation: self.generations[task.slot()] };
    // One entry per kind, so the vector never overflows.
    self.pending.push(entry).is_ok()
  }

  /// Take the entry due first. Its delay is charged to the others.
  pub(crate) fn next(&mut self) -> Option<Entry> {
    let (index, _) = self.pending.iter().enumerate().min_by_key(|(_, e)| e.delay_ms)?;
    let entry = self.pending.swap_remove(index);
    for e in self.pending.iter_mut() {
      e.delay_ms = e.delay_ms.saturating_sub(entry.delay_ms);
    }
    self.running = Some(Running { task: entry.task, generation: entry.generation, started: false });
    Some(entry)
  }

  pub(crate) fn start(&mut self) {
    if let Some(r) = self.running.as_mut() {
      r.started = true;
    }
  }

  pub(crate) fn finish(&mut self) {
    self.running = None;
  }

  /// Drop pending entries of these kinds and invalidate a running one.
  /// Returns true when the running task was hit.
  pub(crate) fn cancel(&mut self, tasks: &[Task]) -> bool {
    for t in tasks {
      self.generations[t.slot()] = self.generations[t.slot()].wrapping_add(1);
    }
    self.pending.retain(|e| !tasks.contains(&e.task));
    matches!(self.running, Some(r) if tasks.contains(&r.task))
  }

  pub(crate) fn clear(&mut self) {
    self.pending.clear();
  }

  pub(crate) fn is_cancelled(&self) -> bool {
    matches!(self.running, Some(r) if r.generation != self.generations[r.task.slot()])
  }

  pub(crate) fn running(&self) -> Option<Task> {
    self.running.map(|r| r.task)
  }

  pub(crate) fn is_pending(&self, task: Task) -> bool {
    self.pending.iter().any(|e| e.task == task)
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}
