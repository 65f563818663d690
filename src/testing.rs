//! In-crate fake controller for unit tests.
//!
//! [`Device`] is a flat 64 KiB register map that understands just enough of
//! the object protocol to drive the driver: command registers that settle
//! back to zero, a message queue behind T44/T5, paged T37 diagnostics, the
//! T19 force report and a bootloader address that can be left.

use std::boxed::Box;
use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::calibration::{Calibration, Context, MUTUAL_DATA_LEN};
use crate::config::{DeviceConfig, Linearity, Platform, TouchFilter};
use crate::control::SavedSettings;
use crate::defs::{DEFAULT_ADDRESS, NO_MESSAGE};
use crate::object::{InfoBlock, ObjectDirectory};
use crate::reg::{t19, t37, t6, ObjectType};
use crate::Maxtouch;

pub(crate) const INFO: InfoBlock =
  InfoBlock { family_id: 0xA6, variant_id: 0x12, version: 0x10, build: 0xAA, matrix_x: 30, matrix_y: 18, object_count: 0 };

pub(crate) static VARIANTS: [DeviceConfig<'static>; 2] = [
  DeviceConfig::new(0xA6, 0x12, 0x10, 0xAA)
    .with_keys(&[158, 102, 139])
    .with_self_thresholds(40, 35, 25)
    .with_mutual_thresholds(30, 45)
    .with_sensitive_thresholds(20, 28, 12)
    .with_t71_touch_threshold_pos(5)
    .with_no_touch_thresholds(60, 200)
    .with_charge_time(10, 60),
  DeviceConfig::new(0xA6, 0x12, 0x10, 0xAA)
    .with_vendor(0x02, 1)
    .with_mutual_thresholds(31, 46)
    .with_no_touch_thresholds(60, 200),
];

pub(crate) fn platform() -> Platform<'static> {
  Platform::new(&VARIANTS)
    .with_filter(TouchFilter::new().with_landing(5, 8, 200, 20).with_staying(3).with_moving(2).with_unlock_move(100))
    .with_matrix(18, 30, 100)
    .with_linearity(Linearity::new(&[40, 41], &[3, 4], &[9, 10]))
}

pub(crate) fn saved() -> SavedSettings {
  SavedSettings {
    self_threshold: 22,
    self_internal_threshold: 11,
    anti_touch_threshold: 6,
    self_recalib: 0x21,
    anti_calib: [0x05, 0x0A, 0x30, 0x14],
  }
}

/// Publish a context for `dir` as initialize would.
pub(crate) fn publish(cal: &Calibration<NoopRawMutex>, dir: &ObjectDirectory) {
  let ctx = Context { directory: dir.clone(), variant: 0, saved: saved() };
  cal.publish(ctx, platform().reference_threshold);
}

/// A calibration block that outlives the device closures holding it.
pub(crate) fn leak_calibration() -> &'static Calibration<NoopRawMutex> {
  Box::leak(Box::new(Calibration::new()))
}

pub(crate) fn driver(fake: &FakeBus, cal: &'static Calibration<NoopRawMutex>) -> Maxtouch<'static, NoopRawMutex, FakeBus, Clock> {
  Maxtouch::new(fake.clone(), Clock::default(), platform(), cal)
}

/// Let other futures in a `join` run `n` times.
pub(crate) async fn yield_for(n: usize) {
  for _ in 0..n {
    embassy_futures::yield_now().await;
  }
}

pub(crate) type OnWrite = Box<dyn FnMut(&mut Device, u16, &[u8])>;

struct Diagnostic {
  t6: u16,
  t37: u16,
  data: Vec<u8>,
  page: usize,
}

pub(crate) struct Device {
  pub(crate) mem: Vec<u8>,
  /// Every register write as `(address, data)`.
  pub(crate) writes: Vec<(u16, Vec<u8>)>,
  /// Fail every transfer.
  pub(crate) fail: bool,
  /// Fail this many transfers, then recover.
  pub(crate) fail_next: usize,
  /// Registers that read back as the given value right after a write.
  pub(crate) settle: Vec<(u16, u8)>,
  pub(crate) on_write: Option<OnWrite>,
  pub(crate) messages: VecDeque<Vec<u8>>,
  pub(crate) config_crc: u32,
  /// Raw T19 input state answered to a forced report.
  pub(crate) gpio: Option<u8>,
  /// Address answering in bootloader mode.
  pub(crate) bootloader: Option<u8>,
  /// Leave-bootloader commands that are ignored before one is honoured.
  pub(crate) bootloader_stubborn: usize,
  address: u8,
  message_size: usize,
  t44: Option<u16>,
  t5: u16,
  t6: u16,
  t6_report_id: u8,
  t19: Option<(u16, u8)>,
  diag: Option<Diagnostic>,
}

impl Device {
  pub(crate) fn read_mem(&self, addr: u16, len: usize) -> Vec<u8> {
    self.mem[addr as usize..addr as usize + len].to_vec()
  }

  /// Queue one message record, zero padded to the record size.
  pub(crate) fn push_message(&mut self, bytes: &[u8]) {
    let mut record = vec![0u8; self.message_size];
    record[..bytes.len()].copy_from_slice(bytes);
    self.messages.push_back(record);
  }

  /// Serve `f(i)` as sample `i` of every diagnostic mode.
  pub(crate) fn fill_diagnostic(&mut self, dir: &ObjectDirectory, f: impl Fn(usize) -> i16) {
    let t6 = dir.lookup(ObjectType::Command).map(|o| o.start_address).unwrap_or(0);
    let t37 = dir.lookup(ObjectType::Diagnostic).map(|o| o.start_address).unwrap_or(0);
    let data = (0..MUTUAL_DATA_LEN / 2).flat_map(|i| f(i).to_le_bytes()).collect();
    self.diag = Some(Diagnostic { t6, t37, data, page: 0 });
  }

  fn pop_records(&mut self, buf: &mut [u8]) {
    for chunk in buf.chunks_mut(self.message_size) {
      match self.messages.pop_front() {
        Some(record) => chunk.copy_from_slice(&record[..chunk.len()]),
        None => chunk.fill(NO_MESSAGE),
      }
    }
  }

  fn read(&mut self, reg: u16, buf: &mut [u8]) {
    if Some(reg) == self.t44 {
      buf[0] = self.messages.len().min(u8::MAX as usize) as u8;
      self.pop_records(&mut buf[1..]);
    } else if reg == self.t5 {
      self.pop_records(buf);
    } else {
      for (i, b) in buf.iter_mut().enumerate() {
        *b = self.mem.get(reg as usize + i).copied().unwrap_or(0);
      }
    }
  }

  fn write(&mut self, reg: u16, data: &[u8]) {
    self.writes.push((reg, data.to_vec()));
    let start = reg as usize;
    self.mem[start..start + data.len()].copy_from_slice(data);
    let covers = |addr: u16| (reg..reg + data.len() as u16).contains(&addr);

    if let Some(diag) = self.diag.as_mut() {
      if covers(diag.t6 + 5) && diag.t37 != 0 {
        let mode = self.mem[diag.t6 as usize + 5];
        diag.page = if mode == t6::DIAG_PAGE_UP { diag.page + 1 } else { 0 };
        let at = diag.page * t37::PAGE_SIZE;
        let page = &mut self.mem[diag.t37 as usize + 2..diag.t37 as usize + 2 + t37::PAGE_SIZE];
        page.fill(0);
        if at < diag.data.len() {
          let end = (at + t37::PAGE_SIZE).min(diag.data.len());
          page[..end - at].copy_from_slice(&diag.data[at..end]);
        }
      }
    }
    if covers(self.t6 + 3) && data.len() == 1 {
      let crc = self.config_crc.to_le_bytes();
      let id = self.t6_report_id;
      self.push_message(&[id, 0, crc[0], crc[1], crc[2]]);
    }
    if let Some((gpio, id)) = self.t19 {
      if covers(gpio) && data.len() == 1 && data[0] == t19::FORCE_REPORT {
        if let Some(state) = self.gpio {
          self.mem[gpio as usize] = t19::FORCE_REPORT_DONE;
          self.push_message(&[id, state]);
        }
      }
    }
    for &(addr, value) in self.settle.iter() {
      if covers(addr) {
        self.mem[addr as usize] = value;
      }
    }
    if let Some(mut f) = self.on_write.take() {
      f(self, reg, data);
      if self.on_write.is_none() {
        self.on_write = Some(f);
      }
    }
  }

  fn check(&mut self) -> Result<(), ErrorKind> {
    if self.fail {
      return Err(ErrorKind::Other);
    }
    if self.fail_next > 0 {
      self.fail_next -= 1;
      return Err(ErrorKind::Other);
    }
    Ok(())
  }

  fn bootloader_transaction(&mut self, operations: &mut [Operation<'_>]) -> Result<(), ErrorKind> {
    for op in operations.iter_mut() {
      match op {
        Operation::Read(buf) => buf.fill(0x80),
        Operation::Write(data) => {
          if *data == [0x01, 0x01] {
            if self.bootloader_stubborn > 0 {
              self.bootloader_stubborn -= 1;
            } else {
              self.bootloader = None;
            }
          }
        }
      }
    }
    Ok(())
  }

  fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), ErrorKind> {
    self.check()?;
    if let Some(bl) = self.bootloader {
      if address == bl {
        return self.bootloader_transaction(operations);
      }
      return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
    }
    if address != self.address {
      return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
    }

    let mut pending: Vec<u8> = Vec::new();
    for op in operations.iter_mut() {
      match op {
        Operation::Write(data) => pending.extend_from_slice(data),
        Operation::Read(buf) => {
          let reg = u16::from_le_bytes([pending[0], pending[1]]);
          pending.clear();
          self.read(reg, buf);
        }
      }
    }
    if pending.len() > 2 {
      let reg = u16::from_le_bytes([pending[0], pending[1]]);
      self.write(reg, &pending[2..]);
    }
    Ok(())
  }
}

#[derive(Clone)]
pub(crate) struct FakeBus(Rc<RefCell<Device>>);

impl FakeBus {
  pub(crate) fn device(&self) -> RefMut<'_, Device> {
    self.0.borrow_mut()
  }

  pub(crate) fn address(&self) -> u8 {
    self.0.borrow().address
  }
}

impl ErrorType for FakeBus {
  type Error = ErrorKind;
}

impl I2c<SevenBitAddress> for FakeBus {
  async fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
    self.0.borrow_mut().transaction(address, operations)
  }
}

/// Simulated time. Each millisecond of delay yields once so that joined
/// futures interleave.
#[derive(Clone, Default)]
pub(crate) struct Clock(Rc<RefCell<u64>>);

impl Clock {
  pub(crate) fn elapsed_ms(&self) -> u64 {
    *self.0.borrow()
  }
}

impl DelayNs for Clock {
  async fn delay_ns(&mut self, ns: u32) {
    *self.0.borrow_mut() += (ns / 1_000_000) as u64;
    embassy_futures::yield_now().await;
  }

  async fn delay_ms(&mut self, ms: u32) {
    for _ in 0..ms {
      *self.0.borrow_mut() += 1;
      embassy_futures::yield_now().await;
    }
  }
}

struct Entry {
  kind: u8,
  size: u16,
  instances: u8,
  ids: u8,
}

/// Builder for a fake controller's object table.
pub(crate) struct Layout {
  info: InfoBlock,
  entries: Vec<Entry>,
  info_crc: u32,
  config_crc: u32,
}

impl Layout {
  /// Message count, message, command and power objects.
  pub(crate) fn new() -> Self {
    Self::empty().object(44, 1, 1, 0).object(5, 10, 1, 0).object(6, 6, 1, 1).object(7, 4, 1, 0)
  }

  /// No objects at all.
  pub(crate) fn empty() -> Self {
    Self { info: INFO, entries: Vec::new(), info_crc: 0, config_crc: 0 }
  }

  /// Message, command and power objects without a message count.
  pub(crate) fn polled() -> Self {
    Self::empty().object(5, 10, 1, 0).object(6, 6, 1, 1).object(7, 4, 1, 0)
  }

  pub(crate) fn object(mut self, kind: u8, size: u16, instances: u8, ids: u8) -> Self {
    self.entries.push(Entry { kind, size, instances, ids });
    self
  }

  pub(crate) fn info(mut self, info: InfoBlock) -> Self {
    self.info = info;
    self
  }

  pub(crate) fn info_crc(mut self, crc: u32) -> Self {
    self.info_crc = crc;
    self
  }

  pub(crate) fn config_crc(mut self, crc: u32) -> Self {
    self.config_crc = crc;
    self
  }

  pub(crate) fn build(self) -> (FakeBus, ObjectDirectory) {
    let info = InfoBlock { object_count: self.entries.len() as u8, ..self.info };
    let mut mem = vec![0u8; 0x1_0000];
    mem[..7].copy_from_slice(&info.to_bytes());

    let table_end = 7 + 6 * self.entries.len();
    mem[table_end..table_end + 3].copy_from_slice(&self.info_crc.to_le_bytes()[..3]);

    let mut table = Vec::new();
    let mut addr = (table_end + 3) as u16;
    for e in &self.entries {
      let a = addr.to_le_bytes();
      table.extend_from_slice(&[e.kind, a[0], a[1], (e.size - 1) as u8, e.instances - 1, e.ids]);
      addr += e.size * e.instances as u16;
    }
    mem[7..table_end].copy_from_slice(&table);

    let dir = match ObjectDirectory::build(info, &table) {
      Ok(dir) => dir,
      Err(e) => panic!("bad test layout: {:?}", e),
    };
    let start = |kind: ObjectType| dir.lookup(kind).map(|o| o.start_address);

    let t6 = start(ObjectType::Command).unwrap_or(0);
    let mut settle = Vec::new();
    if dir.contains(ObjectType::Command) {
      for offset in 0..6 {
        settle.push((t6 + offset, 0));
      }
    }
    if let Some(t7) = start(ObjectType::Power) {
      mem[t7 as usize..t7 as usize + 3].copy_from_slice(&[32, 16, 50]);
    }
    if let Some(t25) = start(ObjectType::SelfTest) {
      settle.push((t25 + 1, 0));
    }

    let device = Device {
      mem,
      writes: Vec::new(),
      fail: false,
      fail_next: 0,
      settle,
      on_write: None,
      messages: VecDeque::new(),
      config_crc: self.config_crc,
      gpio: None,
      bootloader: None,
      bootloader_stubborn: 0,
      address: DEFAULT_ADDRESS,
      message_size: dir.message_size(),
      t44: start(ObjectType::MessageCount),
      t5: start(ObjectType::Message).unwrap_or(0),
      t6,
      t6_report_id: dir.lookup(ObjectType::Command).map(|o| o.min_report_id).unwrap_or(0),
      t19: dir.lookup(ObjectType::Gpio).map(|o| (o.start_address, o.min_report_id)),
      diag: None,
    };
    (FakeBus(Rc::new(RefCell::new(device))), dir)
  }
}
