use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, Operation, SevenBitAddress};

use crate::object::ObjectDirectory;
use crate::reg::ObjectType;
use crate::Error;

/// One handle onto the controller's register space.
///
/// Registers are addressed with a 16-bit little-endian pointer written ahead
/// of every transfer. The dispatch and calibration sides each own a `Bus`
/// built over their own `I2c` handle; the bus implementation serializes them.
pub(crate) struct Bus<I, D> {
  i2c: I,
  pub(crate) delay: D,
  address: u8,
}

impl<I, E, D> Bus<I, D>
where
  I: I2c<SevenBitAddress, Error = E>,
  D: DelayNs,
{
  pub(crate) fn new(i2c: I, delay: D, address: u8) -> Self {
    Self { i2c, delay, address }
  }

  pub(crate) async fn read(&mut self, reg: u16, buf: &mut [u8]) -> Result<(), Error<E>> {
    self.i2c.write_read(self.address, &reg.to_le_bytes(), buf).await.map_err(Error::I2c)
  }

  pub(crate) async fn write(&mut self, reg: u16, data: &[u8]) -> Result<(), Error<E>> {
    let pointer = reg.to_le_bytes();
    let mut ops = [Operation::Write(&pointer), Operation::Write(data)];
    self.i2c.transaction(self.address, &mut ops).await.map_err(Error::I2c)
  }

  /// Write `data` starting at `reg`, split into transfers of at most 256 bytes.
  pub(crate) async fn read_u8(&mut self, reg: u16) -> Result<u8, Error<E>> {
    let mut b = [0u8; 1];
    self.read(reg, &mut b).await?;
    Ok(b[0])
  }

  pub(crate) async fn write_u8(&mut self, reg: u16, value: u8) -> Result<(), Error<E>> {
    self.write(reg, &[value]).await
  }

  fn locate(dir: &ObjectDirectory, kind: ObjectType, offset: u8) -> Result<u16, Error<E>> {
    dir.lookup(kind).map(|o| o.address(0, offset as u16)).ok_or(Error::MissingObject(kind))
  }

  /// Read one register of the first instance of `kind`.
  pub(crate) async fn read_object(&mut self, dir: &ObjectDirectory, kind: ObjectType, offset: u8) -> Result<u8, Error<E>> {
    let reg = Self::locate(dir, kind, offset)?;
    self.read_u8(reg).await
  }

  pub(crate) async fn read_object_bytes(
    &mut self,
    dir: &ObjectDirectory,
    kind: ObjectType,
    offset: u8,
    buf: &mut [u8],
  ) -> Result<(), Error<E>> {
    let reg = Self::locate(dir, kind, offset)?;
    self.read(reg, buf).await
  }

  pub(crate) async fn write_object(
    &mut self,
    dir: &ObjectDirectory,
    kind: ObjectType,
    offset: u8,
    value: u8,
  ) -> Result<(), Error<E>> {
    let reg = Self::locate(dir, kind, offset)?;
    trace!("T{}[{}] <- 0x{:02x}", kind.number(), offset, value);
    self.write_u8(reg, value).await
  }

  pub(crate) async fn write_object_bytes(
    &mut self,
    dir: &ObjectDirectory,
    kind: ObjectType,
    offset: u8,
    data: &[u8],
  ) -> Result<(), Error<E>> {
    let reg = Self::locate(dir, kind, offset)?;
    self.write(reg, data).await
  }

  /// Like [`Self::write_object`], but a missing object is not an error.
  pub(crate) async fn write_optional(
    &mut self,
    dir: &ObjectDirectory,
    kind: ObjectType,
    offset: u8,
    value: u8,
  ) -> Result<(), Error<E>> {
    if dir.contains(kind) {
      self.write_object(dir, kind, offset, value).await
    } else {
      debug!("T{} absent, skipping write", kind.number());
      Ok(())
    }
  }

  // Bootloader mode answers on a different address and has no register pointer.
  pub(crate) async fn bootloader_read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Error<E>> {
    self.i2c.read(address, buf).await.map_err(Error::I2c)
  }

  pub(crate) async fn bootloader_write(&mut self, address: u8, data: &[u8]) -> Result<(), Error<E>> {
    self.i2c.write(address, data).await.map_err(Error::I2c)
  }

  pub(crate) async fn sleep(&mut self, ms: u32) {
    self.delay.delay_ms(ms).await
  }
}
