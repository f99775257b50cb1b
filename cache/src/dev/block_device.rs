/// Block-driver contract — abstracts the device layer for the caches.
///
/// Real drivers and the RAM-backed test device implement this trait. The
/// caches never talk to a driver directly; they go through a `DeviceTable`
/// populated at boot, keyed by (major, minor).
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::errno::Errno;

/// A (major, minor) device number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct DeviceId(u16);

impl DeviceId {
    /// The all-zero id; marks "no device" on anonymous cache entries.
    pub const NONE: DeviceId = DeviceId(0);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | minor as u16)
    }

    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn minor(self) -> u8 {
        self.0 as u8
    }

    /// Raw device number, used by the buffer hash.
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Abstract block device.
///
/// `buf.len()` carries the block size; a device may serve several sizes
/// (one per mounted filesystem). Both callbacks return the byte count
/// actually transferred.
pub trait BlockDriver: Send + Sync {
    /// Read block `block` of `dev` into `buf`.
    fn read_block(&self, dev: DeviceId, block: u32, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Write block `block` of `dev` from `buf`.
    fn write_block(&self, dev: DeviceId, block: u32, buf: &[u8]) -> Result<usize, Errno>;
}

/// Driver registry.
///
/// A handful of entries at most, so a linear scan beats a real map.
pub struct DeviceTable {
    drivers: Mutex<Vec<(DeviceId, Arc<dyn BlockDriver>)>>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self {
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Register `driver` for `dev`, replacing any previous registration.
    pub fn register(&self, dev: DeviceId, driver: Arc<dyn BlockDriver>) {
        let mut drivers = self.drivers.lock();
        if let Some(slot) = drivers.iter_mut().find(|(d, _)| *d == dev) {
            slot.1 = driver;
        } else {
            drivers.push((dev, driver));
        }
    }

    /// Drop the registration for `dev`. The caller is expected to
    /// `invalidate_buffers` the device first.
    pub fn unregister(&self, dev: DeviceId) {
        self.drivers.lock().retain(|(d, _)| *d != dev);
    }

    /// Look up the driver for `dev`.
    pub fn get(&self, dev: DeviceId) -> Option<Arc<dyn BlockDriver>> {
        self.drivers
            .lock()
            .iter()
            .find(|(d, _)| *d == dev)
            .map(|(_, driver)| driver.clone())
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}
