mod block_device;
pub mod ramdisk;

pub use block_device::{BlockDriver, DeviceId, DeviceTable};
pub use ramdisk::RamDisk;
