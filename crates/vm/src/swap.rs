//! 交换区
//!
//! 把交换设备视为一组页大小的槽位，槽位 `i` 占据扇区 `[i * k, i * k + k)`，
//! 其中 `k` 为 [`SECTORS_PER_PAGE`]。占用情况记录在位图中

use alloc::boxed::Box;

use defines::{
    config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE},
    error::{errno, KResult},
};
use idallocator::BitAllocator;
use klocks::SpinMutex;

use crate::hal::BlockDevice;

/// 交换区中的一个槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

pub struct SwapStore {
    inner: SpinMutex<SwapInner>,
}

struct SwapInner {
    device: Option<Box<dyn BlockDevice>>,
    slots: BitAllocator,
}

impl SwapStore {
    /// 没有交换设备时容量为 0，此后任何 `reserve` 都会失败
    pub fn new(device: Option<Box<dyn BlockDevice>>) -> Self {
        let capacity = device
            .as_ref()
            .map_or(0, |device| device.block_count() / SECTORS_PER_PAGE);
        match &device {
            Some(_) => info!("swap: {capacity} slots"),
            None => warn!("swap: no device, dirty anonymous pages cannot be evicted"),
        }
        Self {
            inner: SpinMutex::new(SwapInner {
                device,
                slots: BitAllocator::new(capacity),
            }),
        }
    }

    pub fn reserve(&self) -> KResult<SwapSlot> {
        let slot = self.inner.lock().slots.alloc().ok_or(errno::ENOMEM)?;
        trace!("swap: reserve slot {slot}");
        Ok(SwapSlot(slot))
    }

    /// 将一整页写入 `slot`
    pub fn write(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) -> KResult<()> {
        let mut inner = self.inner.lock();
        let device = inner.checked_device(slot)?;
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            buf.copy_from_slice(sector);
            device.write_block(slot.first_sector() + i, &buf)?;
        }
        Ok(())
    }

    /// 从 `slot` 读出一整页
    pub fn read(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        let mut inner = self.inner.lock();
        let device = inner.checked_device(slot)?;
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            device.read_block(slot.first_sector() + i, &mut buf)?;
            sector.copy_from_slice(&buf);
        }
        Ok(())
    }

    pub fn release(&self, slot: SwapSlot) {
        if !self.inner.lock().slots.dealloc(slot.0) {
            warn!("swap: release free slot {}", slot.0);
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().slots.in_use()
    }

    #[cfg(test)]
    pub(crate) fn is_reserved(&self, slot: SwapSlot) -> bool {
        self.inner.lock().slots.is_allocated(slot.0)
    }
}

impl SwapInner {
    /// 只有已分配的槽位才能读写
    fn checked_device(&mut self, slot: SwapSlot) -> KResult<&mut (dyn BlockDevice + 'static)> {
        if !self.slots.is_allocated(slot.0) {
            error!("swap: access to unreserved slot {}", slot.0);
            return Err(errno::EINVAL);
        }
        self.device.as_deref_mut().ok_or(errno::ENXIO)
    }
}
