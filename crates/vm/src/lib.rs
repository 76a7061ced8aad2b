//! 用户进程的虚拟内存管理：帧表、补充页表、交换区、按需调页与文件映射
//!
//! 加锁顺序：帧表 -> 进程的补充页表 -> 交换区

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

mod address;
mod fault;
mod frame;
pub mod hal;
mod mmap;
mod page;
mod space;
mod swap;
pub mod syscall;

#[cfg(test)]
mod mock;

use alloc::{boxed::Box, sync::Arc};

pub use self::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    frame::{FrameTable, FrameTableGuard},
    mmap::{FileMapping, MapId},
    page::{FileBacking, PageEntry, PageKind, PageOrigin, Residence, SupplementalPageTable},
    space::AddressSpace,
    swap::{SwapSlot, SwapStore},
};
use self::hal::{BlockDevice, PhysFrameAllocator};

/// 所有进程共享的虚拟内存资源，每个内核一个
pub struct Vm {
    frames: FrameTable,
    swap: Arc<SwapStore>,
}

impl Vm {
    pub fn new(
        allocator: Box<dyn PhysFrameAllocator>,
        swap_device: Option<Box<dyn BlockDevice>>,
    ) -> Arc<Self> {
        let swap = Arc::new(SwapStore::new(swap_device));
        Arc::new(Self {
            frames: FrameTable::new(allocator, Arc::clone(&swap)),
            swap,
        })
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn stats(&self) -> VmStats {
        let stats = VmStats {
            frames_in_use: self.frames.len(),
            evictions: self.frames.evictions(),
            swap_capacity: self.swap.capacity(),
            swap_in_use: self.swap.in_use(),
        };
        debug!("vm: {stats:?}");
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub frames_in_use: usize,
    pub evictions: usize,
    pub swap_capacity: usize,
    pub swap_in_use: usize,
}
