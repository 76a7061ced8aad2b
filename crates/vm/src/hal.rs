//! 虚拟内存子系统依赖的外部组件
//!
//! 物理页分配器、页表、文件、块设备和文件描述符表都由内核的其他部分实现，
//! 这里只约定它们需要提供的操作

use alloc::sync::Arc;
use core::ptr::NonNull;

use defines::{
    config::{PAGE_SIZE, SECTOR_SIZE},
    error::KResult,
};

use crate::address::{PhysPageNum, VirtPageNum};

/// 用户物理页的分配器
///
/// 实现需要自行保证内部同步，帧表在持有自己的锁时调用它
pub trait PhysFrameAllocator: Send + Sync {
    fn alloc(&self) -> Option<PhysPageNum>;

    /// # Safety
    ///
    /// `ppn` 必须由本分配器分配，且此后不再被任何映射使用
    unsafe fn dealloc(&self, ppn: PhysPageNum);

    /// 物理页在内核地址空间中的位置
    fn frame_ptr(&self, ppn: PhysPageNum) -> NonNull<[u8; PAGE_SIZE]>;
}

/// 单个进程的硬件页表
pub trait PageTable: Send {
    /// 建立 `vpn` 到 `ppn` 的映射。页表节点分配失败时返回错误
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> KResult<()>;
    fn unmap(&mut self, vpn: VirtPageNum);
    fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum>;
    fn is_accessed(&self, vpn: VirtPageNum) -> bool;
    fn set_accessed(&mut self, vpn: VirtPageNum, accessed: bool);
    fn is_dirty(&self, vpn: VirtPageNum) -> bool;
    fn set_dirty(&mut self, vpn: VirtPageNum, dirty: bool);
}

/// 可被映射或惰性加载的文件
pub trait File: Send + Sync {
    /// 独立地重新打开同一个文件，其生命周期与原句柄无关。句柄 drop 即关闭
    fn reopen(&self) -> KResult<Arc<dyn File>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize>;
    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize>;
}

/// 块设备的抽象，读写都以扇区为单位进行
pub trait BlockDevice: Send {
    fn block_count(&self) -> usize;
    fn read_block(&mut self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()>;
    fn write_block(&mut self, block_id: usize, buf: &[u8; SECTOR_SIZE]) -> KResult<()>;
}

/// 进程的文件描述符表
pub trait FdTable {
    fn get(&self, fd: i32) -> Option<Arc<dyn File>>;
}
