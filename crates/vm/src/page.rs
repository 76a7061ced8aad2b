//! 补充页表
//!
//! 每个进程一张，记录每个用户虚拟页应当如何被（重新）具现：它的来源、当前是否驻留在
//! 物理帧中、或者被换出到了哪个交换槽位。它是缺页处理判断一个地址是否合法的唯一依据

use alloc::sync::Arc;
use core::fmt;

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use hashbrown::HashMap;

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    frame::FrameTableGuard,
    hal::{File, PageTable},
    swap::{SwapSlot, SwapStore},
};

/// 文件中的一页内容：从 `offset` 读取 `read_bytes` 字节，剩余 `zero_bytes` 字节填零
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn File>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileBacking {
    pub fn new(file: Arc<dyn File>, offset: usize, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    /// 把页中有效的部分写回文件
    pub fn write_back(&self, page: &[u8; PAGE_SIZE]) -> KResult<()> {
        let written = self.file.write_at(self.offset, &page[..self.read_bytes])?;
        if written != self.read_bytes {
            warn!(
                "short write back at offset {:#x}: {written}/{}",
                self.offset, self.read_bytes
            );
            return Err(errno::EIO);
        }
        Ok(())
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// 页的来源，决定它第一次被访问、或被换出后再次访问时的内容
#[derive(Debug, Clone)]
pub enum PageOrigin {
    /// 匿名的栈页，初始全零
    Stack,
    /// 可执行文件中惰性加载的段
    File(FileBacking),
    /// mmap 映射的文件，被修改时写回文件而不是交换区
    Mmap(FileBacking),
}

/// 页当前的存放位置。驻留与换出互斥
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    /// 尚未加载，或已经干净地从内存中移除
    NotLoaded,
    Resident(PhysPageNum),
    Swapped(SwapSlot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Stack,
    File,
    Mmap,
    Swapped,
}

#[derive(Debug)]
pub struct PageEntry {
    vpn: VirtPageNum,
    origin: PageOrigin,
    pub(crate) residence: Residence,
    writable: bool,
    /// 缺页处理正在填充该页，不允许换出
    pub(crate) pinned: bool,
    /// 内容已与来源不同（例如从交换区换入），再次换出时必须保存
    pub(crate) dirty: bool,
}

impl PageEntry {
    pub fn new_stack(vpn: VirtPageNum) -> Self {
        Self::new(vpn, PageOrigin::Stack, true)
    }

    pub fn new_file(vpn: VirtPageNum, backing: FileBacking, writable: bool) -> Self {
        Self::new(vpn, PageOrigin::File(backing), writable)
    }

    pub fn new_mmap(vpn: VirtPageNum, backing: FileBacking) -> Self {
        Self::new(vpn, PageOrigin::Mmap(backing), true)
    }

    fn new(vpn: VirtPageNum, origin: PageOrigin, writable: bool) -> Self {
        Self {
            vpn,
            origin,
            residence: Residence::NotLoaded,
            writable,
            pinned: false,
            dirty: false,
        }
    }

    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    pub fn origin(&self) -> &PageOrigin {
        &self.origin
    }

    pub fn kind(&self) -> PageKind {
        match (&self.residence, &self.origin) {
            (Residence::Swapped(_), _) => PageKind::Swapped,
            (_, PageOrigin::Stack) => PageKind::Stack,
            (_, PageOrigin::File(_)) => PageKind::File,
            (_, PageOrigin::Mmap(_)) => PageKind::Mmap,
        }
    }

    pub fn residence(&self) -> Residence {
        self.residence
    }

    pub fn frame(&self) -> Option<PhysPageNum> {
        match self.residence {
            Residence::Resident(ppn) => Some(ppn),
            _ => None,
        }
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.residence {
            Residence::Swapped(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn file_backing(&self) -> Option<&FileBacking> {
        match &self.origin {
            PageOrigin::Stack => None,
            PageOrigin::File(backing) | PageOrigin::Mmap(backing) => Some(backing),
        }
    }

    /// 释放该页占用的帧或交换槽位，使其回到未加载状态
    ///
    /// 不会写回任何内容，调用者需要先行处理
    pub(crate) fn release_backing(
        &mut self,
        frames: &mut FrameTableGuard<'_>,
        page_table: &mut dyn PageTable,
        swap: &SwapStore,
    ) {
        match self.residence {
            Residence::Resident(ppn) => {
                page_table.unmap(self.vpn);
                frames.release(ppn);
            }
            Residence::Swapped(slot) => swap.release(slot),
            Residence::NotLoaded => {}
        }
        self.residence = Residence::NotLoaded;
    }
}

/// 以虚拟页号为键的补充页表
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: HashMap<VirtPageNum, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 该页已有表项时返回 `EEXIST`
    pub fn insert(&mut self, entry: PageEntry) -> KResult<()> {
        match self.entries.entry(entry.vpn) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(errno::EEXIST),
            hashbrown::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// 查找 `va` 所在页的表项
    pub fn find(&self, va: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&va.vpn_floor())
    }

    pub fn get(&self, vpn: VirtPageNum) -> Option<&PageEntry> {
        self.entries.get(&vpn)
    }

    pub fn get_mut(&mut self, vpn: VirtPageNum) -> Option<&mut PageEntry> {
        self.entries.get_mut(&vpn)
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.entries.contains_key(&vpn)
    }

    /// 摘除表项。调用者需要先释放它占用的帧或交换槽位
    pub fn remove(&mut self, va: VirtAddr) -> Option<PageEntry> {
        self.entries.remove(&va.vpn_floor())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.values()
    }

    /// 进程退出时调用：释放所有页的帧和交换槽位，并清空页表
    pub(crate) fn destroy_all(
        &mut self,
        frames: &mut FrameTableGuard<'_>,
        page_table: &mut dyn PageTable,
        swap: &SwapStore,
    ) {
        for (_, mut entry) in self.entries.drain() {
            entry.release_backing(frames, page_table, swap);
        }
    }
}
