//! 在宿主机上运行测试用的模拟硬件与文件系统

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;
use defines::{
    config::{PAGE_SIZE, SECTOR_SIZE},
    error::{errno, KResult},
};
use hashbrown::HashMap;
use klocks::SpinMutex;
use simple_logger::LogSink;

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    hal::{BlockDevice, FdTable, File, PageTable, PhysFrameAllocator},
    space::AddressSpace,
};

struct StderrSink;

impl LogSink for StderrSink {
    fn write_log(&self, args: fmt::Arguments<'_>) {
        std::eprint!("{args}");
    }
}

/// 日志级别由 `KERNEL_CLOG` 决定，缺省不输出
pub fn init_logger() {
    let _ = simple_logger::try_init(&StderrSink);
}

/// 物理页号从这里开始，保证 0 永远不是合法的帧
const PPN_BASE: usize = 0x80;

/// 一段模拟的物理内存
pub struct SimMemory {
    pages: Box<[UnsafeCell<[u8; PAGE_SIZE]>]>,
    free: SpinMutex<Vec<PhysPageNum>>,
}

// SAFETY: 帧内容的独占访问由帧表保证
unsafe impl Sync for SimMemory {}

impl SimMemory {
    pub fn new(frames: usize) -> Self {
        init_logger();
        Self {
            pages: (0..frames)
                .map(|_| UnsafeCell::new([0; PAGE_SIZE]))
                .collect(),
            // 倒序入栈，使分配按物理页号递增
            free: SpinMutex::new((0..frames).rev().map(|i| PhysPageNum(PPN_BASE + i)).collect()),
        }
    }
}

impl PhysFrameAllocator for SimMemory {
    fn alloc(&self) -> Option<PhysPageNum> {
        self.free.lock().pop()
    }

    unsafe fn dealloc(&self, ppn: PhysPageNum) {
        let mut free = self.free.lock();
        assert!(!free.contains(&ppn), "double free of {ppn:?}");
        free.push(ppn);
    }

    fn frame_ptr(&self, ppn: PhysPageNum) -> NonNull<[u8; PAGE_SIZE]> {
        NonNull::new(self.pages[ppn.0 - PPN_BASE].get()).unwrap()
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct PteFlags: u8 {
        const W = 1 << 0;
        const A = 1 << 1;
        const D = 1 << 2;
    }
}

/// 模拟的页表。克隆出的句柄共享同一张表，测试可以借此观察和修改访问位、脏位
#[derive(Clone, Default)]
pub struct SimPageTable {
    entries: Arc<SpinMutex<HashMap<VirtPageNum, (PhysPageNum, PteFlags)>>>,
}

impl SimPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟硬件的一次访问：映射存在且权限允许时置访问位（写时还置脏位）
    pub fn access(&self, vpn: VirtPageNum, write: bool) -> Option<PhysPageNum> {
        let mut entries = self.entries.lock();
        let (ppn, flags) = entries.get_mut(&vpn)?;
        if write && !flags.contains(PteFlags::W) {
            return None;
        }
        flags.insert(PteFlags::A);
        if write {
            flags.insert(PteFlags::D);
        }
        Some(*ppn)
    }

    pub fn set_flags(&self, vpn: VirtPageNum, accessed: bool, dirty: bool) {
        let mut entries = self.entries.lock();
        let (_, flags) = entries.get_mut(&vpn).expect("page not mapped");
        flags.set(PteFlags::A, accessed);
        flags.set(PteFlags::D, dirty);
    }

    pub fn accessed(&self, vpn: VirtPageNum) -> bool {
        self.flags(vpn).contains(PteFlags::A)
    }

    pub fn writable(&self, vpn: VirtPageNum) -> bool {
        self.flags(vpn).contains(PteFlags::W)
    }

    pub fn translate_raw(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.entries.lock().get(&vpn).map(|(ppn, _)| *ppn)
    }

    pub fn mapped(&self) -> usize {
        self.entries.lock().len()
    }

    fn flags(&self, vpn: VirtPageNum) -> PteFlags {
        self.entries
            .lock()
            .get(&vpn)
            .map_or(PteFlags::empty(), |(_, flags)| *flags)
    }

    fn update(&self, vpn: VirtPageNum, flag: PteFlags, value: bool) {
        if let Some((_, flags)) = self.entries.lock().get_mut(&vpn) {
            flags.set(flag, value);
        }
    }
}

impl PageTable for SimPageTable {
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> KResult<()> {
        let flags = if writable {
            PteFlags::W
        } else {
            PteFlags::empty()
        };
        let old = self.entries.lock().insert(vpn, (ppn, flags));
        assert!(old.is_none(), "{vpn:?} mapped twice");
        Ok(())
    }

    fn unmap(&mut self, vpn: VirtPageNum) {
        self.entries.lock().remove(&vpn);
    }

    fn translate(&self, vpn: VirtPageNum) -> Option<PhysPageNum> {
        self.translate_raw(vpn)
    }

    fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.accessed(vpn)
    }

    fn set_accessed(&mut self, vpn: VirtPageNum, accessed: bool) {
        self.update(vpn, PteFlags::A, accessed);
    }

    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.flags(vpn).contains(PteFlags::D)
    }

    fn set_dirty(&mut self, vpn: VirtPageNum, dirty: bool) {
        self.update(vpn, PteFlags::D, dirty);
    }
}

/// 内存中的文件。所有重新打开的句柄共享内容，并统计仍然打开的句柄数
pub struct MemFile {
    data: Arc<SpinMutex<Vec<u8>>>,
    handles: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Arc::new(SpinMutex::new(data.to_vec())),
            handles: Arc::new(AtomicUsize::new(1)),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// 包括自身在内，仍然打开的句柄数
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    /// 模拟文件被其他进程截断
    pub fn truncate(&self, len: usize) {
        self.data.lock().truncate(len);
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn reopen(&self) -> KResult<Arc<dyn File>> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemFile {
            data: Arc::clone(&self.data),
            handles: Arc::clone(&self.handles),
        }))
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize> {
        let data = self.data.lock();
        let Some(src) = data.get(offset..) else {
            return Ok(0);
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    /// 不会扩展文件
    fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize> {
        let mut data = self.data.lock();
        let Some(dst) = data.get_mut(offset..) else {
            return Ok(0);
        };
        let n = dst.len().min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
        Ok(n)
    }
}

pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: vec![[0; SECTOR_SIZE]; sectors],
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> usize {
        self.sectors.len()
    }

    fn read_block(&mut self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]) -> KResult<()> {
        *buf = *self.sectors.get(block_id).ok_or(errno::EIO)?;
        Ok(())
    }

    fn write_block(&mut self, block_id: usize, buf: &[u8; SECTOR_SIZE]) -> KResult<()> {
        *self.sectors.get_mut(block_id).ok_or(errno::EIO)? = *buf;
        Ok(())
    }
}

#[derive(Default)]
pub struct SimFdTable {
    files: HashMap<i32, Arc<dyn File>>,
}

impl SimFdTable {
    pub fn insert(&mut self, fd: i32, file: Arc<dyn File>) {
        self.files.insert(fd, file);
    }
}

impl FdTable for SimFdTable {
    fn get(&self, fd: i32) -> Option<Arc<dyn File>> {
        self.files.get(&fd).cloned()
    }
}

/// 像用户程序一样访问一页，必要时触发缺页
fn touch(
    space: &Arc<AddressSpace>,
    pt: &SimPageTable,
    va: VirtAddr,
    sp: VirtAddr,
    write: bool,
) -> KResult<PhysPageNum> {
    loop {
        if let Some(ppn) = pt.access(va.vpn_floor(), write) {
            return Ok(ppn);
        }
        space.handle_page_fault(va, sp, write)?;
    }
}

/// 模拟用户程序写入 `[va, va + data.len())`
pub fn user_write(
    space: &Arc<AddressSpace>,
    pt: &SimPageTable,
    va: VirtAddr,
    sp: VirtAddr,
    data: &[u8],
) -> KResult<()> {
    let mut addr = va;
    let mut rest = data;
    while !rest.is_empty() {
        let offset = addr.page_offset();
        let n = rest.len().min(PAGE_SIZE - offset);
        let ppn = touch(space, pt, addr, sp, true)?;
        // SAFETY: 测试是单线程的，两次访问之间不会发生换出
        let page = unsafe { space.vm().frames().frame_bytes_mut(ppn) };
        page[offset..offset + n].copy_from_slice(&rest[..n]);
        addr = addr + n;
        rest = &rest[n..];
    }
    Ok(())
}

/// 模拟用户程序读取 `len` 字节
pub fn user_read(
    space: &Arc<AddressSpace>,
    pt: &SimPageTable,
    va: VirtAddr,
    sp: VirtAddr,
    len: usize,
) -> KResult<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut addr = va;
    while out.len() < len {
        let offset = addr.page_offset();
        let n = (len - out.len()).min(PAGE_SIZE - offset);
        let ppn = touch(space, pt, addr, sp, false)?;
        // SAFETY: 同上
        let page = unsafe { space.vm().frames().frame_bytes_mut(ppn) };
        out.extend_from_slice(&page[offset..offset + n]);
        addr = addr + n;
    }
    Ok(out)
}
