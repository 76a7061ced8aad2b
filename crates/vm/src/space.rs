use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};

use defines::{
    config::{PAGE_SIZE, USER_END},
    error::{errno, KResult},
};
use idallocator::RecycleAllocator;
use klocks::SpinMutex;
use smallvec::SmallVec;

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::{File, PageTable},
    mmap::{FileMapping, MapId},
    page::{FileBacking, PageEntry, SupplementalPageTable},
    Vm,
};

/// 进程的用户地址空间
///
/// 补充页表、硬件页表和 mmap 映射表由同一把锁保护。
/// 换出其他进程的页时，帧表会在持有自己的锁的情况下获取这把锁
pub struct AddressSpace {
    pid: usize,
    vm: Arc<Vm>,
    pub(crate) inner: SpinMutex<AddressSpaceInner>,
}

pub(crate) struct AddressSpaceInner {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) page_table: Box<dyn PageTable>,
    pub(crate) mappings: BTreeMap<MapId, FileMapping>,
    pub(crate) map_ids: RecycleAllocator,
    pub(crate) torn_down: bool,
}

impl AddressSpace {
    pub fn new(vm: &Arc<Vm>, pid: usize, page_table: Box<dyn PageTable>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            vm: Arc::clone(vm),
            inner: SpinMutex::new(AddressSpaceInner {
                spt: SupplementalPageTable::new(),
                page_table,
                mappings: BTreeMap::new(),
                map_ids: RecycleAllocator::new(),
                torn_down: false,
            }),
        })
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// 在持有锁的情况下只读地访问补充页表
    pub fn with_spt<R>(&self, f: impl FnOnce(&SupplementalPageTable) -> R) -> R {
        f(&self.inner.lock().spt)
    }

    /// 惰性地登记可执行文件的一个段
    ///
    /// 从文件的 `offset` 处开始，`upage` 起的 `read_bytes` 字节来自文件，其后 `zero_bytes` 字节填零。
    /// 此时不分配任何帧，页在第一次被访问时才加载
    pub fn register_segment(
        &self,
        file: &Arc<dyn File>,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        let total = read_bytes + zero_bytes;
        if offset % PAGE_SIZE != 0
            || !upage.is_page_aligned()
            || total % PAGE_SIZE != 0
            || !upage.is_user()
            || USER_END - upage.0 < total
        {
            return Err(errno::EINVAL);
        }

        let start = upage.vpn_floor();
        let pages = total / PAGE_SIZE;
        let mut inner = self.inner.lock();
        let mut remaining = read_bytes;
        for (i, vpn) in start.range(pages).enumerate() {
            let page_read = remaining.min(PAGE_SIZE);
            remaining -= page_read;
            let backing = FileBacking::new(Arc::clone(file), offset + i * PAGE_SIZE, page_read);
            if let Err(e) = inner
                .spt
                .insert(PageEntry::new_file(vpn, backing, writable))
            {
                for vpn in start.range(i) {
                    inner.spt.remove(vpn.page_start());
                }
                return Err(e);
            }
        }
        trace!(
            "pid {}: segment {upage:?}, {pages} pages, {read_bytes} bytes from file",
            self.pid
        );
        Ok(())
    }

    /// 建立初始的用户栈：立即加载最顶端的一页，返回初始的栈指针
    pub fn setup_stack(self: &Arc<Self>) -> KResult<VirtAddr> {
        let top = VirtAddr(USER_END);
        let vpn = VirtAddr(USER_END - PAGE_SIZE).vpn_floor();
        self.inner.lock().spt.insert(PageEntry::new_stack(vpn))?;
        if let Err(e) = self.handle_page_fault(vpn.page_start(), top, true) {
            self.inner.lock().spt.remove(vpn.page_start());
            return Err(e);
        }
        Ok(top)
    }

    /// 将用户缓冲区 `[start, start + len)` 的每一页换入并钉住
    ///
    /// 系统调用在访问用户内存期间不能缺页，因此事先调用它。失败时已经钉住的页会被解除
    pub fn pin_user_range(
        self: &Arc<Self>,
        start: VirtAddr,
        len: usize,
        user_sp: VirtAddr,
        for_write: bool,
    ) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start.0.checked_add(len).ok_or(errno::EFAULT)?;
        let first = start.vpn_floor();
        let last = VirtAddr(end).vpn_ceil();
        for vpn in first.range(last.0 - first.0) {
            let addr = if vpn == first { start } else { vpn.page_start() };
            if let Err(e) = self.resolve(addr, user_sp, for_write, true) {
                self.unpin_pages(first, vpn.0 - first.0);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn unpin_user_range(&self, start: VirtAddr, len: usize) {
        if len == 0 {
            return;
        }
        let first = start.vpn_floor();
        let last = VirtAddr(start.0.saturating_add(len)).vpn_ceil();
        self.unpin_pages(first, last.0 - first.0);
    }

    fn unpin_pages(&self, first: VirtPageNum, count: usize) {
        let mut inner = self.inner.lock();
        for vpn in first.range(count) {
            if let Some(entry) = inner.spt.get_mut(vpn) {
                entry.pinned = false;
            }
        }
    }

    /// 进程退出时回收所有资源：解除所有 mmap 映射（写回脏页），然后释放每一页的帧和交换槽位
    ///
    /// 可以重复调用，`Drop` 时也会调用
    pub fn teardown(&self) {
        let mut frames = self.vm.frames().lock();
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return;
        }
        inner.torn_down = true;

        let ids: SmallVec<[MapId; 4]> = inner.mappings.keys().copied().collect();
        for id in ids {
            if let Err(e) = inner.unmap_locked(id, &mut frames, self.vm.swap()) {
                warn!("pid {}: write back of {id:?} failed on exit: {e}", self.pid);
            }
        }
        let AddressSpaceInner {
            spt, page_table, ..
        } = &mut *inner;
        let pages = spt.len();
        spt.destroy_all(&mut frames, page_table.as_mut(), self.vm.swap());
        debug!("pid {}: address space torn down, {pages} pages freed", self.pid);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.teardown();
    }
}
