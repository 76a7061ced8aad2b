//! 缺页处理与按需调页

use alloc::sync::Arc;

use defines::{
    config::{PAGE_SIZE, STACK_GROWTH_SLACK, USER_END, USER_STACK_SIZE},
    error::{errno, KResult},
};
use scopeguard::ScopeGuard;

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    page::{FileBacking, PageEntry, PageOrigin, Residence},
    space::{AddressSpace, AddressSpaceInner},
    swap::{SwapSlot, SwapStore},
};

/// 缺页时页内容的来源
enum LoadSource {
    Zero,
    File(FileBacking),
    Swap(SwapSlot),
}

impl LoadSource {
    fn of(entry: &PageEntry) -> Self {
        match (entry.residence(), entry.origin()) {
            (Residence::Swapped(slot), _) => Self::Swap(slot),
            (_, PageOrigin::Stack) => Self::Zero,
            (_, PageOrigin::File(backing) | PageOrigin::Mmap(backing)) => {
                Self::File(backing.clone())
            }
        }
    }

    /// 填充一个已经清零的帧
    fn load(&self, swap: &SwapStore, page: &mut [u8; PAGE_SIZE]) -> KResult<()> {
        match self {
            Self::Zero => Ok(()),
            Self::Swap(slot) => swap.read(*slot, page),
            Self::File(backing) => {
                let read = backing
                    .file
                    .read_at(backing.offset, &mut page[..backing.read_bytes])?;
                if read != backing.read_bytes {
                    warn!(
                        "short read at offset {:#x}: {read}/{}",
                        backing.offset, backing.read_bytes
                    );
                    return Err(errno::EIO);
                }
                Ok(())
            }
        }
    }
}

/// 没有表项的地址是否可以视为栈的增长
fn is_stack_access(addr: VirtAddr, user_sp: VirtAddr) -> bool {
    addr.0 >= user_sp.0.saturating_sub(STACK_GROWTH_SLACK)
        && addr.0 >= USER_END - USER_STACK_SIZE
}

impl AddressSpace {
    /// 处理用户态缺页
    ///
    /// 返回 `Ok` 时 `fault_addr` 所在页已经映射，可以重新执行引发缺页的指令。
    /// 返回 `EAGAIN` 表示同一页正由另一个线程加载，稍后重试即可。
    /// 返回其他错误时调用者应当终止该进程
    pub fn handle_page_fault(
        self: &Arc<Self>,
        fault_addr: VirtAddr,
        user_sp: VirtAddr,
        is_write: bool,
    ) -> KResult<()> {
        trace!(
            "pid {}: page fault at {fault_addr:?}, write: {is_write}",
            self.pid()
        );
        self.resolve(fault_addr, user_sp, is_write, false)
    }

    /// 使 `addr` 所在页驻留。`keep_pinned` 为真时返回后该页保持钉住
    pub(crate) fn resolve(
        self: &Arc<Self>,
        addr: VirtAddr,
        user_sp: VirtAddr,
        is_write: bool,
        keep_pinned: bool,
    ) -> KResult<()> {
        if !addr.is_user() {
            debug!("pid {}: invalid user address {addr:?}", self.pid());
            return Err(errno::EFAULT);
        }
        let vpn = addr.vpn_floor();

        let source = {
            let mut inner = self.inner.lock();
            if inner.torn_down {
                return Err(errno::EFAULT);
            }
            if !inner.spt.contains(vpn) {
                if !is_stack_access(addr, user_sp) {
                    debug!(
                        "pid {}: no page at {addr:?}, sp {user_sp:?}",
                        self.pid()
                    );
                    return Err(errno::EFAULT);
                }
                trace!("pid {}: grow stack to {vpn:?}", self.pid());
                inner.spt.insert(PageEntry::new_stack(vpn))?;
            }
            let entry = inner.spt.get_mut(vpn).ok_or(errno::EFAULT)?;
            if is_write && !entry.is_writable() {
                debug!("pid {}: write to read-only {vpn:?}", self.pid());
                return Err(errno::EFAULT);
            }
            if entry.frame().is_some() {
                // 另一次缺页已经把它换入了
                entry.pinned |= keep_pinned;
                return Ok(());
            }
            if entry.pinned {
                // 被钉住却不驻留，只能是另一次缺页正在加载它
                trace!("pid {}: {vpn:?} is being loaded", self.pid());
                return Err(errno::EAGAIN);
            }
            entry.pinned = true;
            LoadSource::of(entry)
        };

        // 以下过程不持有补充页表的锁，页被钉住
        let unpin = scopeguard::guard((), |()| {
            if let Some(entry) = self.inner.lock().spt.get_mut(vpn) {
                entry.pinned = false;
            }
        });
        let frames = self.vm().frames();
        let ppn = frames.allocate(self, vpn)?;
        let frame = scopeguard::guard(ppn, |ppn| frames.release(ppn));
        // SAFETY: 帧刚分配且尚未映射，页被钉住，只有当前路径会访问它
        let page = unsafe { frames.frame_bytes_mut(ppn) };
        source.load(self.vm().swap(), page)?;
        self.install(vpn, ppn, &source, keep_pinned)?;

        ScopeGuard::into_inner(frame);
        ScopeGuard::into_inner(unpin);
        Ok(())
    }

    fn install(
        &self,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        source: &LoadSource,
        keep_pinned: bool,
    ) -> KResult<()> {
        let mut inner = self.inner.lock();
        let AddressSpaceInner {
            spt, page_table, ..
        } = &mut *inner;
        let entry = spt.get_mut(vpn).ok_or(errno::EFAULT)?;
        page_table.map(vpn, ppn, entry.is_writable())?;
        if let LoadSource::Swap(slot) = source {
            self.vm().swap().release(*slot);
            // 换入的内容已与来源不同，再次换出时必须保存
            entry.dirty = true;
        }
        entry.residence = Residence::Resident(ppn);
        entry.pinned = keep_pinned;
        Ok(())
    }
}
