//! 帧表：所有分配给用户页的物理帧
//!
//! 每个帧只记录其所有者进程与对应的虚拟页号，补充页表项则只记录物理页号，
//! 两边都不持有对方，任何一侧都可以独立拆除。
//!
//! 加锁顺序固定为：帧表 -> 补充页表 -> 交换区。持有某个补充页表的锁时不允许再获取帧表锁

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use core::{
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

use defines::{
    config::PAGE_SIZE,
    error::{errno, KResult},
};
use klocks::{SpinMutex, SpinMutexGuard};
use smallvec::SmallVec;

use crate::{
    address::{PhysPageNum, VirtPageNum},
    hal::PhysFrameAllocator,
    page::{PageOrigin, Residence},
    space::{AddressSpace, AddressSpaceInner},
    swap::SwapStore,
};

struct FrameEntry {
    owner: Weak<AddressSpace>,
    vpn: VirtPageNum,
}

struct FrameTableInner {
    frames: BTreeMap<PhysPageNum, FrameEntry>,
    /// 时钟算法的指针，指向上一次检查过的帧。跨调用保留
    hand: Option<PhysPageNum>,
}

impl FrameTableInner {
    /// 时钟指针前进一格，越过末尾时回到开头
    fn advance_hand(&mut self) -> Option<(PhysPageNum, Weak<AddressSpace>, VirtPageNum)> {
        let next = match self.hand {
            Some(hand) => self
                .frames
                .range((Bound::Excluded(hand), Bound::Unbounded))
                .next()
                .or_else(|| self.frames.iter().next()),
            None => self.frames.iter().next(),
        };
        let (ppn, owner, vpn) = next.map(|(&ppn, entry)| (ppn, entry.owner.clone(), entry.vpn))?;
        self.hand = Some(ppn);
        Some((ppn, owner, vpn))
    }
}

pub struct FrameTable {
    allocator: Box<dyn PhysFrameAllocator>,
    swap: Arc<SwapStore>,
    inner: SpinMutex<FrameTableInner>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(allocator: Box<dyn PhysFrameAllocator>, swap: Arc<SwapStore>) -> Self {
        Self {
            allocator,
            swap,
            inner: SpinMutex::new(FrameTableInner {
                frames: BTreeMap::new(),
                hand: None,
            }),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) -> FrameTableGuard<'_> {
        FrameTableGuard {
            inner: self.inner.lock(),
            table: self,
            deferred: SmallVec::new(),
        }
    }

    /// 为 `owner` 的 `vpn` 分配一个清零的帧
    ///
    /// 物理页耗尽时换出恰好一个帧后重试一次。没有可换出的帧时返回 `ENOMEM`：
    /// 所有帧都被钉住，或剩下的脏页都拿不到交换槽位
    pub fn allocate(&self, owner: &Arc<AddressSpace>, vpn: VirtPageNum) -> KResult<PhysPageNum> {
        let mut frames = self.lock();
        let ppn = match self.allocator.alloc() {
            Some(ppn) => ppn,
            None => {
                frames.evict_one()?;
                self.allocator.alloc().ok_or(errno::ENOMEM)?
            }
        };
        frames.inner.frames.insert(
            ppn,
            FrameEntry {
                owner: Arc::downgrade(owner),
                vpn,
            },
        );
        // SAFETY: 新分配的帧尚未映射到任何地址空间
        unsafe { self.frame_bytes_mut(ppn) }.fill(0);
        trace!("frame: {ppn:?} -> pid {} {vpn:?}", owner.pid());
        Ok(ppn)
    }

    /// 释放一个帧。对已释放的帧调用是无害的
    pub fn release(&self, ppn: PhysPageNum) {
        self.lock().release(ppn);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// 需保证对该帧的独占访问：帧对应的页表项被钉住，或者同时持有帧表锁与所有者的补充页表锁
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_bytes_mut(&self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *self.allocator.frame_ptr(ppn).as_ptr() }
    }

    /// 尝试把 `ppn` 作为牺牲帧换出。返回 `false` 表示它本轮不能被选中
    fn try_evict(
        &self,
        space: &mut AddressSpaceInner,
        ppn: PhysPageNum,
        vpn: VirtPageNum,
    ) -> KResult<bool> {
        let AddressSpaceInner {
            spt, page_table, ..
        } = space;
        let Some(entry) = spt.get_mut(vpn) else {
            return Ok(false);
        };
        if entry.pinned || entry.frame() != Some(ppn) {
            return Ok(false);
        }
        if page_table.is_accessed(vpn) {
            page_table.set_accessed(vpn, false);
            return Ok(false);
        }

        let dirty = entry.dirty || page_table.is_dirty(vpn);
        // SAFETY: 持有帧表锁与所有者的补充页表锁
        let page = unsafe { self.frame_bytes_mut(ppn) };
        let residence = match entry.origin() {
            PageOrigin::Mmap(backing) => {
                if dirty {
                    backing.write_back(page)?;
                }
                Residence::NotLoaded
            }
            PageOrigin::Stack | PageOrigin::File(_) if dirty => {
                let Ok(slot) = self.swap.reserve() else {
                    // 交换区已满，留在内存里，让时钟继续找干净的页
                    trace!("frame: no swap slot for dirty {vpn:?}, skip");
                    return Ok(false);
                };
                if let Err(e) = self.swap.write(slot, page) {
                    self.swap.release(slot);
                    return Err(e);
                }
                Residence::Swapped(slot)
            }
            PageOrigin::Stack | PageOrigin::File(_) => Residence::NotLoaded,
        };
        page_table.unmap(vpn);
        entry.residence = residence;
        entry.dirty = false;
        Ok(true)
    }
}

/// 持有帧表锁期间的操作
pub struct FrameTableGuard<'a> {
    // 字段按声明顺序析构：先放锁，再释放换出过程中临时持有的地址空间。
    // 后者可能是某个进程的最后一个引用，其析构需要重新获取帧表锁
    inner: SpinMutexGuard<'a, FrameTableInner>,
    table: &'a FrameTable,
    deferred: SmallVec<[Arc<AddressSpace>; 4]>,
}

impl FrameTableGuard<'_> {
    /// 释放一个帧。对已释放的帧调用是无害的
    pub fn release(&mut self, ppn: PhysPageNum) {
        if self.inner.frames.remove(&ppn).is_none() {
            warn!("frame: release of untracked frame {ppn:?}");
            return;
        }
        // SAFETY: 帧已从帧表中移除，不再被任何页表项引用
        unsafe { self.table.allocator.dealloc(ppn) };
    }

    /// 用时钟（二次机会）算法选择并回收一个帧，返回被回收的物理页号
    ///
    /// 被钉住的页、所有者正在退出的页、拿不到交换槽位的脏页都会被跳过。
    /// 经过的帧的访问位会被清除，最多扫描两轮
    pub fn evict_one(&mut self) -> KResult<PhysPageNum> {
        let budget = self.inner.frames.len() * 2 + 1;
        for _ in 0..budget {
            let Some((ppn, owner, vpn)) = self.inner.advance_hand() else {
                break;
            };
            let Some(space) = owner.upgrade() else {
                continue;
            };
            let evicted = self.table.try_evict(&mut space.inner.lock(), ppn, vpn);
            let pid = space.pid();
            self.deferred.push(space);
            if evicted? {
                self.inner.frames.remove(&ppn);
                // SAFETY: 页表映射已解除，补充页表项也不再引用该帧
                unsafe { self.table.allocator.dealloc(ppn) };
                self.table.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("frame: evict pid {pid} {vpn:?} from {ppn:?}");
                return Ok(ppn);
            }
        }
        warn!("frame: no frame can be evicted");
        Err(errno::ENOMEM)
    }

    pub fn len(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.frames.is_empty()
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.inner.frames.contains_key(&ppn)
    }

    /// 帧当前承载的虚拟页
    pub fn owner_of(&self, ppn: PhysPageNum) -> Option<VirtPageNum> {
        self.inner.frames.get(&ppn).map(|entry| entry.vpn)
    }

    /// # Safety
    ///
    /// 需同时持有该帧所有者的补充页表锁
    pub(crate) unsafe fn frame_bytes(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        unsafe { &*self.table.allocator.frame_ptr(ppn).as_ptr() }
    }
}
