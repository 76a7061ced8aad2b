//! 文件的内存映射
//!
//! 映射按需加载，被修改过的页在换出或解除映射时写回文件，而不进入交换区

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use defines::{
    config::{PAGE_SIZE, USER_END},
    error::{errno, KResult},
};

use crate::{
    address::{VirtAddr, VirtPageNum},
    frame::FrameTableGuard,
    hal::File,
    page::{FileBacking, PageEntry},
    space::{AddressSpace, AddressSpaceInner},
    swap::SwapStore,
};

/// 进程内唯一的映射号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(pub usize);

#[derive(Clone)]
pub struct FileMapping {
    id: MapId,
    /// 独立于用户文件描述符的句柄，映射期间关闭描述符不影响映射
    file: Arc<dyn File>,
    start: VirtPageNum,
    pages: usize,
}

impl FileMapping {
    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn start(&self) -> VirtAddr {
        self.start.page_start()
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// 把整个文件映射到 `addr` 开始的连续页上
    ///
    /// `addr` 需非空且按页对齐，文件不能为空，映射范围不能与已有的页重叠（`EEXIST`）。
    /// 映射是惰性的，此时不读取文件内容
    pub fn mmap(&self, file: &Arc<dyn File>, addr: VirtAddr) -> KResult<MapId> {
        if !addr.is_user() || !addr.is_page_aligned() {
            return Err(errno::EINVAL);
        }
        let len = file.len();
        if len == 0 {
            return Err(errno::EINVAL);
        }
        let pages = len.div_ceil(PAGE_SIZE);
        let end = addr.0.checked_add(pages * PAGE_SIZE).ok_or(errno::EINVAL)?;
        if end > USER_END {
            return Err(errno::EINVAL);
        }

        let file = file.reopen()?;
        let start = addr.vpn_floor();
        let mut inner = self.inner.lock();
        if start.range(pages).any(|vpn| inner.spt.contains(vpn)) {
            debug!("pid {}: mmap at {addr:?} overlaps", self.pid());
            return Err(errno::EEXIST);
        }
        for (i, vpn) in start.range(pages).enumerate() {
            let offset = i * PAGE_SIZE;
            let read_bytes = (len - offset).min(PAGE_SIZE);
            let backing = FileBacking::new(Arc::clone(&file), offset, read_bytes);
            if let Err(e) = inner.spt.insert(PageEntry::new_mmap(vpn, backing)) {
                for vpn in start.range(i) {
                    inner.spt.remove(vpn.page_start());
                }
                return Err(e);
            }
        }

        let id = MapId(inner.map_ids.alloc());
        inner.mappings.insert(
            id,
            FileMapping {
                id,
                file,
                start,
                pages,
            },
        );
        debug!(
            "pid {}: mmap {id:?} at {addr:?}, {len} bytes in {pages} pages",
            self.pid()
        );
        Ok(id)
    }

    /// 解除映射，被修改过的页写回文件
    ///
    /// 未知的映射号什么也不做。即使写回失败，映射也会被完整地拆除，之后再返回第一个错误
    pub fn munmap(&self, id: MapId) -> KResult<()> {
        let mut frames = self.vm().frames().lock();
        let mut inner = self.inner.lock();
        inner.unmap_locked(id, &mut frames, self.vm().swap())
    }

    pub fn mappings(&self) -> Vec<FileMapping> {
        self.inner.lock().mappings.values().cloned().collect()
    }
}

impl AddressSpaceInner {
    pub(crate) fn unmap_locked(
        &mut self,
        id: MapId,
        frames: &mut FrameTableGuard<'_>,
        swap: &SwapStore,
    ) -> KResult<()> {
        let Some(mapping) = self.mappings.remove(&id) else {
            debug!("munmap: unknown {id:?}");
            return Ok(());
        };

        let mut result = Ok(());
        for vpn in mapping.start.range(mapping.pages) {
            let Some(mut entry) = self.spt.remove(vpn.page_start()) else {
                continue;
            };
            if let (Some(ppn), Some(backing)) = (entry.frame(), entry.file_backing()) {
                if entry.dirty || self.page_table.is_dirty(vpn) {
                    // SAFETY: 同时持有帧表锁和补充页表锁
                    let page = unsafe { frames.frame_bytes(ppn) };
                    if let Err(e) = backing.write_back(page) {
                        warn!("munmap: write back of {vpn:?} failed: {e}");
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
            entry.release_backing(frames, self.page_table.as_mut(), swap);
        }
        self.map_ids.dealloc(id.0);
        debug!("munmap {id:?}: {} pages", mapping.pages);
        result
    }
}
