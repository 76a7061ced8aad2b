//! mmap 相关的系统调用入口

use alloc::sync::Arc;

use defines::{
    config::{STDIN_FILENO, STDOUT_FILENO},
    error::{errno, KResult},
};

use crate::{
    address::VirtAddr,
    hal::FdTable,
    mmap::MapId,
    space::AddressSpace,
};

/// `sys_mmap` 失败时的返回值
pub const MAP_FAILED: isize = -1;

/// 把 `fd` 指向的整个文件映射到 `addr`。返回映射号。
///
/// `addr` 必须非空且按页对齐，映射的范围不能与已有的页重叠。
///
/// `mmap()` 返回之后，就算 `fd` 被立刻关闭，也不会影响映射的结果。
///
/// 标准输入输出不能被映射。任何错误都返回 [`MAP_FAILED`]
pub fn sys_mmap(space: &Arc<AddressSpace>, fds: &impl FdTable, fd: i32, addr: usize) -> isize {
    match do_mmap(space, fds, fd, addr) {
        Ok(id) => id.0 as isize,
        Err(e) => {
            debug!("mmap fd {fd} at {addr:#x} failed: {e}");
            MAP_FAILED
        }
    }
}

fn do_mmap(space: &AddressSpace, fds: &impl FdTable, fd: i32, addr: usize) -> KResult<MapId> {
    if fd == STDIN_FILENO || fd == STDOUT_FILENO {
        return Err(errno::EBADF);
    }
    let file = fds.get(fd).ok_or(errno::EBADF)?;
    space.mmap(&file, VirtAddr(addr))
}

/// 解除映射。未知的映射号被忽略，总是返回 0
pub fn sys_munmap(space: &Arc<AddressSpace>, mapid: usize) -> isize {
    if let Err(e) = space.munmap(MapId(mapid)) {
        warn!("munmap {mapid} of pid {}: {e}", space.pid());
    }
    0
}
