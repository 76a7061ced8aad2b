//! 虚拟内存子系统的编译期配置

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// 页内偏移的掩码
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 块设备的扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一个交换槽位（即一页）占据的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户地址空间的上界（不含），其上是内核地址空间
pub const USER_END: usize = 0xC000_0000;

/// 用户栈的最大大小，栈从 `USER_END` 向下增长
pub const USER_STACK_SIZE: usize = 8 * MB;

/// 允许访问栈指针之下多少字节仍被视为栈增长
///
/// 最宽的压栈指令会先访问 `sp - 32` 再移动栈指针
pub const STACK_GROWTH_SLACK: usize = 32;

/// 保留给标准输入输出的文件描述符，不允许被 mmap
pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(USER_END % PAGE_SIZE == 0);
