#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{vec, vec::Vec};

/// 基于回收的分配器，即用 vector 收集释放的 id
///
/// 用于分配 mmap 的映射号
#[derive(Clone, Debug)]
pub struct RecycleAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配
    pub const fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }
}

/// 定长位图分配器，每一位代表一个槽位是否被占用
///
/// 用于交换区槽位的分配。容量为 0 时任何分配都会失败
#[derive(Clone, Debug)]
pub struct BitAllocator {
    capacity: usize,
    in_use: usize,
    words: Vec<u64>,
}

impl BitAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    /// 找到第一个空闲位并将其置位
    pub fn alloc(&mut self) -> Option<usize> {
        for (word_id, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = word_id * 64 + bit;
            // 最后一个字中超出容量的位永远不能分配
            if id >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(id);
        }
        None
    }

    /// 清除某一位。返回该位之前是否被占用
    pub fn dealloc(&mut self, id: usize) -> bool {
        if id >= self.capacity {
            return false;
        }
        let (word, mask) = (&mut self.words[id / 64], 1u64 << (id % 64));
        let was_set = *word & mask != 0;
        *word &= !mask;
        if was_set {
            self.in_use -= 1;
        }
        was_set
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        id < self.capacity && self.words[id / 64] & (1 << (id % 64)) != 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}
