// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Slab allocator for chunk storage.
//!
//! Chunks come in two fixed sizes, 8 KiB and 16 KiB, backed by pages of
//! 62 blocks apiece (62 * 16 KiB rounds to a whole number of 4 KiB OS
//! pages with a little room for page bookkeeping left over). Each page
//! keeps its free blocks in an intrusive singly-linked list: a free
//! block's own first four bytes hold the index of the next free block in
//! the same page, so the allocator needs no side table to track freeness.
//!
//! Freeing a block requires the caller to already know which page and
//! block index it came from — that's the `BlockHandle` returned by
//! `alloc`, which a `Chunk` holds onto as its own back-pointer into the
//! allocator for as long as it's alive.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Number of blocks carved out of each page, regardless of size class.
pub const BLOCKS_PER_PAGE: usize = 62;

const SMALL_BLOCK_BYTES: usize = 8 * 1024;
const LARGE_BLOCK_BYTES: usize = 16 * 1024;

/// The two chunk sizes the allocator hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn block_bytes(self) -> usize {
        match self {
            SizeClass::Small => SMALL_BLOCK_BYTES,
            SizeClass::Large => LARGE_BLOCK_BYTES,
        }
    }

    /// Smallest size class that can hold `needed` bytes, if any.
    pub fn for_size(needed: usize) -> Option<SizeClass> {
        if needed <= SMALL_BLOCK_BYTES {
            Some(SizeClass::Small)
        } else if needed <= LARGE_BLOCK_BYTES {
            Some(SizeClass::Large)
        } else {
            None
        }
    }

    fn index(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => 1,
        }
    }
}

const FREE_LIST_END: u32 = u32::MAX;

struct Page {
    data: NonNull<u8>,
    layout: Layout,
    free_head: u32,
    free_count: u16,
}

// SAFETY: `Page` owns its allocation and is only ever accessed through
// `ChunkAllocator`, which is not `Sync`; raw pointers just carry no auto
// trait by default.
unsafe impl Send for Page {}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.data.as_ptr(), self.layout) }
    }
}

/// A live allocation handed out by the allocator. Acts as the
/// block's back-pointer: the owner (a `Chunk`) hands this back verbatim
/// to free the block, with no reverse lookup needed.
#[derive(Debug, Clone, Copy)]
pub struct BlockHandle {
    pub ptr: NonNull<u8>,
    pub size_class: SizeClass,
    page_index: u32,
    block_index: u32,
}

/// Slab allocator handing out fixed-size chunk blocks from 62-block
/// pages, one free list per size class.
#[derive(Default)]
pub struct ChunkAllocator {
    pages: [Vec<Option<Page>>; 2],
    partial: [Vec<u32>; 2],
    full: [Vec<u32>; 2],
}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, size_class: SizeClass) -> BlockHandle {
        let class = size_class.index();
        let page_index = match self.partial[class].last().copied() {
            Some(p) => p,
            None => self.alloc_page(size_class),
        };

        let page = self.pages[class][page_index as usize]
            .as_mut()
            .expect("partial list referenced a freed page");
        let block_index = page.free_head;
        debug_assert_ne!(block_index, FREE_LIST_END, "partial page has no free blocks");

        let block_bytes = size_class.block_bytes();
        let block_ptr = unsafe { page.data.as_ptr().add(block_index as usize * block_bytes) };
        let next = unsafe { (block_ptr as *const u32).read_unaligned() };
        page.free_head = next;
        page.free_count -= 1;
        if page.free_count == 0 {
            self.partial[class].pop();
            self.full[class].push(page_index);
        }

        BlockHandle {
            ptr: NonNull::new(block_ptr).expect("page allocation cannot be null"),
            size_class,
            page_index,
            block_index,
        }
    }

    pub fn free(&mut self, handle: BlockHandle) {
        let class = handle.size_class.index();
        let block_bytes = handle.size_class.block_bytes();
        let page = self.pages[class][handle.page_index as usize]
            .as_mut()
            .expect("freeing block from an already-flushed page");
        let was_full = page.free_count == 0;

        unsafe {
            let block_ptr = page.data.as_ptr().add(handle.block_index as usize * block_bytes);
            (block_ptr as *mut u32).write_unaligned(page.free_head);
        }
        page.free_head = handle.block_index;
        page.free_count += 1;

        if was_full {
            self.full[class].retain(|&p| p != handle.page_index);
            self.partial[class].push(handle.page_index);
        }
    }

    /// Reclaims pages that are completely free, returning their memory to
    /// the system allocator. Called periodically by `World`, not on every
    /// free, so short-lived churn doesn't thrash `mmap`/`munmap`.
    pub fn flush(&mut self) {
        for class in 0..2 {
            self.partial[class].retain(|&page_index| {
                let page = self.pages[class][page_index as usize].as_ref().unwrap();
                if page.free_count as usize == BLOCKS_PER_PAGE {
                    self.pages[class][page_index as usize] = None;
                    false
                } else {
                    true
                }
            });
        }
    }

    fn alloc_page(&mut self, size_class: SizeClass) -> u32 {
        let class = size_class.index();
        let block_bytes = size_class.block_bytes();
        let layout = Layout::from_size_align(block_bytes * BLOCKS_PER_PAGE, block_bytes)
            .expect("page layout cannot overflow");
        let data = unsafe { NonNull::new(alloc(layout)) }.unwrap_or_else(|| {
            std::alloc::handle_alloc_error(layout);
        });

        // Thread the intrusive free list through every block up front:
        // block i points at block i + 1, last block terminates the chain.
        unsafe {
            for i in 0..BLOCKS_PER_PAGE {
                let block_ptr = data.as_ptr().add(i * block_bytes);
                let next = if i + 1 == BLOCKS_PER_PAGE {
                    FREE_LIST_END
                } else {
                    (i + 1) as u32
                };
                (block_ptr as *mut u32).write_unaligned(next);
            }
        }

        let page = Page {
            data,
            layout,
            free_head: 0,
            free_count: BLOCKS_PER_PAGE as u16,
        };

        // Reuse a tombstoned slot left by `flush` before growing the page list.
        let page_index = if let Some(slot) = self.pages[class].iter().position(|p| p.is_none()) {
            self.pages[class][slot] = Some(page);
            slot as u32
        } else {
            self.pages[class].push(Some(page));
            (self.pages[class].len() - 1) as u32
        };

        self.partial[class].push(page_index);
        page_index
    }
}
