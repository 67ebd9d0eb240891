//! Bitmap-based physical frame allocator.
//!
//! Uses a bitmap stored in HHDM-accessible memory where each bit represents
//! one 4 KiB frame. Bit = 1 means allocated/reserved, bit = 0 means free.
//! Word-level scanning with `trailing_zeros()` (compiles to TZCNT/BSF on
//! x86_64) provides efficient allocation.

use alos_core::addr::PhysAddr;
use alos_core::paging::{PhysFrame, Size4KiB};

use crate::{FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

/// A bitmap-based physical frame allocator.
///
/// All mutation goes through `&mut self`; a `SpinLock<Option<…>>` wrapper at
/// the kernel layer provides mutual exclusion, so no interior lock is needed.
/// No method here panics: every failure is reported through [`PmmError`].
#[derive(Debug)]
pub struct BitmapAllocator {
    /// Bitmap stored as a static mutable slice of u64 words in HHDM-mapped
    /// memory.
    bitmap: &'static mut [u64],
    /// Total number of frames tracked by the bitmap.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Frames permanently owned by "reserved" (boot ranges, kernel image,
    /// the bitmap itself). Fixed after `new`.
    reserved_count: usize,
    /// Word index hint for next allocation search (amortized O(1)).
    search_hint: usize,
}

impl BitmapAllocator {
    /// Creates a new bitmap allocator from a slice of physical memory regions.
    ///
    /// Every frame of every usable region starts free; everything else
    /// (including the frames backing the bitmap itself) is reserved.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must be the correct HHDM offset.
    /// - `regions` must accurately describe physical memory.
    /// - This must be called exactly once during boot.
    pub unsafe fn new(regions: &[PhysMemoryRegion], hhdm_offset: u64) -> Result<Self, PmmError> {
        // 1. Find highest usable physical address to determine bitmap size.
        // We only need to track frames up to the end of the last usable
        // region, since we never allocate from non-usable regions.
        let max_phys = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.start.as_u64() + r.size)
            .max()
            .unwrap_or(0);

        if max_phys == 0 {
            return Err(PmmError::NoUsableMemory);
        }

        let total_frames = (max_phys / FRAME_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = bitmap_words * 8;
        let bitmap_frame_count = (bitmap_bytes as u64).div_ceil(FRAME_SIZE) as usize;

        // 2. Find the first usable region large enough for the bitmap.
        let bitmap_phys_start = regions
            .iter()
            .filter(|r| r.usable && r.size >= bitmap_bytes as u64)
            .map(|r| r.start)
            .next()
            .ok_or(PmmError::NoBitmapRegion)?;

        // 3. Map the bitmap via HHDM and create a mutable slice.
        // SAFETY: The HHDM offset is valid and bitmap_phys_start points to a
        // usable physical region large enough for bitmap_words * 8 bytes. The
        // region is not aliased because we are the sole consumer during boot.
        let bitmap = unsafe {
            let ptr = (hhdm_offset + bitmap_phys_start.as_u64()) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };

        // 4. Set ALL bits to 1 (all frames reserved by default).
        bitmap.fill(u64::MAX);

        // 5. Clear bits for usable regions (mark them free).
        let mut free_count = 0usize;
        for region in regions.iter().filter(|r| r.usable) {
            let region_start_frame = (region.start.as_u64() / FRAME_SIZE) as usize;
            let region_frame_count = (region.size / FRAME_SIZE) as usize;

            for i in 0..region_frame_count {
                let frame_idx = region_start_frame + i;
                if frame_idx < total_frames {
                    let word_idx = frame_idx / BITS_PER_WORD;
                    let bit_idx = frame_idx % BITS_PER_WORD;
                    if bitmap[word_idx] & (1u64 << bit_idx) != 0 {
                        bitmap[word_idx] &= !(1u64 << bit_idx);
                        free_count += 1;
                    }
                }
            }
        }

        // 6. Re-set bits for the bitmap's own frames (they're now in use).
        let bitmap_start_frame = (bitmap_phys_start.as_u64() / FRAME_SIZE) as usize;
        for i in 0..bitmap_frame_count {
            let frame_idx = bitmap_start_frame + i;
            if frame_idx < total_frames {
                let word_idx = frame_idx / BITS_PER_WORD;
                let bit_idx = frame_idx % BITS_PER_WORD;
                if bitmap[word_idx] & (1u64 << bit_idx) == 0 {
                    // Was marked free, now mark used.
                    bitmap[word_idx] |= 1u64 << bit_idx;
                    free_count -= 1;
                }
            }
        }

        Ok(Self {
            bitmap,
            total_frames,
            free_count,
            reserved_count: total_frames - free_count,
            search_hint: 0,
        })
    }

    /// Allocates a single 4 KiB physical frame.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if self.free_count == 0 {
            return None;
        }

        // Scan from search_hint, wrapping around if needed.
        let start = self.search_hint;
        let words = self.bitmap.len();

        for offset in 0..words {
            let word_idx = (start + offset) % words;
            let word = self.bitmap[word_idx];

            // If all bits set, this word has no free frames.
            if word == u64::MAX {
                continue;
            }

            // Find first zero bit: invert, then trailing_zeros gives position.
            let bit_idx = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit_idx;

            if frame_idx >= self.total_frames {
                continue;
            }

            // Mark as allocated.
            self.bitmap[word_idx] |= 1u64 << bit_idx;
            self.free_count -= 1;
            self.search_hint = word_idx;

            let phys_addr = frame_idx as u64 * FRAME_SIZE;
            return Some(PhysFrame::containing_address(PhysAddr::new(phys_addr)));
        }

        None
    }

    /// Allocates `count` contiguous 4 KiB physical frames. Returns the first
    /// frame of the run.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysFrame<Size4KiB>> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.allocate_frame();
        }

        if self.free_count < count {
            return None;
        }

        // Linear scan tracking consecutive free frames.
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        let mut frame_idx = 0usize;
        while frame_idx < self.total_frames {
            let word_idx = frame_idx / BITS_PER_WORD;
            let word = self.bitmap[word_idx];

            if word == u64::MAX {
                // Entire word allocated, skip it.
                run_len = 0;
                frame_idx = (word_idx + 1) * BITS_PER_WORD;
                run_start = frame_idx;
                continue;
            }

            if word == 0 {
                // Entire word free, extend run by up to 64 frames.
                let extend =
                    core::cmp::min(BITS_PER_WORD, self.total_frames - word_idx * BITS_PER_WORD);
                if run_len == 0 {
                    run_start = word_idx * BITS_PER_WORD;
                }
                run_len += extend;
                if run_len >= count {
                    break;
                }
                frame_idx = (word_idx + 1) * BITS_PER_WORD;
                continue;
            }

            // Partially occupied word -- check bit by bit.
            let bit_start = frame_idx % BITS_PER_WORD;
            for bit in bit_start..BITS_PER_WORD {
                let fi = word_idx * BITS_PER_WORD + bit;
                if fi >= self.total_frames {
                    break;
                }
                if word & (1u64 << bit) != 0 {
                    // Allocated -- reset run.
                    run_len = 0;
                    run_start = fi + 1;
                } else {
                    if run_len == 0 {
                        run_start = fi;
                    }
                    run_len += 1;
                    if run_len >= count {
                        break;
                    }
                }
            }

            if run_len >= count {
                break;
            }
            frame_idx = (word_idx + 1) * BITS_PER_WORD;
        }

        if run_len < count {
            return None;
        }

        // Mark all frames in the run as allocated.
        for i in 0..count {
            let fi = run_start + i;
            let word_idx = fi / BITS_PER_WORD;
            let bit_idx = fi % BITS_PER_WORD;
            self.bitmap[word_idx] |= 1u64 << bit_idx;
        }
        self.free_count -= count;
        self.search_hint = (run_start + count) / BITS_PER_WORD;

        let phys = PhysAddr::new(run_start as u64 * FRAME_SIZE);
        Some(PhysFrame::containing_address(phys))
    }

    /// Deallocates a single 4 KiB physical frame.
    ///
    /// Freeing a frame that is already free returns
    /// [`PmmError::NotAllocated`] and changes nothing.
    ///
    /// # Safety
    ///
    /// The frame must have been previously allocated by this allocator and
    /// must not be in use.
    pub unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) -> Result<(), PmmError> {
        let frame_idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;

        if frame_idx >= self.total_frames {
            return Err(PmmError::InvalidFrame);
        }

        let word_idx = frame_idx / BITS_PER_WORD;
        let bit_idx = frame_idx % BITS_PER_WORD;

        if self.bitmap[word_idx] & (1u64 << bit_idx) == 0 {
            return Err(PmmError::NotAllocated);
        }
        self.bitmap[word_idx] &= !(1u64 << bit_idx);
        self.free_count += 1;

        // Update hint to potentially speed up the next allocation.
        if word_idx < self.search_hint {
            self.search_hint = word_idx;
        }

        Ok(())
    }

    /// Deallocates `count` contiguous 4 KiB physical frames starting at
    /// `frame`.
    ///
    /// Fails with [`PmmError::NotAllocated`] on the first already-free frame;
    /// frames freed before the failing one stay freed.
    ///
    /// # Safety
    ///
    /// All frames in the range must have been previously allocated by this
    /// allocator and must not be in use.
    pub unsafe fn deallocate_frames(
        &mut self,
        frame: PhysFrame<Size4KiB>,
        count: usize,
    ) -> Result<(), PmmError> {
        let start_idx = (frame.start_address().as_u64() / FRAME_SIZE) as usize;

        if start_idx + count > self.total_frames {
            return Err(PmmError::InvalidFrame);
        }

        for i in 0..count {
            let fi = start_idx + i;
            let word_idx = fi / BITS_PER_WORD;
            let bit_idx = fi % BITS_PER_WORD;
            if self.bitmap[word_idx] & (1u64 << bit_idx) == 0 {
                return Err(PmmError::NotAllocated);
            }
            self.bitmap[word_idx] &= !(1u64 << bit_idx);
            self.free_count += 1;
        }

        let hint_word = start_idx / BITS_PER_WORD;
        if hint_word < self.search_hint {
            self.search_hint = hint_word;
        }

        Ok(())
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Returns the total number of tracked frames.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of frames handed out by allocation.
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count - self.reserved_count
    }

    /// Returns the number of frames permanently reserved at init.
    pub fn reserved_frames(&self) -> usize {
        self.reserved_count
    }
}

/// Wrapper that implements [`FrameAllocator`] / [`FrameDeallocator`] by
/// forwarding to `&mut BitmapAllocator`.
pub struct BitmapFrameAllocRef<'a>(pub &'a mut BitmapAllocator);

// SAFETY: The bitmap allocator never hands out a frame twice: allocation
// sets the frame's bit and only deallocation clears it.
unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.0.allocate_frame()
    }
}

// SAFETY: Forwarding to the bitmap allocator, which validates the frame.
unsafe impl FrameDeallocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let _ = unsafe { self.0.deallocate_frame(frame) };
    }
}
