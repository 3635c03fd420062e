//! Shared scratch buffer layout.
//!
//! Several acceleration structure builds can share one scratch allocation as
//! long as their byte ranges never overlap. Ranges are handed out in list
//! order from a running offset that is re-aligned after every element, so the
//! total is the sum of aligned partial sums, not the aligned plain sum.

use voxray_gpu::{GpuError, Result};

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. Zero is treated as one.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// A scratch sub-range assigned to one build, relative to the buffer start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchSlot {
    pub offset: u64,
    pub size: u64,
}

impl ScratchSlot {
    /// One past the last byte of the slot.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Total scratch bytes needed to host `sizes` back to back.
pub fn required_scratch_size<I>(sizes: I, alignment: u64) -> u64
where
    I: IntoIterator<Item = u64>,
{
    sizes
        .into_iter()
        .fold(0, |total, size| align_up(total + size, alignment))
}

/// Lay out `sizes` inside a scratch buffer of `available` bytes.
///
/// Fails with [`GpuError::ScratchOverflow`] as soon as the running offset
/// passes `available`; no slot is returned in that case.
pub fn scratch_layout<I>(sizes: I, alignment: u64, available: u64) -> Result<Vec<ScratchSlot>>
where
    I: IntoIterator<Item = u64>,
    I::IntoIter: Clone,
{
    let sizes = sizes.into_iter();
    let mut slots = Vec::with_capacity(sizes.size_hint().0);
    let mut offset = 0;

    for size in sizes.clone() {
        slots.push(ScratchSlot { offset, size });
        offset = align_up(offset + size, alignment);

        if offset > available {
            return Err(GpuError::ScratchOverflow {
                required: required_scratch_size(sizes, alignment),
                available,
            });
        }
    }

    Ok(slots)
}
