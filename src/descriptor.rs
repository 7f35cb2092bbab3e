//! Descriptors of the data a job operates on.
//!
//! A job is described by three buffer descriptors and a function:
//!
//! - The uniform descriptor lists read-only buffers visible in full by every slice,
//!   and how much per-worker scratch memory the job needs.
//! - The input and output descriptors list buffers that are cut into slices. All
//!   buffers of a descriptor are parallel: slice `i` of the job maps to slice `i` of
//!   each of them. Buffer 0 of the input descriptor defines the number of slices.
//! - The function descriptor holds the work function and an optional completion
//!   callback.
//!
//! The scheduler never owns or allocates buffer memory. Descriptors only store pointers
//! and sizes, which is why building them from memory is `unsafe`: the memory has to
//! stay valid, and must not be accessed in a conflicting way, for as long as the job
//! may execute.

use std::ops::Range;
use std::ptr::NonNull;

use crate::context::SliceContext;
use crate::{MAX_SCRATCH_SIZE, MAX_SLICE_BUFFERS};

/// A read-only buffer shared by all slices of a job.
#[derive(Copy, Clone, Debug)]
pub struct UniformBuffer {
    ptr: NonNull<u8>,
    size: usize,
}

// The descriptor only carries the address, the safety contract of the constructors
// covers cross-thread access.
unsafe impl Send for UniformBuffer {}
unsafe impl Sync for UniformBuffer {}

impl UniformBuffer {
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `size` bytes and the memory must not be written
    /// to while a job using this buffer executes.
    pub unsafe fn from_raw_parts(ptr: *const u8, size: usize) -> Self {
        assert!(!ptr.is_null(), "Null uniform buffer");
        UniformBuffer {
            ptr: NonNull::new_unchecked(ptr as *mut u8),
            size,
        }
    }

    /// # Safety
    ///
    /// See `from_raw_parts`.
    pub unsafe fn from_slice<T: bytemuck::Pod>(data: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::from_raw_parts(bytes.as_ptr(), bytes.len())
    }

    /// # Safety
    ///
    /// See `from_raw_parts`.
    pub unsafe fn from_value<T: bytemuck::Pod>(value: &T) -> Self {
        let bytes: &[u8] = bytemuck::bytes_of(value);
        Self::from_raw_parts(bytes.as_ptr(), bytes.len())
    }

    pub fn size(&self) -> usize { self.size }

    pub(crate) unsafe fn as_slice<'b>(&self) -> &'b [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.size)
    }
}

/// A buffer cut into fixed-size slices.
///
/// The last slice covers whatever remains after the full ones and may be shorter.
#[derive(Copy, Clone, Debug)]
pub struct SlicedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    slice_size: usize,
}

unsafe impl Send for SlicedBuffer {}
unsafe impl Sync for SlicedBuffer {}

impl SlicedBuffer {
    /// `size` and `slice_size` are in bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads (and writes if the buffer is used as an output) of
    /// `size` bytes for as long as a job using this buffer may execute. Slices of output
    /// buffers must not be accessed by anything else while the job executes.
    pub unsafe fn from_raw_parts(ptr: *mut u8, size: usize, slice_size: usize) -> Self {
        assert!(!ptr.is_null(), "Null sliced buffer");
        assert!(slice_size > 0, "Slice size must be greater than zero");
        SlicedBuffer {
            ptr: NonNull::new_unchecked(ptr),
            size,
            slice_size,
        }
    }

    /// An input buffer made of `items_per_slice` elements per slice.
    ///
    /// # Safety
    ///
    /// See `from_raw_parts`. The buffer must only be used as an input.
    pub unsafe fn input<T: bytemuck::Pod>(data: &[T], items_per_slice: usize) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self::from_raw_parts(
            bytes.as_ptr() as *mut u8,
            bytes.len(),
            items_per_slice * std::mem::size_of::<T>(),
        )
    }

    /// An output buffer made of `items_per_slice` elements per slice.
    ///
    /// # Safety
    ///
    /// See `from_raw_parts`.
    pub unsafe fn output<T: bytemuck::Pod>(data: &mut [T], items_per_slice: usize) -> Self {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
        Self::from_raw_parts(
            bytes.as_mut_ptr(),
            bytes.len(),
            items_per_slice * std::mem::size_of::<T>(),
        )
    }

    pub fn size(&self) -> usize { self.size }

    pub fn slice_size(&self) -> usize { self.slice_size }

    /// Number of slices needed to cover the whole buffer.
    pub fn num_slices(&self) -> usize {
        (self.size + self.slice_size - 1) / self.slice_size
    }

    /// Byte range covered by a slice, clamped to the end of the buffer.
    ///
    /// Slices past the end of the buffer are empty.
    pub fn slice_range(&self, slice_index: u32) -> Range<usize> {
        let start = (slice_index as usize * self.slice_size).min(self.size);
        let end = (start + self.slice_size).min(self.size);

        start..end
    }

    pub(crate) unsafe fn slice<'b>(&self, slice_index: u32) -> &'b [u8] {
        let range = self.slice_range(slice_index);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(range.start), range.end - range.start)
    }

    pub(crate) unsafe fn slice_mut<'b>(&self, slice_index: u32) -> &'b mut [u8] {
        let range = self.slice_range(slice_index);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(range.start), range.end - range.start)
    }
}

/// Read-only data shared by all slices of a job.
#[derive(Clone, Debug, Default)]
pub struct UniformDesc {
    pub(crate) buffers: Vec<UniformBuffer>,
    pub(crate) scratch_size: usize,
}

impl UniformDesc {
    pub fn new() -> Self {
        UniformDesc::default()
    }

    pub fn with_buffer(mut self, buffer: UniformBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    /// Request `size` bytes of per-worker scratch memory.
    ///
    /// Scratch memory is not cleared between slices or jobs. Its content is whatever
    /// the previous user on the same worker left there.
    pub fn with_scratch(mut self, size: usize) -> Self {
        self.scratch_size = size;
        self
    }

    pub fn buffers(&self) -> &[UniformBuffer] { &self.buffers }

    pub fn scratch_size(&self) -> usize { self.scratch_size }

    pub(crate) fn validate(&self) {
        assert!(
            self.buffers.len() <= MAX_SLICE_BUFFERS,
            "Too many uniform buffers ({}, max {})",
            self.buffers.len(), MAX_SLICE_BUFFERS,
        );
        assert!(
            self.scratch_size < MAX_SCRATCH_SIZE,
            "Scratch size {} exceeds the limit of {} bytes",
            self.scratch_size, MAX_SCRATCH_SIZE,
        );
    }
}

/// A set of parallel sliced buffers, used for the inputs and outputs of a job.
#[derive(Clone, Debug, Default)]
pub struct BufferDesc {
    pub(crate) buffers: Vec<SlicedBuffer>,
}

pub type InputDesc = BufferDesc;
pub type OutputDesc = BufferDesc;

impl BufferDesc {
    pub fn new() -> Self {
        BufferDesc::default()
    }

    pub fn with_buffer(mut self, buffer: SlicedBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn buffers(&self) -> &[SlicedBuffer] { &self.buffers }

    pub fn num_buffers(&self) -> usize { self.buffers.len() }

    /// The number of slices, as defined by the first buffer.
    pub fn num_slices(&self) -> usize {
        self.buffers.first().map(SlicedBuffer::num_slices).unwrap_or(0)
    }

    pub(crate) fn validate(&self, role: &str) {
        assert!(!self.buffers.is_empty(), "Job has no {} buffer", role);
        assert!(
            self.buffers.len() <= MAX_SLICE_BUFFERS,
            "Too many {} buffers ({}, max {})",
            role, self.buffers.len(), MAX_SLICE_BUFFERS,
        );
    }
}

pub(crate) type WorkFn = dyn Fn(SliceContext) + Send + Sync;
pub(crate) type CompletionFn = dyn Fn() + Send + Sync;

/// The work function of a job and what to do when all of its slices are done.
pub struct JobFunction {
    pub(crate) work: Box<WorkFn>,
    pub(crate) on_complete: Option<Box<CompletionFn>>,
}

impl JobFunction {
    /// The work function is invoked once per slice, from any worker thread.
    pub fn new<F>(work: F) -> Self
    where F: Fn(SliceContext) + Send + Sync + 'static
    {
        JobFunction {
            work: Box::new(work),
            on_complete: None,
        }
    }

    /// Run `callback` each time a submission of the job completes.
    ///
    /// The callback runs on the thread that finishes the last slice, before waiting
    /// threads are released.
    pub fn with_completion_callback<F>(mut self, callback: F) -> Self
    where F: Fn() + Send + Sync + 'static
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for JobFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("JobFunction")
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

#[test]
fn test_partial_last_slice() {
    let mut data = vec![0u32; 100];
    let buffer = unsafe { SlicedBuffer::output(&mut data, 8) };

    assert_eq!(buffer.size(), 400);
    assert_eq!(buffer.slice_size(), 32);
    assert_eq!(buffer.num_slices(), 13);
    assert_eq!(buffer.slice_range(0), 0..32);
    assert_eq!(buffer.slice_range(11), 352..384);
    assert_eq!(buffer.slice_range(12), 384..400);
    // Past the end.
    assert_eq!(buffer.slice_range(13), 400..400);
}

#[test]
fn test_slices_cover_buffer() {
    for size in [0usize, 1, 7, 64, 100, 1000, 4093] {
        for slice_size in [1usize, 3, 16, 64, 5000] {
            let mut data = vec![0u8; size.max(1)];
            let buffer = unsafe { SlicedBuffer::from_raw_parts(data.as_mut_ptr(), size, slice_size) };

            let num_slices = buffer.num_slices();
            assert_eq!(num_slices, (size + slice_size - 1) / slice_size);

            let mut expected_start = 0;
            for i in 0..num_slices {
                let range = buffer.slice_range(i as u32);
                assert_eq!(range.start, expected_start);
                assert!(range.end > range.start);
                assert!(range.end - range.start <= slice_size);
                expected_start = range.end;
            }
            assert_eq!(expected_start, size);

            if num_slices > 0 {
                let last = buffer.slice_range(num_slices as u32 - 1);
                assert_eq!(last.end - last.start, size - (num_slices - 1) * slice_size);
            }
        }
    }
}

#[test]
fn test_desc_slice_count_from_first_buffer() {
    let a = vec![0f32; 50];
    let b = vec![0u8; 7];

    let desc = unsafe {
        BufferDesc::new()
            .with_buffer(SlicedBuffer::input(&a, 10))
            .with_buffer(SlicedBuffer::input(&b, 1))
    };

    assert_eq!(desc.num_buffers(), 2);
    assert_eq!(desc.num_slices(), 5);
    assert_eq!(BufferDesc::new().num_slices(), 0);
}

#[test]
#[should_panic]
fn test_zero_slice_size() {
    let mut data = vec![0u8; 16];
    let _ = unsafe { SlicedBuffer::from_raw_parts(data.as_mut_ptr(), 16, 0) };
}

#[test]
#[should_panic]
fn test_scratch_too_large() {
    UniformDesc::new().with_scratch(MAX_SCRATCH_SIZE).validate();
}
