//! Per-frame uniform ring buffer.
//!
//! One GPU buffer is split into `frames_in_flight` equally sized slots. Frame
//! `N` writes its uniform data into slot `N % frames_in_flight`. A slot is only
//! handed out again after the frame that last used it has been confirmed
//! complete by the backend, so a [`UniformToken`] from frame `N` can never be
//! overwritten while the GPU still reads it.
//!
//! Within a frame, allocation is a bump pointer over a CPU staging copy of the
//! slot. Construction-time tokens (light lists, cluster data) are allocated
//! directly from [`FrameUniforms`]; worker threads recording in parallel get
//! disjoint [`RegionWriter`]s carved out by [`FrameUniforms::reserve_regions`].
//!
//! # Example
//!
//! ```ignore
//! let mut uniforms = ring.begin_frame(frame_index, &mut backend)?;
//! let camera = uniforms.push("Light Shading", &camera_data)?;
//! let upload = ring.end_frame(uniforms);
//! backend.submit(submission_with(upload))?;
//! ring.mark_submitted(frame_index);
//! ```

use bytemuck::Pod;

use crate::backend::*;
use crate::error::{RenderError, Result};

/// An aligned range of the ring buffer owned by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformToken {
    range: BufferRange,
    frame_index: u64,
}

impl UniformToken {
    pub fn range(&self) -> BufferRange {
        self.range
    }

    pub fn offset(&self) -> u64 {
        self.range.offset
    }

    pub fn size(&self) -> u64 {
        self.range.size
    }

    /// Frame the token was allocated for
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }
}

/// Smallest range handed out, so empty lists still bind a valid buffer region.
const MIN_ALLOCATION: u64 = 16;

/// Uniform ring buffer gated by frame completion.
#[derive(Debug)]
pub struct UniformRingBuffer {
    buffer: BufferHandle,
    slot_size: u64,
    alignment: u64,
    /// Last frame submitted from each slot
    slots: Vec<Option<u64>>,
    /// Staging memory reused between frames
    spare: Vec<u8>,
    last_begun: Option<u64>,
}

impl UniformRingBuffer {
    /// Create the ring buffer and its backing GPU buffer.
    ///
    /// `alignment` must be a power of two; `slot_size` is rounded up to it.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        slot_size: u64,
        frames_in_flight: u32,
        alignment: u64,
    ) -> Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(RenderError::InvalidConfig {
                field: "uniform_alignment",
                reason: format!("alignment must be a power of 2, got {alignment}"),
            });
        }
        if slot_size == 0 {
            return Err(RenderError::InvalidConfig {
                field: "uniform_ring_size",
                reason: "ring buffer slot size cannot be zero".to_string(),
            });
        }
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidConfig {
                field: "frames_in_flight",
                reason: "at least one frame must be in flight".to_string(),
            });
        }

        let slot_size = align_up(slot_size, alignment);
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: "uniform_ring".to_string(),
            size: slot_size * frames_in_flight as u64,
            usage: BufferUsage::UNIFORM | BufferUsage::STORAGE | BufferUsage::COPY_DST,
        })?;

        Ok(Self {
            buffer,
            slot_size,
            alignment,
            slots: vec![None; frames_in_flight as usize],
            spare: vec![0; slot_size as usize],
            last_begun: None,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frame currently owning the slot `frame_index` maps to, if any
    pub fn slot_owner(&self, frame_index: u64) -> Option<u64> {
        self.slots[self.slot_of(frame_index)]
    }

    fn slot_of(&self, frame_index: u64) -> usize {
        (frame_index % self.slots.len() as u64) as usize
    }

    /// Start writing uniforms for `frame_index`.
    ///
    /// Waits for the frame that previously used the slot if the backend has not
    /// finished it yet.
    pub fn begin_frame<B: GraphicsBackend>(
        &mut self,
        frame_index: u64,
        backend: &mut B,
    ) -> Result<FrameUniforms> {
        if let Some(last) = self.last_begun {
            if frame_index <= last {
                return Err(RenderError::InvalidConfig {
                    field: "frame_index",
                    reason: format!("frame {frame_index} begun after frame {last}"),
                });
            }
        }

        let slot = self.slot_of(frame_index);
        if let Some(previous) = self.slots[slot] {
            if !backend.is_frame_complete(previous) {
                log::debug!(
                    "Uniform ring slot {} still used by frame {}, waiting",
                    slot,
                    previous
                );
                backend.wait_for_frame(previous)?;
            }
        }

        self.last_begun = Some(frame_index);
        let mut data = std::mem::take(&mut self.spare);
        data.resize(self.slot_size as usize, 0);

        Ok(FrameUniforms {
            frame_index,
            buffer: self.buffer,
            base_offset: slot as u64 * self.slot_size,
            alignment: self.alignment,
            data,
            cursor: 0,
        })
    }

    /// Finish writing and produce the upload for the submission.
    ///
    /// The slot is not considered in flight until [`mark_submitted`](Self::mark_submitted).
    pub fn end_frame(&mut self, uniforms: FrameUniforms) -> UniformUpload {
        let used = uniforms.cursor as usize;
        let upload = UniformUpload {
            buffer: self.buffer,
            offset: uniforms.base_offset,
            data: uniforms.data[..used].to_vec(),
        };
        self.spare = uniforms.data;
        upload
    }

    /// Drop a frame that will never reach the GPU; its slot stays available.
    pub fn abandon_frame(&mut self, uniforms: FrameUniforms) {
        log::trace!("Uniform ring: frame {} abandoned", uniforms.frame_index);
        self.spare = uniforms.data;
    }

    /// Record that `frame_index` was submitted; its slot is reused only after it completes.
    pub fn mark_submitted(&mut self, frame_index: u64) {
        let slot = self.slot_of(frame_index);
        self.slots[slot] = Some(frame_index);
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        backend.destroy_buffer(self.buffer);
    }
}

/// CPU staging view of one frame's ring slot.
#[derive(Debug)]
pub struct FrameUniforms {
    frame_index: u64,
    buffer: BufferHandle,
    base_offset: u64,
    alignment: u64,
    data: Vec<u8>,
    cursor: u64,
}

impl FrameUniforms {
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn remaining(&self) -> u64 {
        self.data.len() as u64 - align_up(self.cursor, self.alignment).min(self.data.len() as u64)
    }

    /// Allocate `size` bytes and return the token with its staging bytes.
    pub fn allocate(&mut self, pass: &str, size: u64) -> Result<(UniformToken, &mut [u8])> {
        let size = size.max(MIN_ALLOCATION);
        let start = align_up(self.cursor, self.alignment);
        let end = start + size;
        if end > self.data.len() as u64 {
            return Err(RenderError::UniformRingExhausted {
                pass: pass.to_string(),
                requested: size,
                available: self.remaining(),
            });
        }
        self.cursor = end;

        let token = UniformToken {
            range: BufferRange {
                buffer: self.buffer,
                offset: self.base_offset + start,
                size,
            },
            frame_index: self.frame_index,
        };
        Ok((token, &mut self.data[start as usize..end as usize]))
    }

    /// Copy one value into the ring.
    pub fn push<T: Pod>(&mut self, pass: &str, value: &T) -> Result<UniformToken> {
        self.push_bytes(pass, bytemuck::bytes_of(value))
    }

    /// Copy a slice of values into the ring.
    pub fn push_slice<T: Pod>(&mut self, pass: &str, values: &[T]) -> Result<UniformToken> {
        self.push_bytes(pass, bytemuck::cast_slice(values))
    }

    fn push_bytes(&mut self, pass: &str, bytes: &[u8]) -> Result<UniformToken> {
        let (token, dst) = self.allocate(pass, bytes.len() as u64)?;
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()..].fill(0);
        Ok(token)
    }

    /// Carve out one private region per request, in request order.
    ///
    /// Regions are disjoint, so each can be handed to a different worker thread.
    pub fn reserve_regions(&mut self, requests: &[(&str, u64)]) -> Result<Vec<RegionWriter<'_>>> {
        let mut bounds = Vec::with_capacity(requests.len());
        let mut cursor = self.cursor;
        for (pass, size) in requests {
            let start = align_up(cursor, self.alignment);
            let end = start + size;
            if end > self.data.len() as u64 {
                return Err(RenderError::UniformRingExhausted {
                    pass: pass.to_string(),
                    requested: *size,
                    available: (self.data.len() as u64).saturating_sub(start),
                });
            }
            bounds.push((start, end));
            cursor = end;
        }
        let first = self.cursor;
        self.cursor = cursor;

        let mut rest = &mut self.data[first as usize..cursor as usize];
        let mut rest_offset = first;
        let mut regions = Vec::with_capacity(requests.len());
        for ((pass, _), (start, end)) in requests.iter().zip(bounds) {
            let skip = (start - rest_offset) as usize;
            let taken = std::mem::take(&mut rest);
            let (_, tail) = taken.split_at_mut(skip);
            let (region, tail) = tail.split_at_mut((end - start) as usize);
            rest = tail;
            rest_offset = end;
            regions.push(RegionWriter {
                pass: pass.to_string(),
                frame_index: self.frame_index,
                buffer: self.buffer,
                base_offset: self.base_offset + start,
                alignment: self.alignment,
                data: region,
                cursor: 0,
            });
        }
        Ok(regions)
    }
}

/// A worker's private slice of a frame's ring slot.
#[derive(Debug)]
pub struct RegionWriter<'a> {
    pass: String,
    frame_index: u64,
    buffer: BufferHandle,
    base_offset: u64,
    alignment: u64,
    data: &'a mut [u8],
    cursor: u64,
}

impl<'a> RegionWriter<'a> {
    /// A region with no space, for passes that need no per-chunk uniforms
    pub fn empty(pass: &str, frame_index: u64, buffer: BufferHandle) -> Self {
        Self {
            pass: pass.to_string(),
            frame_index,
            buffer,
            base_offset: 0,
            alignment: 1,
            data: &mut [],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Copy one value into the region.
    pub fn push<T: Pod>(&mut self, value: &T) -> Result<UniformToken> {
        let bytes = bytemuck::bytes_of(value);
        let size = (bytes.len() as u64).max(MIN_ALLOCATION);
        let start = align_up(self.cursor, self.alignment);
        let end = start + size;
        if end > self.data.len() as u64 {
            return Err(RenderError::UniformRingExhausted {
                pass: self.pass.clone(),
                requested: size,
                available: (self.data.len() as u64).saturating_sub(start),
            });
        }
        let dst = &mut self.data[start as usize..end as usize];
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()..].fill(0);
        self.cursor = end;

        Ok(UniformToken {
            range: BufferRange {
                buffer: self.buffer,
                offset: self.base_offset + start,
                size,
            },
            frame_index: self.frame_index,
        })
    }
}

/// Align a value up to the given alignment.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct Data {
        value: [f32; 4],
    }

    fn ring(backend: &mut RecordingBackend, frames: u32) -> UniformRingBuffer {
        UniformRingBuffer::new(backend, 1024, frames, 64).unwrap()
    }

    #[test]
    fn test_creation_validates_parameters() {
        let mut backend = RecordingBackend::new();
        assert!(UniformRingBuffer::new(&mut backend, 1024, 2, 48).is_err());
        assert!(UniformRingBuffer::new(&mut backend, 0, 2, 64).is_err());
        assert!(UniformRingBuffer::new(&mut backend, 1024, 0, 64).is_err());
    }

    #[test]
    fn test_allocation_alignment() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 2);
        let mut uniforms = ring.begin_frame(0, &mut backend).unwrap();

        let a = uniforms.push("test", &Data { value: [1.0; 4] }).unwrap();
        let b = uniforms.push("test", &Data { value: [2.0; 4] }).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 64);
        assert_eq!(b.size(), 16);
        assert_eq!(a.frame_index(), 0);
    }

    #[test]
    fn test_slots_are_disjoint_between_frames() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 2);

        let mut frame0 = ring.begin_frame(0, &mut backend).unwrap();
        let t0 = frame0.push("test", &Data { value: [0.0; 4] }).unwrap();
        ring.end_frame(frame0);
        ring.mark_submitted(0);

        let mut frame1 = ring.begin_frame(1, &mut backend).unwrap();
        let t1 = frame1.push("test", &Data { value: [0.0; 4] }).unwrap();
        assert_eq!(t0.offset(), 0);
        assert_eq!(t1.offset(), ring.slot_size());
    }

    #[test]
    fn test_slot_reuse_waits_for_completion() {
        let mut backend = RecordingBackend::new().with_manual_completion();
        let mut ring = ring(&mut backend, 2);

        for frame in 0..2 {
            let uniforms = ring.begin_frame(frame, &mut backend).unwrap();
            ring.end_frame(uniforms);
            backend.submit(Submission::new(frame)).unwrap();
            ring.mark_submitted(frame);
        }
        assert_eq!(backend.wait_count(), 0);

        // Frame 2 maps to frame 0's slot, which the GPU has not finished.
        let uniforms = ring.begin_frame(2, &mut backend).unwrap();
        assert_eq!(backend.wait_count(), 1);
        assert!(backend.is_frame_complete(0));
        ring.abandon_frame(uniforms);
    }

    #[test]
    fn test_completed_slot_needs_no_wait() {
        let mut backend = RecordingBackend::new().with_manual_completion();
        let mut ring = ring(&mut backend, 1);
        let uniforms = ring.begin_frame(0, &mut backend).unwrap();
        ring.end_frame(uniforms);
        ring.mark_submitted(0);
        backend.complete_frames_through(0);

        let uniforms = ring.begin_frame(1, &mut backend).unwrap();
        assert_eq!(backend.wait_count(), 0);
        ring.abandon_frame(uniforms);
    }

    #[test]
    fn test_exhaustion_names_pass() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 1);
        let mut uniforms = ring.begin_frame(0, &mut backend).unwrap();
        let error = uniforms.allocate("Light Shading", 2048).unwrap_err();
        assert!(matches!(
            error,
            RenderError::UniformRingExhausted { ref pass, requested: 2048, .. } if pass == "Light Shading"
        ));
    }

    #[test]
    fn test_regions_are_disjoint() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 1);
        let mut uniforms = ring.begin_frame(0, &mut backend).unwrap();
        uniforms.push("setup", &Data { value: [0.0; 4] }).unwrap();

        let mut regions = uniforms
            .reserve_regions(&[("a", 128), ("b", 128)])
            .unwrap();
        let ta = regions[0].push(&Data { value: [1.0; 4] }).unwrap();
        let tb = regions[1].push(&Data { value: [2.0; 4] }).unwrap();
        assert_eq!(ta.offset(), 64);
        assert_eq!(tb.offset(), 192);
        drop(regions);
        assert_eq!(uniforms.used(), 320);
    }

    #[test]
    fn test_region_overflow() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 1);
        let mut uniforms = ring.begin_frame(0, &mut backend).unwrap();
        let mut regions = uniforms.reserve_regions(&[("chunk", 16)]).unwrap();
        regions[0].push(&Data { value: [0.0; 4] }).unwrap();
        assert!(regions[0].push(&Data { value: [0.0; 4] }).is_err());
        drop(regions);
        assert!(uniforms.reserve_regions(&[("huge", 4096)]).is_err());
    }

    #[test]
    fn test_frames_must_advance() {
        let mut backend = RecordingBackend::new();
        let mut ring = ring(&mut backend, 2);
        let uniforms = ring.begin_frame(5, &mut backend).unwrap();
        ring.abandon_frame(uniforms);
        assert!(ring.begin_frame(5, &mut backend).is_err());
    }
}
