//! Render target pool
//!
//! Recycles render targets between passes and frames. Buffers are keyed by
//! their [`RenderTargetDescription`]; a buffer is owned by at most one live
//! [`PooledTarget`] at a time.

use std::collections::HashMap;

use crate::backend::*;
use crate::render_graph::RenderTargetDescription;

/// A render target currently checked out of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PooledTarget {
    texture: TextureHandle,
    description: RenderTargetDescription,
}

impl PooledTarget {
    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn description(&self) -> &RenderTargetDescription {
        &self.description
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeEntry {
    texture: TextureHandle,
    released_frame: u64,
}

/// Counters describing pool behaviour since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub recycled: u64,
    pub destroyed: u64,
}

/// Pool of reusable render targets
#[derive(Debug)]
pub struct RenderTargetPool {
    free: HashMap<RenderTargetDescription, Vec<FreeEntry>>,
    live: HashMap<TextureHandle, RenderTargetDescription>,
    frame: u64,
    max_idle_frames: u64,
    stats: PoolStats,
}

impl RenderTargetPool {
    pub fn new(max_idle_frames: u32) -> Self {
        Self {
            free: HashMap::new(),
            live: HashMap::new(),
            frame: 0,
            max_idle_frames: max_idle_frames as u64,
            stats: PoolStats::default(),
        }
    }

    /// Check out a buffer matching `description`, reusing the most recently released one.
    pub fn acquire<B: GraphicsBackend>(
        &mut self,
        description: &RenderTargetDescription,
        label: &str,
        backend: &mut B,
    ) -> BackendResult<PooledTarget> {
        if let Some(entry) = self.free.get_mut(description).and_then(|list| list.pop()) {
            self.stats.recycled += 1;
            self.live.insert(entry.texture, *description);
            log::trace!(
                "Pool: recycled texture #{} for '{}'",
                entry.texture.raw(),
                label
            );
            return Ok(PooledTarget {
                texture: entry.texture,
                description: *description,
            });
        }

        let texture = backend.create_texture(&description.texture_descriptor(label))?;
        self.stats.created += 1;
        self.live.insert(texture, *description);
        log::trace!("Pool: created texture #{} for '{}'", texture.raw(), label);
        Ok(PooledTarget {
            texture,
            description: *description,
        })
    }

    /// Start `frame`; buffers released from now on count as used in it.
    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
    }

    /// Return a buffer to the pool. Releasing a target twice is ignored.
    pub fn release(&mut self, target: PooledTarget) {
        if self.live.remove(&target.texture).is_none() {
            log::warn!(
                "Pool: texture #{} released but not checked out",
                target.texture.raw()
            );
            return;
        }
        self.free
            .entry(target.description)
            .or_default()
            .push(FreeEntry {
                texture: target.texture,
                released_frame: self.frame,
            });
    }

    /// Finish `frame` and destroy buffers left unused for more than the idle limit.
    pub fn end_frame<B: GraphicsBackend>(&mut self, frame: u64, backend: &mut B) {
        self.frame = frame;
        let max_idle = self.max_idle_frames;
        let mut destroyed = 0;
        for list in self.free.values_mut() {
            list.retain(|entry| {
                let keep = frame.saturating_sub(entry.released_frame) <= max_idle;
                if !keep {
                    backend.destroy_texture(entry.texture);
                    destroyed += 1;
                }
                keep
            });
        }
        self.free.retain(|_, list| !list.is_empty());
        if destroyed > 0 {
            log::debug!("Pool: destroyed {} idle render targets", destroyed);
        }
        self.stats.destroyed += destroyed;
    }

    /// Destroy every pooled buffer. Checked-out targets are destroyed as well.
    pub fn clear<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for (_, list) in self.free.drain() {
            for entry in list {
                backend.destroy_texture(entry.texture);
                self.stats.destroyed += 1;
            }
        }
        for (texture, _) in self.live.drain() {
            backend.destroy_texture(texture);
            self.stats.destroyed += 1;
        }
    }

    /// Drop every handle without touching the backend, after the device that owned them was lost.
    pub fn forget_all(&mut self) {
        self.free.clear();
        self.live.clear();
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32) -> RenderTargetDescription {
        RenderTargetDescription::new(width, 64, TextureFormat::Rgba8Unorm)
    }

    #[test]
    fn test_acquire_release_acquire_returns_same_buffer() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(3);

        let first = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        pool.release(first);
        let second = pool.acquire(&desc(64), "b", &mut backend).unwrap();

        assert_eq!(first.texture(), second.texture());
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().recycled, 1);
    }

    #[test]
    fn test_live_targets_are_never_shared() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(3);

        let a = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        let b = pool.acquire(&desc(64), "b", &mut backend).unwrap();
        assert_ne!(a.texture(), b.texture());
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn test_different_descriptions_do_not_mix() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(3);

        let a = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        pool.release(a);
        let b = pool.acquire(&desc(128), "b", &mut backend).unwrap();
        assert_ne!(a.texture(), b.texture());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_idle_buffers_are_destroyed() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(2);

        let a = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        pool.release(a);
        pool.end_frame(2, &mut backend);
        assert_eq!(pool.free_count(), 1);
        pool.end_frame(3, &mut backend);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(backend.live_texture_count(), 0);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn test_idle_count_starts_at_release_frame() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(2);
        pool.end_frame(4, &mut backend);

        pool.begin_frame(5);
        let a = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        pool.release(a);
        for frame in 5..=7 {
            pool.end_frame(frame, &mut backend);
            assert_eq!(pool.free_count(), 1, "destroyed after frame {frame}");
        }
        pool.end_frame(8, &mut backend);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let mut backend = RecordingBackend::new().with_texture_budget(0);
        let mut pool = RenderTargetPool::new(2);
        assert_eq!(
            pool.acquire(&desc(64), "a", &mut backend),
            Err(BackendError::OutOfMemory)
        );
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut backend = RecordingBackend::new();
        let mut pool = RenderTargetPool::new(2);
        let a = pool.acquire(&desc(64), "a", &mut backend).unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.free_count(), 1);
    }
}
