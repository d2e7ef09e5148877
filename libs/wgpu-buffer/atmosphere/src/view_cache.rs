// This file is part of Nitrogen.
//
// Nitrogen is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Nitrogen is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Nitrogen.  If not, see <http://www.gnu.org/licenses/>.
use crate::{
    error::SkyLutError,
    keys::{combine, compute_descriptor_key, CacheKey},
    shared_cache::{reallocate_if_needed, LutTarget},
};
use anyhow::{ensure, Result};
use gpu::{ComputeBackend, TextureDesc, TextureHandle};
use log::trace;
use std::{collections::HashMap, fmt};

/// Host-assigned identity of a view. Stable for as long as the view exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ViewLut {
    pub sky_view: TextureHandle,
    pub key: CacheKey,
    pub needs_update: bool,
}

#[derive(Debug, Default)]
struct ViewEntry {
    sky_view: Option<LutTarget>,
    key: Option<CacheKey>,
    descriptor_key: Option<CacheKey>,
    valid: bool,
    last_used_frame: u64,
}

/// A view used anywhere in the last two sweep intervals must survive the
/// sweep.
pub(crate) fn check_retention(keep_frames: u64, sweep_interval: u64) -> Result<()> {
    ensure!(sweep_interval >= 1, "sweep interval must be at least one frame");
    ensure!(
        keep_frames >= 2 * sweep_interval,
        "keep frames ({}) must be at least twice the sweep interval ({})",
        keep_frames,
        sweep_interval
    );
    Ok(())
}

/// One sky-view table per view, swept periodically for views that have
/// stopped rendering.
#[derive(Debug)]
pub struct ViewLutCache {
    entries: HashMap<ViewId, ViewEntry>,
    keep_frames: u64,
    sweep_interval: u64,
    last_sweep_frame: u64,
}

impl ViewLutCache {
    pub fn new(keep_frames: u64, sweep_interval: u64) -> Result<Self> {
        check_retention(keep_frames, sweep_interval)?;
        Ok(Self {
            entries: HashMap::new(),
            keep_frames,
            sweep_interval,
            last_sweep_frame: 0,
        })
    }

    /// Allocate or reuse the table for `view` and decide whether it must be
    /// recomputed. Marks the view as used in `current_frame` whatever the
    /// outcome.
    pub fn resolve(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        view: ViewId,
        view_key: CacheKey,
        desc: &TextureDesc,
        current_frame: u64,
    ) -> Result<ViewLut, SkyLutError> {
        let entry = self.entries.entry(view).or_default();
        entry.last_used_frame = current_frame;

        let descriptor_key = compute_descriptor_key(desc);
        let label = format!("sky-view-lut-{}", view.0);
        let sky_view = match reallocate_if_needed(gpu, &mut entry.sky_view, desc, &label) {
            Ok(texture) => texture,
            Err(err) => {
                entry.valid = false;
                return Err(err);
            }
        };

        if entry.descriptor_key != Some(descriptor_key) {
            entry.valid = false;
            entry.descriptor_key = Some(descriptor_key);
        }

        let key = combine(view_key, descriptor_key);
        let needs_update = !entry.valid || entry.key != Some(key);
        if needs_update {
            trace!("{} stale; new key {}", view, key);
            entry.key = Some(key);
            entry.valid = true;
        }

        Ok(ViewLut {
            sky_view,
            key,
            needs_update,
        })
    }

    /// The current table for `view`, if it holds valid contents.
    pub fn get(&self, view: ViewId) -> Option<ViewLut> {
        let entry = self.entries.get(&view)?;
        match (entry.valid, entry.sky_view, entry.key) {
            (true, Some(target), Some(key)) => Some(ViewLut {
                sky_view: target.texture,
                key,
                needs_update: false,
            }),
            _ => None,
        }
    }

    pub fn invalidate(&mut self, view: ViewId) {
        if let Some(entry) = self.entries.get_mut(&view) {
            entry.valid = false;
        }
    }

    /// Run an eviction sweep if a full interval has passed since the last
    /// one. Returns the number of views evicted.
    pub fn maybe_evict(&mut self, gpu: &mut dyn ComputeBackend, current_frame: u64) -> usize {
        if current_frame.saturating_sub(self.last_sweep_frame) < self.sweep_interval {
            return 0;
        }
        self.last_sweep_frame = current_frame;
        self.evict_idle(gpu, current_frame)
    }

    fn evict_idle(&mut self, gpu: &mut dyn ComputeBackend, current_frame: u64) -> usize {
        let keep_frames = self.keep_frames;
        let idle = self
            .entries
            .iter()
            .filter(|(_, entry)| current_frame.saturating_sub(entry.last_used_frame) > keep_frames)
            .map(|(view, _)| *view)
            .collect::<Vec<ViewId>>();
        for view in &idle {
            if let Some(entry) = self.entries.remove(view) {
                trace!("evicting idle {}", view);
                if let Some(target) = entry.sky_view {
                    gpu.release_texture(target.texture);
                }
            }
        }
        idle.len()
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.entries.contains_key(&view)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn release(&mut self, gpu: &mut dyn ComputeBackend) {
        for (_, entry) in self.entries.drain() {
            if let Some(target) = entry.sky_view {
                gpu.release_texture(target.texture);
            }
        }
        self.last_sweep_frame = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;
    use gpu::{RecordingBackend, TextureFormat};

    const KEEP: u64 = 300;
    const SWEEP: u64 = 60;

    fn desc() -> TextureDesc {
        TextureDesc::storage(256, 128, TextureFormat::Rgba32Float)
    }

    #[test]
    fn test_rejects_short_retention() {
        assert!(ViewLutCache::new(100, 60).is_err());
        assert!(ViewLutCache::new(300, 0).is_err());
        assert!(ViewLutCache::new(120, 60).is_ok());
    }

    #[test]
    fn test_resolve_is_idempotent() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        let key = CacheKey::from_raw(1);

        let first = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 0)?;
        assert!(first.needs_update);
        let second = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 0)?;
        assert!(!second.needs_update);
        assert_eq!(first.sky_view, second.sky_view);
        assert_eq!(cache.get(ViewId(1)), Some(second));
        Ok(())
    }

    #[test]
    fn test_views_are_independent() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        let key = CacheKey::from_raw(1);

        let a = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 0)?;
        let b = cache.resolve(&mut gpu, ViewId(2), key, &desc(), 0)?;
        assert!(a.needs_update && b.needs_update);
        assert_ne!(a.sky_view, b.sky_view);

        let a = cache.resolve(&mut gpu, ViewId(1), CacheKey::from_raw(2), &desc(), 1)?;
        let b = cache.resolve(&mut gpu, ViewId(2), key, &desc(), 1)?;
        assert!(a.needs_update);
        assert!(!b.needs_update);
        Ok(())
    }

    #[test]
    fn test_descriptor_change_forces_update() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        let key = CacheKey::from_raw(1);

        let first = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 0)?;
        let smaller = TextureDesc::storage(128, 64, TextureFormat::Rgba32Float);
        let second = cache.resolve(&mut gpu, ViewId(1), key, &smaller, 1)?;
        assert!(second.needs_update);
        assert_eq!(gpu.released_textures(), &[first.sky_view]);
        Ok(())
    }

    #[test]
    fn test_sweep_is_periodic() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        cache.resolve(&mut gpu, ViewId(1), CacheKey::from_raw(1), &desc(), 0)?;

        assert_eq!(cache.maybe_evict(&mut gpu, 59), 0);
        // Sweeps at 60 and 300 find the view idle, but not past the window.
        assert_eq!(cache.maybe_evict(&mut gpu, 60), 0);
        assert_eq!(cache.maybe_evict(&mut gpu, 300), 0);
        // Past the window now, but the next sweep is not due yet.
        assert_eq!(cache.maybe_evict(&mut gpu, 301), 0);
        assert!(cache.contains(ViewId(1)));
        assert_eq!(cache.maybe_evict(&mut gpu, 360), 1);
        assert!(!cache.contains(ViewId(1)));
        Ok(())
    }

    #[test]
    fn test_evicts_idle_views_exactly_once() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        let key = CacheKey::from_raw(1);

        let idle = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 0)?;
        let mut evicted = 0;
        for frame in 0..=720 {
            evicted += cache.maybe_evict(&mut gpu, frame);
            cache.resolve(&mut gpu, ViewId(2), key, &desc(), frame)?;
            if frame < 360 {
                assert!(cache.contains(ViewId(1)), "frame {}", frame);
            }
        }
        assert_eq!(evicted, 1);
        assert_eq!(gpu.released_textures(), &[idle.sky_view]);
        assert!(cache.contains(ViewId(2)));
        assert_eq!(cache.len(), 1);

        // A returning view starts from scratch.
        let back = cache.resolve(&mut gpu, ViewId(1), key, &desc(), 721)?;
        assert!(back.needs_update);
        Ok(())
    }

    #[test]
    fn test_recently_used_survives_sweep() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        cache.resolve(&mut gpu, ViewId(1), CacheKey::from_raw(1), &desc(), 60)?;
        assert_eq!(cache.maybe_evict(&mut gpu, 360), 0);
        assert_eq!(cache.maybe_evict(&mut gpu, 420), 1);
        Ok(())
    }

    #[test]
    fn test_allocation_failure_invalidates() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        let key = CacheKey::from_raw(1);
        gpu.set_fail_allocations(true);
        assert!(cache.resolve(&mut gpu, ViewId(1), key, &desc(), 5).is_err());
        assert!(cache.get(ViewId(1)).is_none());
        // Still counts as used.
        assert!(cache.contains(ViewId(1)));

        gpu.set_fail_allocations(false);
        assert!(cache.resolve(&mut gpu, ViewId(1), key, &desc(), 6)?.needs_update);
        Ok(())
    }

    #[test]
    fn test_release_all() -> Result<()> {
        let mut gpu = RecordingBackend::new();
        let mut cache = ViewLutCache::new(KEEP, SWEEP)?;
        for view in 0..4 {
            cache.resolve(&mut gpu, ViewId(view), CacheKey::from_raw(1), &desc(), 0)?;
        }
        cache.release(&mut gpu);
        assert!(cache.is_empty());
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.released_textures().len(), 4);
        Ok(())
    }
}
