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
use crate::backend::{ReadbackId, ReadbackStatus};
use log::trace;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

type MapResult = Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>;

struct PendingReadback {
    staging: wgpu::Buffer,
    // None until the copy into `staging` has been submitted.
    mapped: Option<MapResult>,
}

/// Tracks staging buffers from the moment a copy is recorded until the
/// mapped bytes are handed back to the caller.
#[derive(Default)]
pub(crate) struct ReadbackTracker {
    next_id: u32,
    pending: HashMap<ReadbackId, PendingReadback>,
}

impl ReadbackTracker {
    pub(crate) fn enqueue(&mut self, staging: wgpu::Buffer) -> ReadbackId {
        let id = ReadbackId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(
            id,
            PendingReadback {
                staging,
                mapped: None,
            },
        );
        id
    }

    /// Must be called after the copies recorded by `enqueue` have been
    /// submitted to the queue.
    pub(crate) fn start_mapping(&mut self) {
        for (id, pending) in self.pending.iter_mut() {
            if pending.mapped.is_some() {
                continue;
            }
            trace!("mapping {}", id);
            let result: MapResult = Arc::new(Mutex::new(None));
            let signal = result.clone();
            pending
                .staging
                .slice(..)
                .map_async(wgpu::MapMode::Read, move |outcome| {
                    *signal.lock() = Some(outcome);
                });
            pending.mapped = Some(result);
        }
    }

    pub(crate) fn poll(&mut self, id: ReadbackId) -> ReadbackStatus {
        let outcome = match self.pending.get(&id) {
            None => return ReadbackStatus::Failed(format!("unknown {}", id)),
            Some(PendingReadback { mapped: None, .. }) => return ReadbackStatus::InFlight,
            Some(PendingReadback {
                mapped: Some(result),
                ..
            }) => result.lock().take(),
        };
        let outcome = match outcome {
            None => return ReadbackStatus::InFlight,
            Some(outcome) => outcome,
        };
        let pending = match self.pending.remove(&id) {
            Some(pending) => pending,
            None => return ReadbackStatus::Failed(format!("unknown {}", id)),
        };
        match outcome {
            Err(err) => ReadbackStatus::Failed(err.to_string()),
            Ok(()) => {
                let bytes = {
                    let view = pending.staging.slice(..).get_mapped_range();
                    view.to_vec()
                };
                pending.staging.unmap();
                ReadbackStatus::Complete(bytes)
            }
        }
    }

    /// Forget `id`. A mapping still in progress resolves against a dropped
    /// buffer and is ignored.
    pub(crate) fn cancel(&mut self, id: ReadbackId) -> bool {
        let cancelled = self.pending.remove(&id).is_some();
        if cancelled {
            trace!("cancelled {}", id);
        }
        cancelled
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
