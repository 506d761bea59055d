//! Upload heap memory for per-frame CPU writes, and resources kept alive
//! until the GPU is done with them.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{D3d12Backend, HeapType, NativeResource, ResourceDesc, ResourceStates};

/// Resources released once a fence value completes.
#[derive(Debug, Default)]
pub struct TemporaryResources {
    queue: Mutex<VecDeque<(u64, NativeResource)>>,
}

impl TemporaryResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `resource` after `fence_value` completed.
    pub fn enqueue(&self, fence_value: u64, resource: NativeResource) {
        self.queue.lock().push_back((fence_value, resource));
    }

    /// Release every resource whose fence value is at most `completed_value`.
    pub fn release_completed<B: D3d12Backend + ?Sized>(&self, backend: &B, completed_value: u64) -> usize {
        let mut queue = self.queue.lock();
        let mut released = 0;
        while let Some(&(fence, resource)) = queue.front() {
            if fence > completed_value {
                break;
            }
            queue.pop_front();
            backend.release_resource(resource);
            released += 1;
        }
        released
    }

    pub fn release_all<B: D3d12Backend + ?Sized>(&self, backend: &B) {
        for (_, resource) in self.queue.lock().drain(..) {
            backend.release_resource(resource);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Memory handed out by [`UploadAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    pub resource: NativeResource,
    pub offset: u64,
    pub size: u64,
    pub data: *mut u8,
}

#[derive(Debug)]
struct UploadChunk {
    resource: NativeResource,
    // Persistently mapped base address.
    base: usize,
    size: u64,
    offset: u64,
}

/// Bump allocator over persistently mapped upload buffers.
///
/// When a request does not fit, the current chunk is retired to the
/// temporary queue at the next fence value and a chunk of
/// `max(min_chunk_size, size)` bytes replaces it.
#[derive(Debug)]
pub struct UploadAllocator {
    min_chunk_size: u64,
    chunk: Option<UploadChunk>,
}

impl UploadAllocator {
    pub fn new(min_chunk_size: u64) -> Self {
        Self {
            min_chunk_size,
            chunk: None,
        }
    }

    pub fn allocate<B: D3d12Backend + ?Sized>(
        &mut self,
        backend: &B,
        size: u64,
        alignment: u64,
        temporaries: &TemporaryResources,
        next_fence_value: u64,
    ) -> Result<UploadAllocation> {
        let alignment = alignment.max(1);
        let fits = self
            .chunk
            .as_ref()
            .is_some_and(|chunk| chunk.offset.div_ceil(alignment) * alignment + size <= chunk.size);
        if !fits {
            if let Some(old) = self.chunk.take() {
                backend.unmap(old.resource);
                temporaries.enqueue(next_fence_value, old.resource);
            }
            let chunk_size = self.min_chunk_size.max(size);
            let resource = backend
                .create_committed_resource(&ResourceDesc::buffer(chunk_size), HeapType::Upload, ResourceStates::GENERIC_READ)
                .context("creating upload buffer")?;
            let base = backend.map(resource).context("mapping upload buffer")? as usize;
            debug!(size = chunk_size, "new upload buffer chunk");
            self.chunk = Some(UploadChunk {
                resource,
                base,
                size: chunk_size,
                offset: 0,
            });
        }

        let chunk = self
            .chunk
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("upload buffer missing after allocation"))?;
        let offset = chunk.offset.div_ceil(alignment) * alignment;
        chunk.offset = offset + size;
        Ok(UploadAllocation {
            resource: chunk.resource,
            offset,
            size,
            data: (chunk.base + offset as usize) as *mut u8,
        })
    }

    /// Retire the current chunk immediately, for device destruction.
    pub fn release<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        if let Some(chunk) = self.chunk.take() {
            backend.unmap(chunk.resource);
            backend.release_resource(chunk.resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftD3d12;
    use gfx_core::GraphicsProfile;

    fn backend() -> SoftD3d12 {
        let soft = SoftD3d12::new();
        soft.open(GraphicsProfile::Level_11_0, false).unwrap();
        soft
    }

    #[test]
    fn allocations_share_a_chunk_until_full() {
        let soft = backend();
        let temporaries = TemporaryResources::new();
        let mut upload = UploadAllocator::new(1024);

        let a = upload.allocate(&soft, 100, 1, &temporaries, 1).unwrap();
        let b = upload.allocate(&soft, 100, 256, &temporaries, 1).unwrap();
        assert_eq!(a.resource, b.resource);
        assert_eq!((a.offset, b.offset), (0, 256));

        let c = upload.allocate(&soft, 800, 1, &temporaries, 3).unwrap();
        assert_ne!(c.resource, a.resource);
        assert_eq!(c.offset, 0);
        assert_eq!(temporaries.len(), 1);
    }

    #[test]
    fn large_requests_get_a_chunk_of_their_size() {
        let soft = backend();
        let temporaries = TemporaryResources::new();
        let mut upload = UploadAllocator::new(64);
        let big = upload.allocate(&soft, 4096, 1, &temporaries, 1).unwrap();
        assert_eq!(soft.resource_size(big.resource), Some(4096));
    }

    #[test]
    fn temporaries_wait_for_their_fence() {
        let soft = backend();
        let temporaries = TemporaryResources::new();
        let r1 = soft
            .create_committed_resource(&ResourceDesc::buffer(16), HeapType::Upload, ResourceStates::GENERIC_READ)
            .unwrap();
        let r2 = soft
            .create_committed_resource(&ResourceDesc::buffer(16), HeapType::Upload, ResourceStates::GENERIC_READ)
            .unwrap();
        temporaries.enqueue(1, r1);
        temporaries.enqueue(2, r2);

        assert_eq!(temporaries.release_completed(&soft, 1), 1);
        assert!(soft.resource_size(r1).is_none());
        assert!(soft.resource_size(r2).is_some());
        temporaries.release_all(&soft);
        assert!(temporaries.is_empty());
    }
}
