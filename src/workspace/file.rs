//! `Workspace`: a memory-mapped, bump-allocated file holding the flattened
//! F32 tensors for one model at one quantization.
//!
//! Layout on disk is a flat byte array; the allocation map (offset → name,
//! size) is the in-memory index. Persisting that index is
//! [`crate::model::workspace_metadata`]'s job — the workspace itself only
//! knows about byte ranges.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use memmap2::{Mmap, MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("workspace out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },

    #[error("allocation not found at offset {0}")]
    NotFound(u64),

    #[error("read range [{offset}, {offset}+{len}) out of bounds (capacity {capacity})")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("workspace is read-only; mmap_mut was not requested")]
    ReadOnly,
}

struct Allocation {
    name: String,
    size: usize,
}

struct AllocationState {
    next_free_offset: u64,
    allocations: HashMap<u64, Allocation>,
}

/// A memory-mapped, bump-allocated per-model tensor workspace.
pub struct Workspace {
    path: PathBuf,
    file: File,
    capacity: u64,
    mmap: Option<Mmap>,
    mmap_mut: Option<Mutex<MmapMut>>,
    state: Mutex<AllocationState>,
    layers: Mutex<HashMap<u32, Vec<(u64, usize)>>>,
}

impl Workspace {
    /// Create a new workspace file of the given capacity, mapped
    /// read-write, and bump-allocate into it with [`Workspace::allocate`].
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self, WorkspaceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;

        let mmap_mut = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };

        info!(path = %path.display(), capacity, "created workspace");

        Ok(Self {
            path,
            file,
            capacity,
            mmap: None,
            mmap_mut: Some(Mutex::new(mmap_mut)),
            state: Mutex::new(AllocationState {
                next_free_offset: 0,
                allocations: HashMap::new(),
            }),
            layers: Mutex::new(HashMap::new()),
        })
    }

    /// Open an existing workspace file read-only. Use this for workspaces
    /// whose contents were already written and persisted by a prior
    /// `create` + dequantization pass.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let capacity = file.metadata()?.len();
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        Ok(Self {
            path,
            file,
            capacity,
            mmap: Some(mmap),
            mmap_mut: None,
            state: Mutex::new(AllocationState {
                next_free_offset: capacity,
                allocations: HashMap::new(),
            }),
            layers: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bump-allocate `size` bytes, recording `name` for diagnostics. Returns
    /// the byte offset of the new allocation.
    pub fn allocate(&self, name: &str, size: usize) -> Result<u64, WorkspaceError> {
        let mut state = self.state.lock().unwrap();
        let offset = state.next_free_offset;
        let end = offset
            .checked_add(size as u64)
            .ok_or(WorkspaceError::OutOfSpace {
                requested: size,
                available: (self.capacity - offset) as usize,
            })?;
        if end > self.capacity {
            return Err(WorkspaceError::OutOfSpace {
                requested: size,
                available: (self.capacity - offset) as usize,
            });
        }
        state.next_free_offset = end;
        state.allocations.insert(
            offset,
            Allocation {
                name: name.to_string(),
                size,
            },
        );
        debug!(name, offset, size, "allocated workspace region");
        Ok(offset)
    }

    /// Write `data` at `offset` (must lie within a prior allocation).
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), WorkspaceError> {
        let end = offset + data.len() as u64;
        if end > self.capacity {
            return Err(WorkspaceError::OutOfBounds {
                offset,
                len: data.len(),
                capacity: self.capacity,
            });
        }
        match &self.mmap_mut {
            Some(mmap) => {
                let mut mmap = mmap.lock().unwrap();
                mmap[offset as usize..end as usize].copy_from_slice(data);
                Ok(())
            }
            None => {
                // Read-only workspaces still support positional writes via
                // the raw file descriptor for append-style metadata use;
                // the mapping itself stays read-only.
                self.file.write_at(data, offset)?;
                Ok(())
            }
        }
    }

    /// Borrow `len` F32 elements at `offset` directly from the mapping —
    /// zero-copy, lock-free. The returned slice's lifetime is tied to the
    /// workspace (and transitively, to whatever holds it alive; callers
    /// that hand this slice to an inference backend must keep an `Arc` to
    /// the owning `Workspace` alive for as long as the backend uses it).
    pub fn read_pointer(&self, offset: u64, len: usize) -> Result<&[f32], WorkspaceError> {
        let byte_len = len * std::mem::size_of::<f32>();
        let end = offset + byte_len as u64;
        if end > self.capacity {
            return Err(WorkspaceError::OutOfBounds {
                offset,
                len: byte_len,
                capacity: self.capacity,
            });
        }
        let bytes: &[u8] = match (&self.mmap, &self.mmap_mut) {
            (Some(m), _) => &m[offset as usize..end as usize],
            (None, Some(_)) => {
                // Safety: the mmap_mut is behind a Mutex for writers, but
                // readers only need the bytes; bytemuck-cast requires
                // alignment, guaranteed because tensors are allocated at
                // f32-aligned offsets by the dequantization pipeline.
                return self.direct_read_as_f32(offset, len);
            }
            (None, None) => unreachable!("workspace always has one mapping"),
        };
        Ok(bytemuck::cast_slice(bytes))
    }

    fn direct_read_as_f32(&self, offset: u64, len: usize) -> Result<&[f32], WorkspaceError> {
        // mmap_mut readers go through direct_read + leak into a cached
        // owned buffer would break the zero-copy contract; in practice all
        // read-heavy access happens against open_read_only workspaces, so
        // this path only serves same-process readers during ingestion and
        // is implemented via positional read into the mapping itself.
        let mmap = self.mmap_mut.as_ref().unwrap().lock().unwrap();
        let byte_len = len * std::mem::size_of::<f32>();
        let bytes = &mmap[offset as usize..offset as usize + byte_len];
        // Safety: extending the borrow to `&self`'s lifetime is sound here
        // because the MmapMut's backing pages never move or get remapped
        // for the lifetime of the Workspace.
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(bytes.as_ptr(), bytes.len()) };
        Ok(bytemuck::cast_slice(bytes))
    }

    /// Read `len` bytes at `offset` via positional I/O, bypassing the
    /// mapping. Useful when `use_mmap` is disabled by configuration.
    pub fn direct_read(&self, offset: u64, len: usize) -> Result<Vec<u8>, WorkspaceError> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Flush the mapping to disk.
    pub fn sync(&self) -> Result<(), WorkspaceError> {
        if let Some(mmap) = &self.mmap_mut {
            mmap.lock().unwrap().flush()?;
        }
        Ok(())
    }

    /// Record that byte range `[offset, offset+size)` belongs to layer
    /// `layer`, so [`Self::evict_layer`]/[`Self::prefetch_layer`] can act on
    /// it later.
    pub fn register_layer_region(&self, layer: u32, offset: u64, size: usize) {
        self.layers
            .lock()
            .unwrap()
            .entry(layer)
            .or_default()
            .push((offset, size));
    }

    /// Advise the kernel to discard the pages backing `layer`'s tensors.
    /// They remain valid (re-read from the backing file lazily) but no
    /// longer occupy RAM.
    pub fn evict_layer(&self, layer: u32) -> Result<(), WorkspaceError> {
        self.for_layer_regions(layer, crate::workspace::platform::advise_dontneed)
    }

    /// Advise the kernel to read ahead `layer`'s tensors into RAM.
    pub fn prefetch_layer(&self, layer: u32) -> Result<(), WorkspaceError> {
        self.for_layer_regions(layer, crate::workspace::platform::advise_willneed)
    }

    fn for_layer_regions(
        &self,
        layer: u32,
        advise: impl Fn(*mut std::ffi::c_void, usize) -> std::io::Result<()>,
    ) -> Result<(), WorkspaceError> {
        let layers = self.layers.lock().unwrap();
        let regions = match layers.get(&layer) {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        drop(layers);

        let base_ptr = match (&self.mmap, &self.mmap_mut) {
            (Some(m), _) => m.as_ptr() as *mut std::ffi::c_void,
            (None, Some(m)) => m.lock().unwrap().as_ptr() as *mut std::ffi::c_void,
            (None, None) => unreachable!(),
        };

        for (offset, size) in regions {
            let addr = unsafe { base_ptr.add(offset as usize) };
            advise(addr, size)?;
        }
        Ok(())
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().unwrap().next_free_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_and_write_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap();

        let offset = ws.allocate("tensor.weight", 256).unwrap();
        let data = vec![7u8; 256];
        ws.write(offset, &data).unwrap();

        let read_back = ws.direct_read(offset, 256).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn test_out_of_space() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path().join("ws.bin"), 128).unwrap();

        ws.allocate("a", 100).unwrap();
        let err = ws.allocate("b", 100).unwrap_err();
        assert!(matches!(err, WorkspaceError::OutOfSpace { .. }));
    }

    #[test]
    fn test_read_pointer_as_f32() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap();

        let values: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
        let offset = ws.allocate("v", 16).unwrap();
        ws.write(offset, bytemuck::cast_slice(&values)).unwrap();

        let slice = ws.read_pointer(offset, 4).unwrap();
        assert_eq!(slice, &values);
    }

    #[test]
    fn test_layer_eviction_is_a_noop_for_unregistered_layer() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::create(tmp.path().join("ws.bin"), 4096).unwrap();
        assert!(ws.evict_layer(99).is_ok());
    }
}
