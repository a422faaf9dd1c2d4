//! Crate-wide error taxonomy.
//!
//! Every subsystem keeps its own `thiserror` error type close to where the
//! failure happens (see `workspace::file::WorkspaceError`,
//! `model::registry::RegistryError`, `kv::store::CacheStoreError`, ...).
//! `CoreError` is the consolidated type at the application/server boundary,
//! grouping those into the failure classes callers actually need to branch
//! on.

use thiserror::Error;

use crate::kv::context_manager::ContextError;
use crate::kv::store::CacheStoreError;
use crate::model::registry::RegistryError;
use crate::tiered::allocator::AllocatorError as TieredAllocatorError;
use crate::workspace::file::WorkspaceError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("transient error, retry may succeed: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl From<WorkspaceError> for CoreError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::OutOfSpace { .. } => CoreError::CapacityExceeded(e.to_string()),
            WorkspaceError::IoError(inner) => CoreError::IoError(inner),
            WorkspaceError::NotFound(_) => CoreError::NotFound(e.to_string()),
            _ => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => CoreError::NotFound(e.to_string()),
            RegistryError::InvalidState { .. } => CoreError::InvalidInput(e.to_string()),
            RegistryError::Vram(_) => CoreError::CapacityExceeded(e.to_string()),
            RegistryError::Backend(_) => CoreError::BackendError(e.to_string()),
            RegistryError::Workspace(inner) => inner.into(),
        }
    }
}

impl From<TieredAllocatorError> for CoreError {
    fn from(e: TieredAllocatorError) -> Self {
        match e {
            TieredAllocatorError::OutOfMemory { .. } => CoreError::CapacityExceeded(e.to_string()),
            TieredAllocatorError::NotFound(_) => CoreError::NotFound(e.to_string()),
            TieredAllocatorError::InvalidTransition { .. } => {
                CoreError::InvalidInput(e.to_string())
            }
        }
    }
}

impl From<CacheStoreError> for CoreError {
    fn from(e: CacheStoreError) -> Self {
        match e {
            CacheStoreError::NotFound(_) => CoreError::NotFound(e.to_string()),
            CacheStoreError::Integrity(_) => CoreError::IntegrityError(e.to_string()),
            CacheStoreError::Io(inner) => CoreError::IoError(inner),
            CacheStoreError::UnsupportedCodec(_) => CoreError::InvalidInput(e.to_string()),
        }
    }
}

impl From<ContextError> for CoreError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::NotFound(_) => CoreError::NotFound(e.to_string()),
            ContextError::Store(inner) => inner.into(),
            ContextError::Backend(msg) => CoreError::BackendError(msg),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
