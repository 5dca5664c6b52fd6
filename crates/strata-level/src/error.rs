use std::fmt::Display;
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError, UnabortableTransactionError};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("item {item:?} has no column {column:?}")]
    MissingColumn { item: String, column: String },
    #[error("column {0:?} was declared more than once")]
    DuplicateColumn(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage engine failure: {0}")]
    Engine(#[from] sled::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("storage item was used after it was closed")]
    Closed,
    #[error("transaction was invalidated by a concurrent modification")]
    TransactionFailed,
    #[error("storage item {0:?} is already open")]
    AlreadyOpen(String),
    #[error("no storage item named {0:?}")]
    NoSuchItem(String),
    #[error("{0} storage items are still open")]
    ItemsStillOpen(usize),
    #[error("column does not belong to this storage item")]
    InvalidColumn,
    #[error("corrupt manifest: {0}")]
    Corrupt(String),
    #[error("failed to construct the storage item's owner: {0}")]
    Construct(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A sled transaction hit a conflict and will be retried. Never escapes a transaction.
    #[doc(hidden)]
    #[error("transaction conflict")]
    Conflict,
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StoreError::Engine(e),
        }
    }
}

impl From<UnabortableTransactionError> for StoreError {
    fn from(e: UnabortableTransactionError) -> Self {
        match e {
            UnabortableTransactionError::Conflict => StoreError::Conflict,
            UnabortableTransactionError::Storage(e) => StoreError::Engine(e),
        }
    }
}

impl From<strata_core::ArchiveError> for StoreError {
    fn from(e: strata_core::ArchiveError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl StoreError {
    /// Maps an error raised inside a sled transaction closure back onto sled's retry protocol.
    pub(crate) fn into_conflictable(self) -> ConflictableTransactionError<StoreError> {
        match self {
            StoreError::Conflict => ConflictableTransactionError::Conflict,
            StoreError::Engine(e) => ConflictableTransactionError::Storage(e),
            e => ConflictableTransactionError::Abort(e),
        }
    }
}

/// Why a tile request failed. Cloned out to every waiter of the same in-flight request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TileError {
    #[error("tile has not been generated and generation is not allowed")]
    GenerationNotAllowed,
    #[error("tile position is outside of the level bounds")]
    OutOfBounds,
    #[error("storage failure: {0}")]
    Storage(Arc<StoreError>),
    #[error("generation failed: {0}")]
    Generation(Arc<str>),
    #[error("failed to parse tile bytes: {0}")]
    Parse(Arc<str>),
    #[error("tile worker panicked")]
    WorkerPanicked,
    #[error("tile cache was closed")]
    Closed,
}

impl From<StoreError> for TileError {
    fn from(e: StoreError) -> Self {
        TileError::Storage(Arc::new(e))
    }
}

impl From<strata_core::TaskAborted> for TileError {
    fn from(_: strata_core::TaskAborted) -> Self {
        TileError::WorkerPanicked
    }
}

impl TileError {
    pub fn generation(e: impl Display) -> Self {
        TileError::Generation(e.to_string().into())
    }

    pub fn parse(e: impl Display) -> Self {
        TileError::Parse(e.to_string().into())
    }

    /// The expected "no data and generation disabled" outcome, as opposed to an actual failure.
    pub fn is_generation_not_allowed(&self) -> bool {
        matches!(self, TileError::GenerationNotAllowed)
    }
}

/// Why a level layer failed to open.
#[derive(Debug, thiserror::Error)]
pub enum LevelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to start tile workers: {0}")]
    Spawn(#[from] std::io::Error),
}
