use super::manifest::{
    family_name, read_item_manifest, read_store_manifest, write_item_manifest, write_store_manifest,
};
use super::{generate_ids, transact, StoreShared};
use crate::StoreError;

use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionalTree, Transactional};
use sled::{Batch, IVec, Tree};
use std::fmt;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How many times [`StorageItem::transact_atomic`] retries before giving up.
const MAX_TRANSACTION_ATTEMPTS: usize = 64;

/// A named sub-keyspace of a [`StorageItem`], backed by one column family tree.
///
/// Cheap to clone. All clones refer to the same column, and become unusable once the item is closed.
#[derive(Clone)]
pub struct Column {
    inner: Arc<ColumnInner>,
}

struct ColumnInner {
    name: String,
    family: RwLock<Option<LiveFamily>>,
}

struct LiveFamily {
    name: String,
    tree: Tree,
}

impl Column {
    fn new(name: String, family: String, tree: Tree) -> Self {
        Self {
            inner: Arc::new(ColumnInner {
                name,
                family: RwLock::new(Some(LiveFamily { name: family, tree })),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The column family currently backing this column, or `None` once closed.
    pub fn family_name(&self) -> Option<String> {
        self.inner.family.read().as_ref().map(|f| f.name.clone())
    }

    pub fn ptr_eq(&self, other: &Column) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn tree(&self) -> Result<Tree, StoreError> {
        self.inner
            .family
            .read()
            .as_ref()
            .map(|f| f.tree.clone())
            .ok_or(StoreError::Closed)
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.inner.name)
            .field("family", &self.family_name())
            .finish()
    }
}

/// One logical item of a [`ColumnarStore`](crate::ColumnarStore): a set of columns plus a version token.
///
/// Reads and writes go straight to sled and may run concurrently. Only [`StorageItem::clear_columns`] takes the item
/// lock exclusively; it also bumps a modification counter so [`ItemTransaction`]s that started before the clear fail
/// to commit instead of resurrecting stale data.
pub struct StorageItem {
    name: String,
    inode: u64,
    store: Arc<StoreShared>,
    /// Sorted by name.
    columns: Vec<Column>,
    lock: RwLock<()>,
    modifications: AtomicU64,
    closed: AtomicBool,
}

impl StorageItem {
    pub(crate) fn new(
        name: String,
        inode: u64,
        store: Arc<StoreShared>,
        columns: impl IntoIterator<Item = (String, String, Tree)>,
    ) -> Self {
        let mut columns: Vec<Column> = columns
            .into_iter()
            .map(|(column, family, tree)| Column::new(column, family, tree))
            .collect();
        columns.sort_by(|a, b| a.name().cmp(b.name()));
        Self {
            name,
            inode,
            store,
            columns,
            lock: RwLock::new(()),
            modifications: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Incremented by every successful [`StorageItem::clear_columns`].
    pub fn modification_count(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .binary_search_by(|c| c.name().cmp(name))
            .ok()
            .map(|i| &self.columns[i])
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn tree_of(&self, column: &Column) -> Result<Tree, StoreError> {
        self.ensure_open()?;
        if !self.columns.iter().any(|c| c.ptr_eq(column)) {
            return Err(StoreError::InvalidColumn);
        }
        column.tree()
    }

    pub fn token(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        let inode = self.inode;
        transact(&self.store.manifest, |txn| {
            Ok(read_item_manifest(txn, inode)?.and_then(|m| m.token))
        })
    }

    pub fn set_token(&self, token: &[u8]) -> Result<(), StoreError> {
        self.replace_token(Some(token.to_vec()))
    }

    pub fn remove_token(&self) -> Result<(), StoreError> {
        self.replace_token(None)
    }

    fn replace_token(&self, token: Option<Vec<u8>>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let inode = self.inode;
        transact(&self.store.manifest, |txn| {
            let mut manifest = read_item_manifest(txn, inode)?.ok_or_else(|| {
                StoreError::Corrupt(format!("missing manifest for open item {}", inode))
            })?;
            manifest.token = token.clone();
            write_item_manifest(txn, &manifest)
        })
    }

    /// Plain reads. Each lookup sees the latest committed data, but separate lookups are not isolated from each other.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&ReadView<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        f(&ReadView { item: self })
    }

    /// Reads that observe one consistent state across every column in `columns`. `f` may run more than once.
    pub fn read_atomic<T>(
        &self,
        columns: &[&Column],
        f: impl Fn(&AtomicReadView<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let trees = columns
            .iter()
            .map(|c| self.tree_of(c))
            .collect::<Result<Vec<_>, _>>()?;
        if trees.is_empty() {
            return f(&AtomicReadView {
                columns,
                views: &[],
            });
        }
        trees
            .as_slice()
            .transaction(|views| {
                f(&AtomicReadView {
                    columns,
                    views: views.as_slice(),
                })
                .map_err(StoreError::into_conflictable)
            })
            .map_err(StoreError::from)
    }

    /// Buffers the writes made by `f` and applies all of them, or none of them.
    pub fn write_atomic<T>(
        &self,
        f: impl FnOnce(&mut WriteBatch<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        let mut batch = WriteBatch {
            item: self,
            batches: Vec::new(),
        };
        let out = f(&mut batch)?;

        let _shared = self.lock.read();
        batch.apply()?;
        Ok(out)
    }

    /// Starts an optimistic read-modify-write transaction. See [`ItemTransaction`].
    pub fn begin_transaction(&self) -> Result<ItemTransaction<'_>, StoreError> {
        self.ensure_open()?;
        Ok(ItemTransaction {
            item: self,
            counter: self.modification_count(),
            reads: Vec::new(),
            writes: Vec::new(),
        })
    }

    /// Runs `f` in an [`ItemTransaction`] and commits it, retrying whenever the commit is invalidated.
    pub fn transact_atomic<T>(
        &self,
        mut f: impl FnMut(&mut ItemTransaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let mut txn = self.begin_transaction()?;
            let result = f(&mut txn).and_then(|out| txn.commit().map(|()| out));
            match result {
                Err(StoreError::TransactionFailed) => {
                    log::debug!(
                        "Transaction on item {} invalidated (attempt {}), retrying",
                        self.name,
                        attempt
                    );
                }
                other => return other,
            }
        }
        Err(StoreError::TransactionFailed)
    }

    /// Deletes every key in `columns`.
    ///
    /// Each column is pointed at a fresh column family under the exclusive item lock, and the modification counter is
    /// bumped. The old families are queued for deletion and handed back to the pool, which drops them once
    /// unreferenced.
    pub fn clear_columns(&self, columns: &[&Column]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut targets: Vec<&Column> = Vec::with_capacity(columns.len());
        for &column in columns {
            if !self.columns.iter().any(|c| c.ptr_eq(column)) {
                return Err(StoreError::InvalidColumn);
            }
            if !targets.iter().any(|c| c.ptr_eq(column)) {
                targets.push(column);
            }
        }
        if targets.is_empty() {
            return Ok(());
        }

        let exclusive = self.lock.write();
        self.ensure_open()?;

        let fresh_families: Vec<String> = generate_ids(&self.store.db, targets.len())?
            .into_iter()
            .map(family_name)
            .collect();
        // The new trees are opened before the manifest points at them, so a failure here leaves the item untouched.
        let fresh_trees = self
            .store
            .pool
            .acquire_all(fresh_families.iter().map(String::as_str))?;

        let inode = self.inode;
        let committed = transact(&self.store.manifest, |txn| {
            let mut store = read_store_manifest(txn)?
                .ok_or_else(|| StoreError::Corrupt("missing store manifest".into()))?;
            let mut item = read_item_manifest(txn, inode)?
                .ok_or_else(|| StoreError::Corrupt(format!("missing manifest for open item {}", inode)))?;
            for (column, new) in targets.iter().zip(fresh_families.iter()) {
                let old = item.columns.get(column.name()).cloned().ok_or_else(|| {
                    StoreError::Corrupt(format!("column {} is not in the manifest", column.name()))
                })?;
                store.column_families.insert(new.clone());
                store.discard_family(old);
                item.columns.insert(column.name().to_owned(), new.clone());
            }
            write_store_manifest(txn, &store)?;
            write_item_manifest(txn, &item)?;
            Ok(())
        });
        if let Err(e) = committed {
            for family in fresh_families.iter() {
                self.store.pool.release(family);
                if let Err(drop_error) = self.store.db.drop_tree(family.as_bytes()) {
                    log::warn!("Failed to drop unused column family {}: {}", family, drop_error);
                }
            }
            return Err(e);
        }

        let mut old_families = Vec::with_capacity(targets.len());
        for ((column, name), tree) in targets.iter().zip(fresh_families).zip(fresh_trees) {
            let previous = column
                .inner
                .family
                .write()
                .replace(LiveFamily { name, tree });
            old_families.extend(previous);
        }
        self.modifications.fetch_add(1, Ordering::AcqRel);
        drop(exclusive);

        for old in old_families {
            self.store.pool.release(&old.name);
        }
        if let Err(e) = self.store.pool.drop_unreferenced(&self.store.manifest) {
            log::warn!("Failed to drop replaced column families: {}", e);
        }
        Ok(())
    }

    /// Detaches the item from its store and releases every column family. Columns fail with [`StoreError::Closed`]
    /// from then on. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.unregister(&self.name, self);

        {
            // Wait for in-progress writes and clears.
            let _exclusive = self.lock.write();
            for column in self.columns.iter() {
                if let Some(family) = column.inner.family.write().take() {
                    self.store.pool.release(&family.name);
                }
            }
        }
        log::info!("Closed storage item {}", self.name);
        self.store.pool.drop_unreferenced(&self.store.manifest)?;
        Ok(())
    }
}

impl Drop for StorageItem {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close storage item {}: {}", self.name, e);
        }
    }
}

impl fmt::Debug for StorageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageItem")
            .field("name", &self.name)
            .field("inode", &self.inode)
            .field("columns", &self.columns)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// See [`StorageItem::read`].
pub struct ReadView<'a> {
    item: &'a StorageItem,
}

impl<'a> ReadView<'a> {
    pub fn get(&self, column: &Column, key: impl AsRef<[u8]>) -> Result<Option<IVec>, StoreError> {
        Ok(self.item.tree_of(column)?.get(key)?)
    }

    pub fn contains_key(&self, column: &Column, key: impl AsRef<[u8]>) -> Result<bool, StoreError> {
        Ok(self.item.tree_of(column)?.contains_key(key)?)
    }

    pub fn len(&self, column: &Column) -> Result<usize, StoreError> {
        Ok(self.item.tree_of(column)?.len())
    }

    /// Visits every entry of `column` whose key is in `range`, in key order.
    pub fn for_each_in<K, R>(
        &self,
        column: &Column,
        range: R,
        mut f: impl FnMut(&[u8], &[u8]),
    ) -> Result<(), StoreError>
    where
        K: AsRef<[u8]>,
        R: RangeBounds<K>,
    {
        for entry in self.item.tree_of(column)?.range(range) {
            let (key, value) = entry?;
            f(&key, &value);
        }
        Ok(())
    }

    pub fn for_each(&self, column: &Column, mut f: impl FnMut(&[u8], &[u8])) -> Result<(), StoreError> {
        for entry in self.item.tree_of(column)?.iter() {
            let (key, value) = entry?;
            f(&key, &value);
        }
        Ok(())
    }
}

/// See [`StorageItem::read_atomic`].
pub struct AtomicReadView<'a> {
    columns: &'a [&'a Column],
    views: &'a [TransactionalTree],
}

impl<'a> AtomicReadView<'a> {
    pub fn get(&self, column: &Column, key: impl AsRef<[u8]>) -> Result<Option<IVec>, StoreError> {
        let slot = self
            .columns
            .iter()
            .position(|c| c.ptr_eq(column))
            .ok_or(StoreError::InvalidColumn)?;
        Ok(self.views[slot].get(key)?)
    }
}

/// Writes buffered by [`StorageItem::write_atomic`].
pub struct WriteBatch<'a> {
    item: &'a StorageItem,
    batches: Vec<(Column, Batch)>,
}

impl<'a> WriteBatch<'a> {
    fn batch_for(&mut self, column: &Column) -> Result<&mut Batch, StoreError> {
        if !self.item.columns.iter().any(|c| c.ptr_eq(column)) {
            return Err(StoreError::InvalidColumn);
        }
        let slot = match self.batches.iter().position(|(c, _)| c.ptr_eq(column)) {
            Some(slot) => slot,
            None => {
                self.batches.push((column.clone(), Batch::default()));
                self.batches.len() - 1
            }
        };
        Ok(&mut self.batches[slot].1)
    }

    pub fn insert(
        &mut self,
        column: &Column,
        key: impl Into<IVec>,
        value: impl Into<IVec>,
    ) -> Result<(), StoreError> {
        self.batch_for(column)?.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, column: &Column, key: impl Into<IVec>) -> Result<(), StoreError> {
        self.batch_for(column)?.remove(key);
        Ok(())
    }

    fn apply(self) -> Result<(), StoreError> {
        let Self { item, mut batches } = self;
        if batches.len() == 1 {
            if let Some((column, batch)) = batches.pop() {
                item.tree_of(&column)?.apply_batch(batch)?;
            }
            return Ok(());
        }
        let trees = batches
            .iter()
            .map(|(c, _)| item.tree_of(c))
            .collect::<Result<Vec<_>, _>>()?;
        if trees.is_empty() {
            return Ok(());
        }
        trees
            .as_slice()
            .transaction(|views| {
                for (view, (_, batch)) in views.iter().zip(batches.iter()) {
                    view.apply_batch(batch)?;
                }
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(StoreError::from)
    }
}

struct StagedRead {
    column: Column,
    key: IVec,
    value: Option<IVec>,
}

struct StagedWrite {
    column: Column,
    key: IVec,
    value: Option<IVec>,
}

/// An optimistic read-modify-write transaction over one [`StorageItem`].
///
/// Reads go to the live columns and are remembered; writes are buffered. [`ItemTransaction::commit`] fails with
/// [`StoreError::TransactionFailed`] if the item was cleared since the transaction began, or if any value it read has
/// changed. Otherwise every buffered write is applied atomically.
pub struct ItemTransaction<'a> {
    item: &'a StorageItem,
    counter: u64,
    reads: Vec<StagedRead>,
    writes: Vec<StagedWrite>,
}

impl<'a> ItemTransaction<'a> {
    /// True if a clear has happened since this transaction began. Such a transaction can never commit.
    pub fn is_stale(&self) -> bool {
        self.item.modification_count() != self.counter
    }

    fn check_fresh(&self) -> Result<(), StoreError> {
        if self.is_stale() {
            Err(StoreError::TransactionFailed)
        } else {
            Ok(())
        }
    }

    /// Reads `key`, observing this transaction's own buffered writes.
    pub fn get(&mut self, column: &Column, key: impl AsRef<[u8]>) -> Result<Option<IVec>, StoreError> {
        self.check_fresh()?;
        let key = key.as_ref();
        let tree = self.item.tree_of(column)?;
        if let Some(write) = self
            .writes
            .iter()
            .rev()
            .find(|w| w.column.ptr_eq(column) && w.key == key)
        {
            return Ok(write.value.clone());
        }
        let value = tree.get(key)?;
        self.reads.push(StagedRead {
            column: column.clone(),
            key: IVec::from(key),
            value: value.clone(),
        });
        Ok(value)
    }

    pub fn insert(
        &mut self,
        column: &Column,
        key: impl AsRef<[u8]>,
        value: impl Into<IVec>,
    ) -> Result<(), StoreError> {
        self.stage(column, key.as_ref(), Some(value.into()))
    }

    pub fn remove(&mut self, column: &Column, key: impl AsRef<[u8]>) -> Result<(), StoreError> {
        self.stage(column, key.as_ref(), None)
    }

    fn stage(&mut self, column: &Column, key: &[u8], value: Option<IVec>) -> Result<(), StoreError> {
        self.check_fresh()?;
        self.item.tree_of(column)?;
        self.writes.push(StagedWrite {
            column: column.clone(),
            key: IVec::from(key),
            value,
        });
        Ok(())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        let _shared = self.item.lock.read();
        self.item.ensure_open()?;
        self.check_fresh()?;
        if self.reads.is_empty() && self.writes.is_empty() {
            return Ok(());
        }

        let mut columns: Vec<&Column> = Vec::new();
        let read_slots: Vec<usize> = self
            .reads
            .iter()
            .map(|r| slot_of(&mut columns, &r.column))
            .collect();
        let write_slots: Vec<usize> = self
            .writes
            .iter()
            .map(|w| slot_of(&mut columns, &w.column))
            .collect();
        let trees = columns
            .iter()
            .map(|c| self.item.tree_of(c))
            .collect::<Result<Vec<_>, _>>()?;

        trees
            .as_slice()
            .transaction(|views| {
                for (read, &slot) in self.reads.iter().zip(read_slots.iter()) {
                    if views[slot].get(&read.key)? != read.value {
                        return Err(ConflictableTransactionError::Abort(StoreError::TransactionFailed));
                    }
                }
                for (write, &slot) in self.writes.iter().zip(write_slots.iter()) {
                    match &write.value {
                        Some(value) => views[slot].insert(write.key.clone(), value.clone())?,
                        None => views[slot].remove(write.key.clone())?,
                    };
                }
                Ok(())
            })
            .map_err(StoreError::from)
    }

    /// Discards every buffered write.
    pub fn rollback(self) {}
}

fn slot_of<'c>(columns: &mut Vec<&'c Column>, column: &'c Column) -> usize {
    match columns.iter().position(|c| c.ptr_eq(column)) {
        Some(slot) => slot,
        None => {
            columns.push(column);
            columns.len() - 1
        }
    }
}
