mod column_pool;
mod configure;
mod item;
mod manifest;
mod tile_key;
mod tile_storage;

pub use configure::{ColumnRequirement, ItemConfig, ItemRequirement, StorageItemFactory};
pub use item::{AtomicReadView, Column, ItemTransaction, ReadView, StorageItem, WriteBatch};
pub use manifest::{ItemManifest, StoreManifest, MANIFEST_FORMAT_VERSION};
pub use tile_key::TileKey;
pub use tile_storage::{TileStorage, TileStorageFactory, TILE_COLUMN};

use crate::{StoreConfig, StoreError};
use column_pool::ColumnFamilyPool;
use configure::reconcile;
use manifest::{
    family_name, load_item_manifest, load_store_manifest, read_item_manifest, read_store_manifest,
    remove_item_manifest, write_item_manifest, write_store_manifest, MANIFEST_TREE,
};

use strata_core::SmallKeyHashMap;

use parking_lot::Mutex;
use sled::transaction::TransactionalTree;
use sled::Tree;
use std::sync::{Arc, Weak};

/// Runs `f` in a sled transaction on `tree`. Conflicts are retried by sled, so `f` may run more than once.
pub(crate) fn transact<T>(
    tree: &Tree,
    f: impl Fn(&TransactionalTree) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    tree.transaction(|txn| f(txn).map_err(StoreError::into_conflictable))
        .map_err(StoreError::from)
}

/// Draws `n` fresh ids. sled's id generator takes the lock a transaction holds, so this must never be called from
/// inside [`transact`]. Ids that end up unused are simply skipped.
pub(crate) fn generate_ids(db: &sled::Db, n: usize) -> Result<Vec<u64>, StoreError> {
    (0..n).map(|_| Ok(db.generate_id()?)).collect()
}

pub(crate) struct StoreShared {
    db: sled::Db,
    manifest: Tree,
    pool: ColumnFamilyPool,
    /// Serializes item configuration.
    open_lock: Mutex<()>,
    open_items: Mutex<SmallKeyHashMap<String, Weak<StorageItem>>>,
}

impl StoreShared {
    fn live_item(&self, name: &str) -> Option<Arc<StorageItem>> {
        self.open_items
            .lock()
            .get(name)
            .and_then(Weak::upgrade)
            .filter(|item| !item.is_closed())
    }

    /// Removes `item` from the open set, unless the name has since been taken by another item.
    pub(crate) fn unregister(&self, name: &str, item: &StorageItem) {
        let mut open = self.open_items.lock();
        if open
            .get(name)
            .map_or(false, |w| std::ptr::eq(w.as_ptr(), item))
        {
            open.remove(name);
        }
    }
}

/// # Columnar Store
///
/// Hosts many independently versioned [`StorageItem`]s on one [`sled::Db`].
///
/// ## Implementation
///
/// A dedicated manifest tree holds one [`StoreManifest`] and one [`ItemManifest`] per item. Every column of every item
/// is backed by its own tree, a "column family," named `cf-<id>`. The manifest is the source of truth; open items hold
/// pooled handles to their column families.
///
/// Column families are never dropped directly. They are queued in the manifest and physically dropped once no handle
/// refers to them. A crash in between leaves either a queued family (dropped on the next open) or an orphaned tree
/// (swept on the next open).
pub struct ColumnarStore {
    shared: Arc<StoreShared>,
}

impl ColumnarStore {
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let db = config.sled_config().open()?;
        Self::from_db(db)
    }

    /// Opens the store on an existing database. On first open, an empty manifest is written.
    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let manifest = db.open_tree(MANIFEST_TREE)?;
        let num_items = transact(&manifest, |txn| {
            let store = match read_store_manifest(txn)? {
                Some(store) => store,
                None => {
                    // First time opening this store.
                    let store = StoreManifest::default();
                    write_store_manifest(txn, &store)?;
                    store
                }
            };
            Ok(store.items.len())
        })?;

        let pool = ColumnFamilyPool::new(db.clone());
        let dropped = pool.drop_unreferenced(&manifest)?;
        let orphans = pool.drop_orphans(&manifest)?;
        log::info!(
            "Opened columnar store with {} items ({} queued and {} orphaned column families dropped)",
            num_items,
            dropped,
            orphans
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                db,
                manifest,
                pool,
                open_lock: Mutex::new(()),
                open_items: Mutex::new(SmallKeyHashMap::default()),
            }),
        })
    }

    /// Opens an existing item. Fails with [`StoreError::NoSuchItem`] if it was never created.
    pub fn open_item<F: StorageItemFactory>(
        &self,
        name: &str,
        factory: &F,
    ) -> Result<F::Item, StoreError> {
        self.open_item_inner(name, factory, false)
    }

    pub fn open_or_create_item<F: StorageItemFactory>(
        &self,
        name: &str,
        factory: &F,
    ) -> Result<F::Item, StoreError> {
        self.open_item_inner(name, factory, true)
    }

    fn open_item_inner<F: StorageItemFactory>(
        &self,
        name: &str,
        factory: &F,
        create_if_missing: bool,
    ) -> Result<F::Item, StoreError> {
        let shared = &self.shared;
        let _configuring = shared.open_lock.lock();
        if shared.live_item(name).is_some() {
            return Err(StoreError::AlreadyOpen(name.to_owned()));
        }

        let existing = load_item_manifest(&shared.manifest, name)?;
        if existing.is_none() && !create_if_missing {
            return Err(StoreError::NoSuchItem(name.to_owned()));
        }

        // The owner's callback runs exactly once, outside of the (retryable) transaction.
        let mut config = ItemConfig::new(existing.as_ref());
        let requirement = factory.configure(&mut config);
        config.validate()?;

        // At most one inode plus one family per declared column.
        let ids = generate_ids(&shared.db, 1 + config.columns().count())?;
        let (new_inode, family_ids) = (ids[0], &ids[1..]);
        let manifest = transact(&shared.manifest, |txn| {
            let mut store = read_store_manifest(txn)?.unwrap_or_default();
            let existing = match store.items.get(name) {
                Some(&inode) => read_item_manifest(txn, inode)?,
                None => None,
            };
            let inode = existing.as_ref().map_or(new_inode, |m| m.inode);
            let mut ids = family_ids.iter();
            let reconciled = reconcile(name, existing, inode, &config, requirement, || {
                match ids.next() {
                    Some(&id) => Ok(family_name(id)),
                    None => panic!("BUG: allocated more column families than declared columns"),
                }
            })?;

            store.items.insert(name.to_owned(), inode);
            store.column_families.extend(reconciled.created);
            for family in reconciled.discarded {
                store.discard_family(family);
            }
            write_store_manifest(txn, &store)?;
            write_item_manifest(txn, &reconciled.manifest)?;
            Ok(reconciled.manifest)
        })?;
        shared.pool.drop_unreferenced(&shared.manifest)?;

        let trees = shared
            .pool
            .acquire_all(manifest.columns.values().map(String::as_str))?;
        let columns = manifest
            .columns
            .iter()
            .zip(trees)
            .map(|((column, family), tree)| (column.clone(), family.clone(), tree));
        let item = Arc::new(StorageItem::new(
            name.to_owned(),
            manifest.inode,
            Arc::clone(shared),
            columns,
        ));

        let owner = match factory.create(Arc::clone(&item)) {
            Ok(owner) => owner,
            Err(e) => {
                if let Err(close_error) = item.close() {
                    log::error!("Failed to close storage item {} after construction failed: {}", name, close_error);
                }
                return Err(StoreError::Construct(e));
            }
        };
        shared
            .open_items
            .lock()
            .insert(name.to_owned(), Arc::downgrade(&item));
        log::info!(
            "Opened storage item {} with columns {:?}",
            name,
            manifest.columns.keys().collect::<Vec<_>>()
        );

        Ok(owner)
    }

    pub fn close_item(&self, name: &str) -> Result<(), StoreError> {
        match self.shared.live_item(name) {
            Some(item) => item.close(),
            None => Err(StoreError::NoSuchItem(name.to_owned())),
        }
    }

    /// Deletes closed items along with all of their data.
    pub fn delete_items(&self, names: &[&str]) -> Result<(), StoreError> {
        let shared = &self.shared;
        let _configuring = shared.open_lock.lock();
        if let Some(open) = names.iter().find(|n| shared.live_item(n).is_some()) {
            return Err(StoreError::AlreadyOpen((*open).to_owned()));
        }

        transact(&shared.manifest, |txn| {
            let mut store = read_store_manifest(txn)?.unwrap_or_default();
            for &name in names {
                let inode = store
                    .items
                    .remove(name)
                    .ok_or_else(|| StoreError::NoSuchItem(name.to_owned()))?;
                if let Some(item) = read_item_manifest(txn, inode)? {
                    for family in item.columns.into_values() {
                        store.discard_family(family);
                    }
                }
                remove_item_manifest(txn, inode)?;
            }
            write_store_manifest(txn, &store)
        })?;
        shared.pool.drop_unreferenced(&shared.manifest)?;
        log::info!("Deleted storage items {:?}", names);
        Ok(())
    }

    /// Names of every item in the store, open or not.
    pub fn all_items(&self) -> Result<Vec<String>, StoreError> {
        Ok(load_store_manifest(&self.shared.manifest)?
            .items
            .into_keys()
            .collect())
    }

    /// Names of the currently open items.
    pub fn open_items(&self) -> Vec<String> {
        let open = self.shared.open_items.lock();
        let mut names: Vec<String> = open
            .iter()
            .filter(|(_, item)| item.upgrade().map_or(false, |i| !i.is_closed()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// A snapshot of the persisted manifest of item `name`.
    pub fn describe_item(&self, name: &str) -> Result<Option<ItemManifest>, StoreError> {
        load_item_manifest(&self.shared.manifest, name)
    }

    pub fn store_manifest(&self) -> Result<StoreManifest, StoreError> {
        load_store_manifest(&self.shared.manifest)
    }

    /// Returns the number of bytes flushed.
    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.shared.db.flush()?)
    }

    /// Flushes and closes the store. Every item must have been closed first.
    pub fn close(self) -> Result<(), StoreError> {
        let open = self.open_items();
        if !open.is_empty() {
            return Err(StoreError::ItemsStillOpen(open.len()));
        }
        self.flush()?;
        log::info!("Closed columnar store");
        Ok(())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchemaError;
    use std::error::Error;

    /// Declares a fixed set of columns and hands back the raw storage.
    struct Columns {
        columns: Vec<(&'static str, ColumnRequirement)>,
        requirement: ItemRequirement,
        token: Option<&'static [u8]>,
    }

    impl Columns {
        fn create_if_missing(names: &[&'static str]) -> Self {
            Self::with(names, ColumnRequirement::CreateIfMissing)
        }

        fn with(names: &[&'static str], requirement: ColumnRequirement) -> Self {
            Self {
                columns: names.iter().map(|n| (*n, requirement)).collect(),
                requirement: ItemRequirement::CreateIfMissing,
                token: None,
            }
        }
    }

    impl StorageItemFactory for Columns {
        type Item = Arc<StorageItem>;

        fn configure(&self, config: &mut ItemConfig) -> ItemRequirement {
            for (name, req) in self.columns.iter() {
                config.register_column(name, *req);
            }
            if let Some(token) = self.token {
                config.set_token(token);
            }
            self.requirement
        }

        fn create(&self, storage: Arc<StorageItem>) -> Result<Self::Item, Box<dyn Error + Send + Sync>> {
            Ok(storage)
        }
    }

    struct Failing;

    impl StorageItemFactory for Failing {
        type Item = ();

        fn configure(&self, config: &mut ItemConfig) -> ItemRequirement {
            config.register_column("data", ColumnRequirement::CreateIfMissing);
            ItemRequirement::CreateIfMissing
        }

        fn create(&self, _: Arc<StorageItem>) -> Result<(), Box<dyn Error + Send + Sync>> {
            Err("owner refused".into())
        }
    }

    fn temporary_store() -> ColumnarStore {
        let db = sled::Config::default().temporary(true).open().unwrap();
        ColumnarStore::from_db(db).unwrap()
    }

    fn family_count(store: &ColumnarStore) -> usize {
        store.store_manifest().unwrap().column_families.len()
    }

    #[test]
    fn reopening_with_same_columns_is_idempotent() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a", "b"]);

        let item = store.open_or_create_item("item", &factory).unwrap();
        let first = store.describe_item("item").unwrap().unwrap();
        item.close().unwrap();

        let item = store.open_or_create_item("item", &factory).unwrap();
        let second = store.describe_item("item").unwrap().unwrap();
        item.close().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.columns.len(), 2);
        assert_eq!(family_count(&store), 2);
    }

    #[test]
    fn fail_if_missing_on_existing_item() {
        let store = temporary_store();
        store
            .open_or_create_item("old", &Columns::create_if_missing(&["a"]))
            .unwrap()
            .close()
            .unwrap();

        let strict = Columns::with(&["x"], ColumnRequirement::FailIfMissing);
        let err = store.open_or_create_item("old", &strict).unwrap_err();
        assert!(matches!(err, StoreError::Schema(SchemaError::MissingColumn { .. })));
        // The failed open changed nothing.
        assert!(!store.describe_item("old").unwrap().unwrap().columns.contains_key("x"));
        assert!(store.open_items().is_empty());

        let fresh = store.open_or_create_item("new", &strict).unwrap();
        assert!(fresh.column("x").is_some());
    }

    #[test]
    fn open_item_requires_existing_item() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a"]);
        assert!(matches!(
            store.open_item("missing", &factory),
            Err(StoreError::NoSuchItem(_))
        ));
        store.open_or_create_item("present", &factory).unwrap().close().unwrap();
        store.open_item("present", &factory).unwrap();
    }

    #[test]
    fn item_cannot_be_opened_twice() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a"]);
        let item = store.open_or_create_item("item", &factory).unwrap();
        assert!(matches!(
            store.open_or_create_item("item", &factory),
            Err(StoreError::AlreadyOpen(_))
        ));
        assert_eq!(store.open_items(), vec!["item".to_string()]);
        store.close_item("item").unwrap();
        assert!(item.is_closed());
        store.open_or_create_item("item", &factory).unwrap();
    }

    #[test]
    fn duplicate_column_declaration_fails_before_touching_storage() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a", "a"]);
        assert!(matches!(
            store.open_or_create_item("item", &factory),
            Err(StoreError::Schema(SchemaError::DuplicateColumn(_)))
        ));
        assert!(store.all_items().unwrap().is_empty());
    }

    #[test]
    fn failed_construction_releases_columns() {
        let store = temporary_store();
        assert!(matches!(
            store.open_or_create_item("item", &Failing),
            Err(StoreError::Construct(_))
        ));
        assert!(store.open_items().is_empty());
        let manifest = store.describe_item("item").unwrap().unwrap();
        let family = &manifest.columns["data"];
        assert_eq!(store.shared.pool.handle_count(family), 0);

        // The item can still be opened by a working owner.
        store
            .open_item("item", &Columns::create_if_missing(&["data"]))
            .unwrap();
    }

    #[test]
    fn use_after_close_fails() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        let column = item.column("a").unwrap().clone();
        item.close().unwrap();

        assert!(matches!(item.read(|r| r.get(&column, "k")), Err(StoreError::Closed)));
        assert!(matches!(
            item.write_atomic(|w| w.insert(&column, "k", "v")),
            Err(StoreError::Closed)
        ));
        assert!(matches!(item.begin_transaction(), Err(StoreError::Closed)));
        assert!(matches!(item.token(), Err(StoreError::Closed)));
        assert_eq!(column.family_name(), None);
    }

    #[test]
    fn columns_of_other_items_are_rejected() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a"]);
        let one = store.open_or_create_item("one", &factory).unwrap();
        let two = store.open_or_create_item("two", &factory).unwrap();
        let foreign = two.column("a").unwrap();
        assert!(matches!(
            one.read(|r| r.get(foreign, "k")),
            Err(StoreError::InvalidColumn)
        ));
    }

    #[test]
    fn atomic_writes_and_reads_span_columns() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a", "b"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();
        let b = item.column("b").unwrap().clone();

        item.write_atomic(|w| {
            w.insert(&a, "k", "1")?;
            w.insert(&b, "k", "2")?;
            w.insert(&b, "gone", "x")?;
            w.remove(&b, "gone")
        })
        .unwrap();

        let (va, vb) = item
            .read_atomic(&[&a, &b], |r| Ok((r.get(&a, "k")?, r.get(&b, "k")?)))
            .unwrap();
        assert_eq!(va.unwrap(), "1");
        assert_eq!(vb.unwrap(), "2");
        assert_eq!(item.read(|r| r.len(&b)).unwrap(), 1);

        // A failing callback writes nothing.
        let result = item.write_atomic(|w| {
            w.insert(&a, "other", "3")?;
            Err::<(), _>(StoreError::InvalidColumn)
        });
        assert!(result.is_err());
        assert!(!item.read(|r| r.contains_key(&a, "other")).unwrap());
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();

        let total = item
            .transact_atomic(|txn| {
                let n = txn
                    .get(&a, "count")?
                    .map_or(0, |v| u64::from_be_bytes((&v[..]).try_into().unwrap()));
                txn.insert(&a, "count", (n + 5).to_be_bytes().to_vec())?;
                let reread = txn.get(&a, "count")?.unwrap();
                Ok(u64::from_be_bytes((&reread[..]).try_into().unwrap()))
            })
            .unwrap();
        assert_eq!(total, 5);

        let txn = item.begin_transaction().unwrap();
        txn.rollback();
        assert_eq!(
            item.read(|r| r.get(&a, "count")).unwrap().unwrap(),
            &5u64.to_be_bytes()[..]
        );
    }

    #[test]
    fn conflicting_write_invalidates_transaction() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();

        let mut txn = item.begin_transaction().unwrap();
        assert_eq!(txn.get(&a, "k").unwrap(), None);
        txn.insert(&a, "k", "from-txn").unwrap();

        item.write_atomic(|w| w.insert(&a, "k", "from-elsewhere")).unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::TransactionFailed)));
        assert_eq!(item.read(|r| r.get(&a, "k")).unwrap().unwrap(), "from-elsewhere");
    }

    #[test]
    fn clear_columns_invalidates_older_transactions() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a", "b"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();
        let b = item.column("b").unwrap().clone();
        item.write_atomic(|w| {
            w.insert(&a, "first", "1")?;
            w.insert(&a, "middle", "2")?;
            w.insert(&a, "z-last", "3")?;
            w.insert(&b, "kept", "4")
        })
        .unwrap();
        let old_family = a.family_name().unwrap();

        let mut txn = item.begin_transaction().unwrap();
        txn.insert(&a, "stale", "x").unwrap();

        let counter = item.modification_count();
        crossbeam::scope(|s| {
            s.spawn(|_| item.clear_columns(&[&a]).unwrap());
        })
        .unwrap();
        assert_eq!(item.modification_count(), counter + 1);

        assert!(txn.is_stale());
        assert!(matches!(txn.commit(), Err(StoreError::TransactionFailed)));
        assert_eq!(item.read(|r| r.len(&a)).unwrap(), 0);
        assert_eq!(item.read(|r| r.len(&b)).unwrap(), 1);

        // The old column family is queued and physically dropped.
        assert_ne!(a.family_name().unwrap(), old_family);
        let manifest = store.store_manifest().unwrap();
        assert!(!manifest.column_families.contains(&old_family));
        assert!(manifest.pending_deletion.is_empty());
        assert_eq!(
            store.describe_item("item").unwrap().unwrap().columns["a"],
            a.family_name().unwrap()
        );

        // New transactions work against the fresh column.
        item.transact_atomic(|txn| txn.insert(&a, "fresh", "y")).unwrap();
        assert_eq!(item.read(|r| r.len(&a)).unwrap(), 1);
    }

    #[test]
    fn new_items_are_created_and_cleared() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a", "b"]);
        let first = store.open_or_create_item("first", &factory).unwrap();
        let second = store.open_or_create_item("second", &factory).unwrap();
        assert_ne!(first.inode(), second.inode());

        let families: Vec<String> = [&first, &second]
            .iter()
            .flat_map(|item| item.columns().iter().map(|c| c.family_name().unwrap()))
            .collect();
        let mut unique = families.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert_eq!(family_count(&store), 4);

        let a = first.column("a").unwrap().clone();
        first.write_atomic(|w| w.insert(&a, "k", "v")).unwrap();
        first.clear_columns(&[&a]).unwrap();
        assert_eq!(first.read(|r| r.len(&a)).unwrap(), 0);
        assert_eq!(family_count(&store), 4);
    }

    #[test]
    fn failed_clear_leaves_columns_untouched() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();
        item.write_atomic(|w| w.insert(&a, "k", "v")).unwrap();
        let family = a.family_name().unwrap();
        let trees_before = store.shared.db.tree_names().len();

        // Losing the item manifest makes the clear's manifest commit fail.
        let inode = item.inode();
        transact(&store.shared.manifest, |txn| remove_item_manifest(txn, inode)).unwrap();
        assert!(matches!(item.clear_columns(&[&a]), Err(StoreError::Corrupt(_))));

        assert_eq!(a.family_name().unwrap(), family);
        assert_eq!(item.read(|r| r.get(&a, "k")).unwrap().unwrap(), "v");
        let manifest = store.store_manifest().unwrap();
        assert!(manifest.pending_deletion.is_empty());
        assert_eq!(manifest.column_families.len(), 1);
        // The family opened for the clear is gone again.
        assert_eq!(store.shared.db.tree_names().len(), trees_before);
    }

    #[test]
    fn tokens_persist() {
        let store = temporary_store();
        let mut factory = Columns::create_if_missing(&["a"]);
        factory.token = Some(b"v1");
        let item = store.open_or_create_item("item", &factory).unwrap();
        assert_eq!(item.token().unwrap().as_deref(), Some(&b"v1"[..]));

        item.set_token(b"v2").unwrap();
        assert_eq!(item.token().unwrap().as_deref(), Some(&b"v2"[..]));
        item.remove_token().unwrap();
        assert_eq!(item.token().unwrap(), None);
        item.set_token(b"v3").unwrap();
        item.close().unwrap();

        let item = store
            .open_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        assert_eq!(item.token().unwrap().as_deref(), Some(&b"v3"[..]));
    }

    #[test]
    fn delete_existing_item_discards_data() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        let a = item.column("a").unwrap().clone();
        item.write_atomic(|w| w.insert(&a, "k", "v")).unwrap();
        item.set_token(b"old").unwrap();
        item.close().unwrap();

        let mut recreate = Columns::create_if_missing(&["a"]);
        recreate.requirement = ItemRequirement::DeleteExistingAndCreate;
        let item = store.open_item("item", &recreate).unwrap();
        let a = item.column("a").unwrap();
        assert_eq!(item.read(|r| r.len(a)).unwrap(), 0);
        assert_eq!(item.token().unwrap().as_deref(), Some(&b"old"[..]));
        assert_eq!(family_count(&store), 1);
    }

    #[test]
    fn delete_items_removes_everything() {
        let store = temporary_store();
        let factory = Columns::create_if_missing(&["a", "b"]);
        let item = store.open_or_create_item("doomed", &factory).unwrap();
        store.open_or_create_item("kept", &factory).unwrap().close().unwrap();

        assert!(matches!(
            store.delete_items(&["doomed"]),
            Err(StoreError::AlreadyOpen(_))
        ));
        item.close().unwrap();
        store.delete_items(&["doomed"]).unwrap();

        assert_eq!(store.all_items().unwrap(), vec!["kept".to_string()]);
        assert_eq!(family_count(&store), 2);
        assert!(matches!(
            store.delete_items(&["doomed"]),
            Err(StoreError::NoSuchItem(_))
        ));
    }

    #[test]
    fn store_cannot_close_with_open_items() {
        let store = temporary_store();
        let item = store
            .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
            .unwrap();
        assert!(matches!(store.close(), Err(StoreError::ItemsStillOpen(1))));
        assert!(!item.is_closed());
        drop(item);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::at_path(dir.path().join("db"));
        let factory = Columns::create_if_missing(&["a"]);
        {
            let store = ColumnarStore::open(&config).unwrap();
            let item = store.open_or_create_item("item", &factory).unwrap();
            let a = item.column("a").unwrap().clone();
            item.write_atomic(|w| w.insert(&a, "k", "v")).unwrap();
            item.close().unwrap();
            store.close().unwrap();
        }
        let store = ColumnarStore::open(&config).unwrap();
        let item = store.open_item("item", &factory).unwrap();
        let a = item.column("a").unwrap();
        assert_eq!(item.read(|r| r.get(a, "k")).unwrap().unwrap(), "v");
    }

    #[test]
    fn queued_and_orphaned_families_are_dropped_on_open() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        {
            let store = ColumnarStore::from_db(db.clone()).unwrap();
            store
                .open_or_create_item("item", &Columns::create_if_missing(&["a"]))
                .unwrap()
                .close()
                .unwrap();
        }
        // Simulate a crash: one family queued but never dropped, one tree created but never registered.
        let manifest_tree = db.open_tree(MANIFEST_TREE).unwrap();
        let queued = family_name(1_000_000);
        let orphan = family_name(2_000_000);
        db.open_tree(&queued).unwrap();
        db.open_tree(&orphan).unwrap();
        transact(&manifest_tree, |txn| {
            let mut store = read_store_manifest(txn)?.unwrap();
            store.column_families.insert(queued.clone());
            store.discard_family(queued.clone());
            write_store_manifest(txn, &store)
        })
        .unwrap();

        let store = ColumnarStore::from_db(db.clone()).unwrap();
        let names: Vec<_> = db.tree_names();
        assert!(!names.iter().any(|n| **n == *queued.as_bytes()));
        assert!(!names.iter().any(|n| **n == *orphan.as_bytes()));
        assert!(store.store_manifest().unwrap().pending_deletion.is_empty());
        assert_eq!(family_count(&store), 1);
    }
}
