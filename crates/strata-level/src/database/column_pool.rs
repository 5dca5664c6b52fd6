use super::manifest::{read_store_manifest, write_store_manifest, COLUMN_FAMILY_PREFIX};
use super::transact;
use crate::StoreError;

use strata_core::SmallKeyHashMap;

use parking_lot::Mutex;
use sled::Tree;

/// Reference-counted handles to the physical column family trees.
///
/// A column family is only physically dropped once the manifest has queued it for deletion *and* no live handle refers
/// to it.
pub(crate) struct ColumnFamilyPool {
    db: sled::Db,
    live: Mutex<SmallKeyHashMap<String, PooledFamily>>,
}

struct PooledFamily {
    tree: Tree,
    handles: usize,
}

impl ColumnFamilyPool {
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            live: Mutex::new(SmallKeyHashMap::default()),
        }
    }

    /// Opens (creating if necessary) the tree for `family` and takes a handle on it.
    pub fn acquire(&self, family: &str) -> Result<Tree, StoreError> {
        let mut live = self.live.lock();
        if let Some(pooled) = live.get_mut(family) {
            pooled.handles += 1;
            return Ok(pooled.tree.clone());
        }
        let tree = self.db.open_tree(family)?;
        live.insert(
            family.to_owned(),
            PooledFamily {
                tree: tree.clone(),
                handles: 1,
            },
        );
        Ok(tree)
    }

    /// Acquires every family in `families`, releasing what was acquired so far if one of them fails.
    pub fn acquire_all<'a>(
        &self,
        families: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<Tree>, StoreError> {
        let mut acquired: Vec<(&str, Tree)> = Vec::new();
        for family in families {
            match self.acquire(family) {
                Ok(tree) => acquired.push((family, tree)),
                Err(e) => {
                    for (family, _) in acquired {
                        self.release(family);
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired.into_iter().map(|(_, tree)| tree).collect())
    }

    /// Gives back one handle. Returns the number of handles still live.
    pub fn release(&self, family: &str) -> usize {
        let mut live = self.live.lock();
        let remaining = match live.get_mut(family) {
            Some(pooled) => {
                pooled.handles -= 1;
                pooled.handles
            }
            None => {
                debug_assert!(false, "released column family {} without a handle", family);
                log::error!("Released column family {} without a handle", family);
                return 0;
            }
        };
        if remaining == 0 {
            live.remove(family);
        }
        remaining
    }

    pub fn handle_count(&self, family: &str) -> usize {
        self.live.lock().get(family).map_or(0, |p| p.handles)
    }

    /// Physically drops every queued column family that has no live handle. Returns how many were dropped.
    pub fn drop_unreferenced(&self, manifest_tree: &Tree) -> Result<usize, StoreError> {
        // Holding the pool lock keeps anyone from acquiring a family while we drop it.
        let live = self.live.lock();
        let doomed = transact(manifest_tree, |txn| {
            let mut manifest = match read_store_manifest(txn)? {
                Some(m) => m,
                None => return Ok(Vec::new()),
            };
            let doomed: Vec<String> = manifest
                .pending_deletion
                .iter()
                .filter(|f| !live.contains_key(*f))
                .cloned()
                .collect();
            if !doomed.is_empty() {
                for family in doomed.iter() {
                    manifest.forget_family(family);
                }
                write_store_manifest(txn, &manifest)?;
            }
            Ok(doomed)
        })?;

        // The manifest no longer references these. A crash before the drop leaves an orphan that is swept on the next
        // open.
        for family in doomed.iter() {
            self.db.drop_tree(family.as_bytes())?;
            log::info!("Dropped column family {}", family);
        }
        Ok(doomed.len())
    }

    /// Drops every column family tree that exists physically but is unknown to the manifest.
    pub fn drop_orphans(&self, manifest_tree: &Tree) -> Result<usize, StoreError> {
        let live = self.live.lock();
        let known = transact(manifest_tree, |txn| {
            Ok(read_store_manifest(txn)?
                .map(|m| m.column_families)
                .unwrap_or_default())
        })?;

        let mut dropped = 0;
        for name in self.db.tree_names() {
            let name = match std::str::from_utf8(&name) {
                Ok(name) => name.to_owned(),
                Err(_) => continue,
            };
            if name.starts_with(COLUMN_FAMILY_PREFIX)
                && !known.contains(&name)
                && !live.contains_key(&name)
            {
                log::warn!("Dropping orphaned column family {}", name);
                self.db.drop_tree(name.as_bytes())?;
                dropped += 1;
            }
        }
        Ok(dropped)
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
    use super::super::manifest::{family_name, load_store_manifest, StoreManifest, MANIFEST_TREE};
    use super::*;

    fn tree_exists(db: &sled::Db, name: &str) -> bool {
        db.tree_names().iter().any(|n| **n == *name.as_bytes())
    }

    #[test]
    fn handles_are_counted() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let pool = ColumnFamilyPool::new(db.clone());
        let a = family_name(1);

        let t1 = pool.acquire(&a).unwrap();
        let t2 = pool.acquire(&a).unwrap();
        t1.insert("k", "v").unwrap();
        assert_eq!(t2.get("k").unwrap().unwrap(), "v");
        assert_eq!(pool.handle_count(&a), 2);
        assert_eq!(pool.release(&a), 1);
        assert_eq!(pool.release(&a), 0);
        assert_eq!(pool.handle_count(&a), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "without a handle")]
    fn unbalanced_release_is_caught_in_debug_builds() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        ColumnFamilyPool::new(db).release(&family_name(7));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn unbalanced_release_leaves_other_handles_alone() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let pool = ColumnFamilyPool::new(db);
        let a = family_name(1);
        pool.acquire(&a).unwrap();
        assert_eq!(pool.release(&family_name(7)), 0);
        assert_eq!(pool.handle_count(&a), 1);
    }

    #[test]
    fn queued_family_is_dropped_once_released() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let manifest_tree = db.open_tree(MANIFEST_TREE).unwrap();
        let pool = ColumnFamilyPool::new(db.clone());
        let a = family_name(1);

        pool.acquire(&a).unwrap();
        let mut manifest = StoreManifest::default();
        manifest.column_families.insert(a.clone());
        manifest.discard_family(a.clone());
        transact(&manifest_tree, |txn| write_store_manifest(txn, &manifest)).unwrap();

        // Still referenced.
        assert_eq!(pool.drop_unreferenced(&manifest_tree).unwrap(), 0);
        assert!(tree_exists(&db, &a));

        pool.release(&a);
        assert_eq!(pool.drop_unreferenced(&manifest_tree).unwrap(), 1);
        assert!(!tree_exists(&db, &a));
        assert_eq!(load_store_manifest(&manifest_tree).unwrap(), StoreManifest::default());
    }

    #[test]
    fn orphans_are_swept() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let manifest_tree = db.open_tree(MANIFEST_TREE).unwrap();
        let pool = ColumnFamilyPool::new(db.clone());
        let known = family_name(1);
        let orphan = family_name(2);

        let mut manifest = StoreManifest::default();
        manifest.column_families.insert(known.clone());
        transact(&manifest_tree, |txn| write_store_manifest(txn, &manifest)).unwrap();
        db.open_tree(&known).unwrap();
        db.open_tree(&orphan).unwrap();
        db.open_tree("unrelated").unwrap();

        assert_eq!(pool.drop_orphans(&manifest_tree).unwrap(), 1);
        assert!(tree_exists(&db, &known));
        assert!(!tree_exists(&db, &orphan));
        assert!(tree_exists(&db, "unrelated"));
    }
}
