use crate::StoreError;

use strata_core::ArchivedBuf;

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use std::collections::{BTreeMap, BTreeSet};

pub(crate) const MANIFEST_TREE: &str = "strata-manifest";
/// Every column family tree created by the store carries this prefix.
pub(crate) const COLUMN_FAMILY_PREFIX: &str = "cf-";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const STORE_KEY: &[u8] = b"store";
const ITEM_KEY_PREFIX: &[u8] = b"item/";

/// Global state of a [`ColumnarStore`](crate::ColumnarStore).
#[derive(Archive, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[archive(check_bytes)]
pub struct StoreManifest {
    pub format_version: u32,
    /// Every column family the store knows about, including those waiting for deletion.
    pub column_families: BTreeSet<String>,
    /// Column families that are no longer referenced by any item manifest.
    pub pending_deletion: BTreeSet<String>,
    /// Item name to inode.
    pub items: BTreeMap<String, u64>,
}

impl Default for StoreManifest {
    fn default() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            column_families: BTreeSet::new(),
            pending_deletion: BTreeSet::new(),
            items: BTreeMap::new(),
        }
    }
}

impl StoreManifest {
    /// Moves `family` into the deletion queue. It stays registered until it is physically dropped.
    pub fn discard_family(&mut self, family: String) {
        debug_assert!(self.column_families.contains(&family));
        self.pending_deletion.insert(family);
    }

    pub fn forget_family(&mut self, family: &str) {
        self.column_families.remove(family);
        self.pending_deletion.remove(family);
    }
}

/// Persistent description of one [`StorageItem`](crate::StorageItem).
#[derive(Archive, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[archive(check_bytes)]
pub struct ItemManifest {
    pub inode: u64,
    /// Column name to column family name.
    pub columns: BTreeMap<String, String>,
    pub token: Option<Vec<u8>>,
    pub initialized: bool,
}

impl ItemManifest {
    pub fn empty(inode: u64) -> Self {
        Self {
            inode,
            columns: BTreeMap::new(),
            token: None,
            initialized: false,
        }
    }
}

pub(crate) fn family_name(id: u64) -> String {
    format!("{}{:016x}", COLUMN_FAMILY_PREFIX, id)
}

fn item_key(inode: u64) -> [u8; 13] {
    let mut key = [0; 13];
    key[..5].copy_from_slice(ITEM_KEY_PREFIX);
    key[5..].copy_from_slice(&inode.to_be_bytes());
    key
}

fn decode_store(bytes: &[u8]) -> Result<StoreManifest, StoreError> {
    let manifest = ArchivedBuf::<StoreManifest>::from_bytes(bytes)?.deserialize();
    if manifest.format_version > MANIFEST_FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "manifest format {} is newer than the supported format {}",
            manifest.format_version, MANIFEST_FORMAT_VERSION
        )));
    }
    Ok(manifest)
}

fn decode_item(bytes: &[u8]) -> Result<ItemManifest, StoreError> {
    Ok(ArchivedBuf::<ItemManifest>::from_bytes(bytes)?.deserialize())
}

pub(crate) fn read_store_manifest(
    txn: &TransactionalTree,
) -> Result<Option<StoreManifest>, StoreError> {
    txn.get(STORE_KEY)?
        .map(|bytes| decode_store(&bytes))
        .transpose()
}

pub(crate) fn write_store_manifest(
    txn: &TransactionalTree,
    manifest: &StoreManifest,
) -> Result<(), StoreError> {
    let buf = ArchivedBuf::serialize(manifest)?;
    txn.insert(STORE_KEY, buf.as_bytes())?;
    Ok(())
}

pub(crate) fn read_item_manifest(
    txn: &TransactionalTree,
    inode: u64,
) -> Result<Option<ItemManifest>, StoreError> {
    txn.get(item_key(inode))?
        .map(|bytes| decode_item(&bytes))
        .transpose()
}

pub(crate) fn write_item_manifest(
    txn: &TransactionalTree,
    manifest: &ItemManifest,
) -> Result<(), StoreError> {
    let buf = ArchivedBuf::serialize(manifest)?;
    txn.insert(&item_key(manifest.inode)[..], buf.as_bytes())?;
    Ok(())
}

pub(crate) fn remove_item_manifest(txn: &TransactionalTree, inode: u64) -> Result<(), StoreError> {
    txn.remove(&item_key(inode)[..])?;
    Ok(())
}

/// Reads the store manifest outside of a transaction.
pub(crate) fn load_store_manifest(tree: &sled::Tree) -> Result<StoreManifest, StoreError> {
    match tree.get(STORE_KEY)? {
        Some(bytes) => decode_store(&bytes),
        None => Ok(StoreManifest::default()),
    }
}

/// Reads an item manifest (looked up by item name) outside of a transaction.
pub(crate) fn load_item_manifest(
    tree: &sled::Tree,
    name: &str,
) -> Result<Option<ItemManifest>, StoreError> {
    let store = load_store_manifest(tree)?;
    let inode = match store.items.get(name) {
        Some(inode) => *inode,
        None => return Ok(None),
    };
    tree.get(item_key(inode))?
        .map(|bytes| decode_item(&bytes))
        .transpose()
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
    use crate::database::transact;

    #[test]
    fn write_and_reread_manifests() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let tree = db.open_tree(MANIFEST_TREE).unwrap();

        let mut store = StoreManifest::default();
        store.items.insert("tiles".into(), 9);
        store.column_families.insert(family_name(3));
        let mut item = ItemManifest::empty(9);
        item.columns.insert("data".into(), family_name(3));
        item.token = Some(vec![1, 2, 3]);
        item.initialized = true;

        transact(&tree, |txn| {
            write_store_manifest(txn, &store)?;
            write_item_manifest(txn, &item)
        })
        .unwrap();

        assert_eq!(load_store_manifest(&tree).unwrap(), store);
        assert_eq!(load_item_manifest(&tree, "tiles").unwrap(), Some(item));
        assert_eq!(load_item_manifest(&tree, "other").unwrap(), None);
    }

    #[test]
    fn newer_format_is_rejected() {
        let db = sled::Config::default().temporary(true).open().unwrap();
        let tree = db.open_tree(MANIFEST_TREE).unwrap();
        let future = StoreManifest {
            format_version: MANIFEST_FORMAT_VERSION + 1,
            ..Default::default()
        };
        tree.insert(STORE_KEY, ArchivedBuf::serialize(&future).unwrap().as_bytes())
            .unwrap();
        assert!(matches!(load_store_manifest(&tree), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn family_names_sort_by_id() {
        assert_eq!(family_name(0x2a), "cf-000000000000002a");
        assert!(family_name(9) < family_name(10));
    }
}
