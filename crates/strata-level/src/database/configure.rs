use super::manifest::ItemManifest;
use super::StorageItem;
use crate::{SchemaError, StoreError};

use std::error::Error;
use std::sync::Arc;

/// How a column should be reconciled with an existing item.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ColumnRequirement {
    /// Reuse the existing column, or create it.
    CreateIfMissing,
    /// The column must already exist, unless the item itself is being created.
    FailIfMissing,
    /// Discard any existing column data and start from an empty column.
    DeleteExistingAndCreate,
}

/// What to do with the item as a whole, decided by [`StorageItemFactory::configure`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ItemRequirement {
    CreateIfMissing,
    /// Drop every existing column of an initialized item before reconciling columns. The old token is carried forward
    /// unless a new one was set.
    DeleteExistingAndCreate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum TokenChange {
    Keep,
    Set(Vec<u8>),
    Clear,
}

/// Passed to [`StorageItemFactory::configure`] to declare the schema the owner needs.
#[derive(Debug)]
pub struct ItemConfig {
    existing_token: Option<Vec<u8>>,
    is_new: bool,
    token: TokenChange,
    columns: Vec<(String, ColumnRequirement)>,
    duplicate: Option<String>,
}

impl ItemConfig {
    pub(crate) fn new(existing: Option<&ItemManifest>) -> Self {
        Self {
            existing_token: existing.and_then(|m| m.token.clone()),
            is_new: existing.map_or(true, |m| !m.initialized),
            token: TokenChange::Keep,
            columns: Vec::new(),
            duplicate: None,
        }
    }

    /// The token stored by the previous successful configuration, if any.
    pub fn existing_token(&self) -> Option<&[u8]> {
        self.existing_token.as_deref()
    }

    /// True if the item has never been successfully configured.
    pub fn is_new_item(&self) -> bool {
        self.is_new
    }

    pub fn set_token(&mut self, token: impl Into<Vec<u8>>) {
        self.token = TokenChange::Set(token.into());
    }

    pub fn clear_token(&mut self) {
        self.token = TokenChange::Clear;
    }

    /// Declares a column. Declaring the same name twice fails the whole configuration.
    pub fn register_column(&mut self, name: &str, requirement: ColumnRequirement) -> &mut Self {
        if self.columns.iter().any(|(n, _)| n == name) {
            self.duplicate.get_or_insert_with(|| name.to_owned());
        } else {
            self.columns.push((name.to_owned(), requirement));
        }
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnRequirement)> {
        self.columns.iter().map(|(n, r)| (n.as_str(), *r))
    }

    pub(crate) fn validate(&self) -> Result<(), SchemaError> {
        match &self.duplicate {
            Some(name) => Err(SchemaError::DuplicateColumn(name.clone())),
            None => Ok(()),
        }
    }
}

/// Creates the typed owner of a [`StorageItem`].
pub trait StorageItemFactory {
    type Item;

    /// Declares the columns and token the item should have. Runs once per open, before any storage is touched.
    fn configure(&self, config: &mut ItemConfig) -> ItemRequirement;

    /// Wraps the opened storage. If this fails, the storage is closed again.
    fn create(
        &self,
        storage: Arc<StorageItem>,
    ) -> Result<Self::Item, Box<dyn Error + Send + Sync>>;
}

/// The outcome of reconciling an item manifest with a configuration.
#[derive(Debug)]
pub(crate) struct Reconciliation {
    pub manifest: ItemManifest,
    /// Column families that must be registered with the store.
    pub created: Vec<String>,
    /// Column families no longer referenced by this item.
    pub discarded: Vec<String>,
}

/// Computes the new item manifest. Pure apart from `allocate_family`, so it can be re-run when a transaction retries.
pub(crate) fn reconcile(
    item_name: &str,
    existing: Option<ItemManifest>,
    inode: u64,
    config: &ItemConfig,
    requirement: ItemRequirement,
    mut allocate_family: impl FnMut() -> Result<String, StoreError>,
) -> Result<Reconciliation, StoreError> {
    let mut is_new = existing.as_ref().map_or(true, |m| !m.initialized);
    let mut manifest = existing.unwrap_or_else(|| ItemManifest::empty(inode));
    let mut created = Vec::new();
    let mut discarded = Vec::new();

    if requirement == ItemRequirement::DeleteExistingAndCreate && !is_new {
        discarded.extend(std::mem::take(&mut manifest.columns).into_values());
        // The item is recreated from scratch, so no column can be "missing" from it.
        is_new = true;
    }

    for (column, column_requirement) in config.columns() {
        match column_requirement {
            ColumnRequirement::FailIfMissing => {
                if !is_new && !manifest.columns.contains_key(column) {
                    return Err(SchemaError::MissingColumn {
                        item: item_name.to_owned(),
                        column: column.to_owned(),
                    }
                    .into());
                }
            }
            ColumnRequirement::DeleteExistingAndCreate => {
                if let Some(family) = manifest.columns.remove(column) {
                    discarded.push(family);
                }
            }
            ColumnRequirement::CreateIfMissing => {}
        }
        if !manifest.columns.contains_key(column) {
            let family = allocate_family()?;
            created.push(family.clone());
            manifest.columns.insert(column.to_owned(), family);
        }
    }

    match &config.token {
        TokenChange::Keep => {}
        TokenChange::Set(token) => manifest.token = Some(token.clone()),
        TokenChange::Clear => manifest.token = None,
    }
    manifest.initialized = true;

    Ok(Reconciliation {
        manifest,
        created,
        discarded,
    })
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::super::manifest::family_name;
    use super::*;

    fn allocator() -> impl FnMut() -> Result<String, StoreError> {
        let mut next = 0;
        move || {
            next += 1;
            Ok(family_name(next))
        }
    }

    fn config_with(
        existing: Option<&ItemManifest>,
        columns: &[(&str, ColumnRequirement)],
    ) -> ItemConfig {
        let mut config = ItemConfig::new(existing);
        for (name, req) in columns {
            config.register_column(name, *req);
        }
        config
    }

    fn initialized(columns: &[(&str, &str)], token: Option<&[u8]>) -> ItemManifest {
        ItemManifest {
            inode: 1,
            columns: columns
                .iter()
                .map(|(c, f)| (c.to_string(), f.to_string()))
                .collect(),
            token: token.map(|t| t.to_vec()),
            initialized: true,
        }
    }

    #[test]
    fn duplicate_column_is_a_schema_error() {
        let mut config = ItemConfig::new(None);
        config
            .register_column("a", ColumnRequirement::CreateIfMissing)
            .register_column("a", ColumnRequirement::FailIfMissing);
        assert!(matches!(
            config.validate(),
            Err(SchemaError::DuplicateColumn(name)) if name == "a"
        ));
    }

    #[test]
    fn create_if_missing_reuses_existing_families() {
        let existing = initialized(&[("a", "cf-old")], None);
        let config = config_with(
            Some(&existing),
            &[
                ("a", ColumnRequirement::CreateIfMissing),
                ("b", ColumnRequirement::CreateIfMissing),
            ],
        );
        let r = reconcile("item", Some(existing), 1, &config, ItemRequirement::CreateIfMissing, allocator())
            .unwrap();
        assert_eq!(r.manifest.columns["a"], "cf-old");
        assert_eq!(r.manifest.columns["b"], family_name(1));
        assert_eq!(r.created, vec![family_name(1)]);
        assert!(r.discarded.is_empty());
    }

    #[test]
    fn fail_if_missing_only_fails_for_existing_items() {
        let existing = initialized(&[("a", "cf-old")], None);
        let columns = [("x", ColumnRequirement::FailIfMissing)];

        let config = config_with(Some(&existing), &columns);
        let err = reconcile("item", Some(existing), 1, &config, ItemRequirement::CreateIfMissing, allocator())
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(SchemaError::MissingColumn { .. })));

        let config = config_with(None, &columns);
        let r = reconcile("item", None, 1, &config, ItemRequirement::CreateIfMissing, allocator()).unwrap();
        assert!(r.manifest.columns.contains_key("x"));
        assert!(r.manifest.initialized);
    }

    #[test]
    fn delete_existing_column_discards_its_family() {
        let existing = initialized(&[("a", "cf-old"), ("b", "cf-keep")], None);
        let config = config_with(
            Some(&existing),
            &[("a", ColumnRequirement::DeleteExistingAndCreate)],
        );
        let r = reconcile("item", Some(existing), 1, &config, ItemRequirement::CreateIfMissing, allocator())
            .unwrap();
        assert_eq!(r.discarded, vec!["cf-old".to_string()]);
        assert_eq!(r.manifest.columns["a"], family_name(1));
        // Undeclared columns are left alone.
        assert_eq!(r.manifest.columns["b"], "cf-keep");
    }

    #[test]
    fn delete_existing_item_carries_token_forward() {
        let existing = initialized(&[("a", "cf-old")], Some(b"v1"));
        let config = config_with(Some(&existing), &[("x", ColumnRequirement::FailIfMissing)]);
        let r = reconcile(
            "item",
            Some(existing),
            1,
            &config,
            ItemRequirement::DeleteExistingAndCreate,
            allocator(),
        )
        .unwrap();
        assert_eq!(r.discarded, vec!["cf-old".to_string()]);
        assert_eq!(r.manifest.columns.len(), 1);
        assert_eq!(r.manifest.token.as_deref(), Some(&b"v1"[..]));
    }

    #[test]
    fn token_changes_apply() {
        let existing = initialized(&[], Some(b"v1"));
        let mut config = ItemConfig::new(Some(&existing));
        assert_eq!(config.existing_token(), Some(&b"v1"[..]));
        assert!(!config.is_new_item());
        config.set_token(b"v2".to_vec());
        let r = reconcile("item", Some(existing.clone()), 1, &config, ItemRequirement::CreateIfMissing, allocator())
            .unwrap();
        assert_eq!(r.manifest.token.as_deref(), Some(&b"v2"[..]));

        let mut config = ItemConfig::new(Some(&existing));
        config.clear_token();
        let r = reconcile("item", Some(existing), 1, &config, ItemRequirement::CreateIfMissing, allocator())
            .unwrap();
        assert_eq!(r.manifest.token, None);
    }
}
