use crate::storage::StoreOptions;

/// Common options used when opening a relation for administrative commands.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Storage configuration.
    pub store: StoreOptions,
    /// Whether to create the relation if it doesn't exist.
    pub create_if_missing: bool,
}

impl AdminOpenOptions {
    /// Options wrapping `store`.
    pub fn new(store: StoreOptions) -> Self {
        Self {
            store,
            create_if_missing: false,
        }
    }
}
