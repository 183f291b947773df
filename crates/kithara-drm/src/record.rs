#![forbid(unsafe_code)]

use crate::{
    KeyId, ProtectionData,
    key_id::{are_all_key_ids_contained_in, is_key_id_contained_in, merge_key_ids},
};

/// What a key session is known to cover: the protection data it was
/// created for, plus every key id later linked to it.
///
/// The associated key ids only ever grow.
#[derive(Clone, Debug)]
pub struct KeySessionRecord {
    init_data: ProtectionData,
    key_ids: Option<Vec<KeyId>>,
}

impl KeySessionRecord {
    pub fn new(init_data: ProtectionData) -> Self {
        Self {
            init_data,
            key_ids: None,
        }
    }

    pub fn init_data(&self) -> &ProtectionData {
        &self.init_data
    }

    pub fn associate_key_ids<I: IntoIterator<Item = KeyId>>(&mut self, key_ids: I) {
        merge_key_ids(self.key_ids.get_or_insert_with(Vec::new), key_ids);
    }

    pub fn is_associated_with_key_id(&self, key_id: &KeyId) -> bool {
        self.key_ids
            .as_deref()
            .is_some_and(|ids| is_key_id_contained_in(key_id, ids))
    }

    pub fn associated_key_ids(&self) -> &[KeyId] {
        self.key_ids.as_deref().unwrap_or_default()
    }

    /// Whether a session built for this record can serve `data`.
    pub fn is_compatible_with(&self, data: &ProtectionData) -> bool {
        if let Some(wanted) = data.declared_key_ids() {
            if let Some(associated) = self.key_ids.as_deref()
                && are_all_key_ids_contained_in(wanted, associated)
            {
                return true;
            }
            if let Some(own) = self.init_data.key_ids.as_deref() {
                return are_all_key_ids_contained_in(wanted, own);
            }
        }
        self.init_data.has_compatible_values(data)
    }
}
