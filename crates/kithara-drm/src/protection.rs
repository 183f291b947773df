#![forbid(unsafe_code)]

//! Protection initialization events.

use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::{ContentModel, KeyId};

/// One initialization data payload, optionally tagged with the DRM system id
/// it targets (lowercase hex, no dashes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InitDataValue {
    pub system_id: Option<String>,
    pub data: Bytes,
}

impl InitDataValue {
    pub fn new<B: Into<Bytes>>(system_id: Option<&str>, data: B) -> Self {
        Self {
            system_id: system_id.map(normalize_system_id),
            data: data.into(),
        }
    }
}

pub(crate) fn normalize_system_id(system_id: &str) -> String {
    system_id
        .chars()
        .filter(|c| *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Where in the content a protection event comes from.
#[derive(Clone)]
pub struct ContentLocus {
    pub manifest: Arc<dyn ContentModel>,
    pub period_id: String,
    pub adaptation_id: Option<String>,
    pub representation_id: Option<String>,
}

impl ContentLocus {
    pub fn new<S: Into<String>>(manifest: Arc<dyn ContentModel>, period_id: S) -> Self {
        Self {
            manifest,
            period_id: period_id.into(),
            adaptation_id: None,
            representation_id: None,
        }
    }

    #[must_use]
    pub fn with_adaptation<S: Into<String>>(mut self, adaptation_id: S) -> Self {
        self.adaptation_id = Some(adaptation_id.into());
        self
    }

    #[must_use]
    pub fn with_representation<S: Into<String>>(mut self, representation_id: S) -> Self {
        self.representation_id = Some(representation_id.into());
        self
    }
}

impl fmt::Debug for ContentLocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentLocus")
            .field("period_id", &self.period_id)
            .field("adaptation_id", &self.adaptation_id)
            .field("representation_id", &self.representation_id)
            .finish_non_exhaustive()
    }
}

/// Protection initialization event: encrypted content was encountered and
/// needs keys.
#[derive(Clone, Debug)]
pub struct ProtectionData {
    /// Initialization data format (`"cenc"`, `"keyids"`, `"webm"`...).
    pub init_data_type: String,
    /// Normalized payloads: sorted by system id, without duplicates.
    values: Vec<InitDataValue>,
    /// Key ids this data is known to need, when the container tells.
    pub key_ids: Option<Vec<KeyId>>,
    pub content: Option<ContentLocus>,
    /// Discard any compatible session and create a new one.
    pub force_session_recreation: bool,
}

impl ProtectionData {
    pub fn new<S, I>(init_data_type: S, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = InitDataValue>,
    {
        let mut values: Vec<InitDataValue> = values.into_iter().collect();
        values.sort();
        values.dedup();
        Self {
            init_data_type: init_data_type.into(),
            values,
            key_ids: None,
            content: None,
            force_session_recreation: false,
        }
    }

    #[must_use]
    pub fn with_key_ids<I: IntoIterator<Item = KeyId>>(mut self, key_ids: I) -> Self {
        self.key_ids = Some(key_ids.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: ContentLocus) -> Self {
        self.content = Some(content);
        self
    }

    #[must_use]
    pub fn with_forced_session_recreation(mut self) -> Self {
        self.force_session_recreation = true;
        self
    }

    pub fn values(&self) -> &[InitDataValue] {
        &self.values
    }

    /// Key ids declared by this data, `None` when unknown or empty.
    pub(crate) fn declared_key_ids(&self) -> Option<&[KeyId]> {
        self.key_ids.as_deref().filter(|k| !k.is_empty())
    }

    /// Same format and one payload list contained in the other.
    pub fn has_compatible_values(&self, other: &ProtectionData) -> bool {
        if self.init_data_type != other.init_data_type {
            return false;
        }
        let (small, big) = if self.values.len() <= other.values.len() {
            (&self.values, &other.values)
        } else {
            (&other.values, &self.values)
        };
        !small.is_empty() && small.iter().all(|v| big.contains(v))
    }

    /// Bytes handed to the key session when generating a license request.
    ///
    /// When `system_id` is known and some payloads target it, only those
    /// are sent; otherwise every payload is concatenated.
    pub fn construct_request_data(&self, system_id: Option<&str>) -> Bytes {
        let targeted: Vec<&InitDataValue> = match system_id {
            Some(id) => {
                let id = normalize_system_id(id);
                self.values
                    .iter()
                    .filter(|v| v.system_id.as_deref() == Some(id.as_str()))
                    .collect()
            }
            None => Vec::new(),
        };
        let selected: Vec<&InitDataValue> = if targeted.is_empty() {
            self.values.iter().collect()
        } else {
            targeted
        };

        if let [single] = selected.as_slice() {
            return single.data.clone();
        }
        let mut out = BytesMut::with_capacity(selected.iter().map(|v| v.data.len()).sum());
        for value in selected {
            out.extend_from_slice(&value.data);
        }
        out.freeze()
    }
}
