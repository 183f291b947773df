#![forbid(unsafe_code)]

//! Classification of the key statuses reported by a key session.

use crate::{
    DrmError, KeyId,
    config::{KeyStatusAction, KeyStatusOptions},
    key_id::merge_key_ids,
    types::{KeyStatus, KeyStatusEntry},
};

/// Key ids sorted by decipherability after one status check.
#[derive(Clone, Debug, Default)]
pub(crate) struct CheckedKeyStatuses {
    pub whitelisted: Vec<KeyId>,
    pub blacklisted: Vec<KeyId>,
    /// Tolerated problematic statuses, reported once.
    pub warning: Option<DrmError>,
}

/// A status check that cannot continue with the session.
#[derive(Clone, Debug)]
pub(crate) enum KeyStatusFailure {
    /// Stop the decryptor.
    Fatal(DrmError),
    /// Close the session and forget it.
    Decommission(DrmError),
}

pub(crate) fn check_key_statuses(
    statuses: &[KeyStatusEntry],
    options: &KeyStatusOptions,
) -> Result<CheckedKeyStatuses, KeyStatusFailure> {
    let mut checked = CheckedKeyStatuses::default();
    let mut problematic: Vec<KeyStatusEntry> = Vec::new();

    for entry in statuses {
        let action = match entry.status {
            KeyStatus::Expired => options.on_key_expiration,
            KeyStatus::InternalError => options.on_key_internal_error,
            KeyStatus::OutputRestricted => options.on_key_output_restricted,
            _ => {
                merge_key_ids(&mut checked.whitelisted, [entry.key_id.clone()]);
                continue;
            }
        };

        let error = status_error(entry);
        match action {
            KeyStatusAction::Error => return Err(KeyStatusFailure::Fatal(error)),
            KeyStatusAction::CloseSession => return Err(KeyStatusFailure::Decommission(error)),
            KeyStatusAction::Fallback => {
                merge_key_ids(&mut checked.blacklisted, [entry.key_id.clone()]);
            }
            KeyStatusAction::Continue => {
                merge_key_ids(&mut checked.whitelisted, [entry.key_id.clone()]);
            }
        }
        problematic.push(entry.clone());
    }

    if !problematic.is_empty() {
        let message = format!(
            "{} key(s) with problematic status: {}",
            problematic.len(),
            problematic
                .iter()
                .map(|e| format!("{}={}", e.key_id, e.status.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        checked.warning = Some(DrmError::KeyStatusChange {
            message,
            key_statuses: problematic,
        });
    }
    Ok(checked)
}

fn status_error(entry: &KeyStatusEntry) -> DrmError {
    DrmError::KeyStatusChange {
        message: format!("key {} is {}", entry.key_id, entry.status.as_str()),
        key_statuses: vec![entry.clone()],
    }
}
