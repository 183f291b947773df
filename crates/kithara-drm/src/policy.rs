#![forbid(unsafe_code)]

//! Key-id decipherability rules, depending on the license scope.

use crate::{
    ContentModel, KeyId, KeySessionRecord, ProtectionData,
    config::SingleLicensePer,
    key_id::{
        are_all_key_ids_contained_in, are_some_key_ids_contained_in, is_key_id_contained_in,
        merge_key_ids,
    },
};

/// Last known key-id decipherability of one session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct KeyStatuses {
    pub whitelisted: Vec<KeyId>,
    pub blacklisted: Vec<KeyId>,
}

impl KeyStatuses {
    fn contains(&self, key_id: &KeyId) -> bool {
        is_key_id_contained_in(key_id, &self.whitelisted)
            || is_key_id_contained_in(key_id, &self.blacklisted)
    }
}

/// Whether a session with `statuses` cannot decrypt `requested`.
///
/// With one license per init data, only an explicit blacklisting counts.
/// With wider license scopes the license is authoritative, so every key id
/// it does not whitelist is undecipherable.
pub(crate) fn is_undecipherable(
    policy: SingleLicensePer,
    requested: &[KeyId],
    statuses: &KeyStatuses,
) -> bool {
    match policy {
        SingleLicensePer::InitData => {
            are_some_key_ids_contained_in(requested, &statuses.blacklisted)
        }
        SingleLicensePer::Content | SingleLicensePer::Periods => {
            !are_all_key_ids_contained_in(requested, &statuses.whitelisted)
        }
    }
}

/// Key ids a key status update applies to.
///
/// Starts from the ids reported by the session, then marks as blacklisted
/// every id the session was expected to cover but did not report.
/// `is_current_license` is set when the session fetched its license itself,
/// in which case the license scope extends the expected ids.
pub(crate) fn key_ids_linked_to_session(
    data: &ProtectionData,
    record: &KeySessionRecord,
    policy: SingleLicensePer,
    is_current_license: bool,
    whitelisted: &[KeyId],
    blacklisted: &[KeyId],
) -> KeyStatuses {
    let mut linked = KeyStatuses {
        whitelisted: Vec::new(),
        blacklisted: Vec::new(),
    };
    merge_key_ids(&mut linked.whitelisted, whitelisted.iter().cloned());
    merge_key_ids(
        &mut linked.blacklisted,
        blacklisted
            .iter()
            .filter(|k| !is_key_id_contained_in(k, whitelisted))
            .cloned(),
    );

    let missing = |ids: &[KeyId], linked: &mut KeyStatuses| {
        let absent: Vec<KeyId> = ids.iter().filter(|k| !linked.contains(k)).cloned().collect();
        merge_key_ids(&mut linked.blacklisted, absent);
    };

    missing(record.associated_key_ids(), &mut linked);

    if policy == SingleLicensePer::InitData {
        return linked;
    }

    if let Some(key_ids) = data.key_ids.as_deref() {
        missing(key_ids, &mut linked);
    }

    let Some(content) = data.content.as_ref().filter(|_| is_current_license) else {
        return linked;
    };
    let manifest = content.manifest.as_ref();
    match policy {
        SingleLicensePer::Content => {
            missing(&content_key_ids(manifest), &mut linked);
        }
        SingleLicensePer::Periods => {
            let reported: Vec<KeyId> = whitelisted.iter().chain(blacklisted).cloned().collect();
            for period_id in manifest.period_ids() {
                let period_key_ids = manifest.key_ids_for_period(&period_id);
                if period_id == content.period_id
                    || are_some_key_ids_contained_in(&period_key_ids, &reported)
                {
                    missing(&period_key_ids, &mut linked);
                }
            }
        }
        SingleLicensePer::InitData => {}
    }
    linked
}

/// Every key id of the content, in period order.
pub(crate) fn content_key_ids(manifest: &dyn ContentModel) -> Vec<KeyId> {
    let mut all = Vec::new();
    for period_id in manifest.period_ids() {
        merge_key_ids(&mut all, manifest.key_ids_for_period(&period_id));
    }
    all
}
