use crate::panel::UserInfo;
use std::collections::HashSet;

fn identity(user: &UserInfo) -> (&str, u64, usize) {
    (&user.uuid, user.speed_limit, user.device_limit)
}

/// Returns `(deleted, added)`.
///
/// A user whose limits changed shows up in both lists, so the limiter drops the old record
/// before installing the new one.
pub fn compare_user_list(old: &[UserInfo], new: &[UserInfo]) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let old_ids: HashSet<_> = old.iter().map(identity).collect();
    let new_ids: HashSet<_> = new.iter().map(identity).collect();

    let deleted = old
        .iter()
        .filter(|user| !new_ids.contains(&identity(user)))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|user| !old_ids.contains(&identity(user)))
        .cloned()
        .collect();
    (deleted, added)
}

/// Narrow a `(deleted, added)` diff to the uuids that actually left or joined.
///
/// Limit-only changes stay out of the result: the engine keeps those users registered, along
/// with their unreported traffic.
pub fn membership_changes(
    deleted: &[UserInfo],
    added: &[UserInfo],
) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let deleted_uuids: HashSet<&str> = deleted.iter().map(|user| user.uuid.as_str()).collect();
    let added_uuids: HashSet<&str> = added.iter().map(|user| user.uuid.as_str()).collect();

    let left = deleted
        .iter()
        .filter(|user| !added_uuids.contains(user.uuid.as_str()))
        .cloned()
        .collect();
    let joined = added
        .iter()
        .filter(|user| !deleted_uuids.contains(user.uuid.as_str()))
        .cloned()
        .collect();
    (left, joined)
}
