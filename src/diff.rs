//! Target-set computation: which remote files must be (re)fetched.
//!
//! Everything here is pure except [`missing_on_disk`], which only stats.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Files to fetch given the current remote listing and the last recorded
/// local manifest.
///
/// With no manifest every remote file is a target. Otherwise a file is a
/// target when its timestamp changed or when it was never recorded. Files
/// recorded locally but gone from the remote are not targets.
pub fn compute_targets(
    remote: &BTreeMap<String, String>,
    local: Option<&BTreeMap<String, String>>,
) -> BTreeSet<String> {
    let Some(local) = local else {
        return remote.keys().cloned().collect();
    };
    remote
        .iter()
        .filter(|(name, remote_ts)| local.get(name.as_str()) != Some(*remote_ts))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Files recorded locally that the remote no longer lists.
pub fn removed_remotely(
    remote: &BTreeMap<String, String>,
    local: Option<&BTreeMap<String, String>>,
) -> BTreeSet<String> {
    local
        .map(|local| {
            local
                .keys()
                .filter(|name| !remote.contains_key(name.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Of `names`, those with no file in `dir`.
pub fn missing_on_disk<'a>(dir: &Path, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    names
        .into_iter()
        .filter(|name| !dir.join(name).is_file())
        .map(str::to_string)
        .collect()
}
