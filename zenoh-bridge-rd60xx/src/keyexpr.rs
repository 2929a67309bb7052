//! Key expression builders and parsers for the PSU topic hierarchy.
//!
//! All keys live under a configurable prefix:
//!
//! - `{prefix}/psu/list/get` (subscribed) and `{prefix}/psu/list` (published)
//! - `{prefix}/psu/{identity}/state/get` and `.../state/set` (subscribed)
//! - `{prefix}/psu/{identity}/state` (published)

/// Default key expression prefix.
pub const DEFAULT_KEY_PREFIX: &str = "riden_psu";

/// Key the bridge listens on for list requests.
pub fn list_get_key(prefix: &str) -> String {
    format!("{prefix}/psu/list/get")
}

/// Key the PSU list is published on.
pub fn list_key(prefix: &str) -> String {
    format!("{prefix}/psu/list")
}

/// Wildcard matching every per-device state query.
pub fn state_get_wildcard(prefix: &str) -> String {
    format!("{prefix}/psu/*/state/get")
}

/// Wildcard matching every per-device state write.
pub fn state_set_wildcard(prefix: &str) -> String {
    format!("{prefix}/psu/*/state/set")
}

/// Key a device's state is published on.
pub fn state_key(prefix: &str, identity: &str) -> String {
    format!("{prefix}/psu/{identity}/state")
}

/// Extract the device identity from a `{prefix}/psu/{identity}/...` key.
///
/// Returns `None` for keys outside the per-device hierarchy (including the
/// list keys).
pub fn identity_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?.strip_prefix("/psu/")?;
    let (identity, _) = rest.split_once('/')?;
    if identity.is_empty() || identity == "list" {
        return None;
    }
    Some(identity)
}
