//! # SSH Key Metadata Merge
//!
//! Computes the updated metadata item list for injecting an SSH public key
//! into an instance's `ssh-keys` entry without clobbering existing keys.
//!
//! The `ssh-keys` value is a newline-delimited list of
//! `user:keytype key-material user` entries. Merging is idempotent: for a
//! given (user, key-material) pair at most one entry exists afterwards.
//! Malformed lines are skipped and preserved verbatim, never a crash.

use tracing::{debug, warn};

use crate::provider::MetadataItem;

/// Metadata key the provider reserves for SSH trust material
pub const SSH_KEYS_KEY: &str = "ssh-keys";

/// Merge `public_key` for `user` into `items`, returning the updated item
/// list and whether anything changed.
///
/// `public_key` is the usual `keytype key-material comment` form; only the
/// key material is compared, so the same key re-exported with a different
/// comment still counts as present.
pub fn merge_ssh_key(
    items: &[MetadataItem],
    user: &str,
    public_key: &str,
) -> (Vec<MetadataItem>, bool) {
    let fields: Vec<&str> = public_key.split_whitespace().collect();
    if fields.len() < 2 {
        warn!("public key for user {user} has no key material, skipping merge");
        return (items.to_vec(), false);
    }
    let key_material = fields[1];
    let entry = format!("{user}:ssh-rsa {key_material} {user}");

    let mut updated = items.to_vec();
    for item in &mut updated {
        if item.key != SSH_KEYS_KEY {
            continue;
        }
        for line in item.value.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 3 {
                warn!("skipping malformed ssh-keys line {line:?}");
                continue;
            }
            if tokens[1] == key_material && tokens[2] == user {
                debug!("key for user {user} already present");
                return (items.to_vec(), false);
            }
        }
        item.value = format!("{}\n{}", item.value, entry);
        return (updated, true);
    }

    updated.push(MetadataItem::new(SSH_KEYS_KEY, entry));
    (updated, true)
}
