// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Naming scheme for external resources.
//!
//! The control plane only accepts short DNS-label style identifiers, and a
//! project name plus a cluster name must together fit in
//! [`COMBINED_NAME_LIMIT`] characters. Every name produced here has an exact,
//! fixed length:
//!
//! ```text
//!   "Acme Corp"  ──sanitize──►  "acmeco" + sha256("Acme Corp")[..4]  = "acmeco5c1f"
//!   "Acme-Corp"  ──sanitize──►  "acmeco" + sha256("Acme-Corp")[..4]  = "acmeco91be"
//! ```
//!
//! The suffix hashes the raw, unsanitized input, so inputs that sanitize and
//! truncate to the same prefix still produce different names.
//!
//! Names are derived caches. The durable join key for anything created
//! externally is the owner UUID label, never the name.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Total length of a project (external container) name.
pub const PROJECT_NAME_LEN: usize = 10;

/// Sanitized prefix length within a project name.
pub const PROJECT_PREFIX_LEN: usize = 6;

/// Total length of a cluster (external resource) name.
pub const CLUSTER_NAME_LEN: usize = 11;

/// Sanitized prefix length within a cluster name.
pub const CLUSTER_PREFIX_LEN: usize = 6;

/// Platform limit on project name length plus cluster name length.
pub const COMBINED_NAME_LIMIT: usize = 21;

const _: () = assert!(PROJECT_NAME_LEN + CLUSTER_NAME_LEN <= COMBINED_NAME_LIMIT);
const _: () = assert!(PROJECT_PREFIX_LEN >= 1 && PROJECT_PREFIX_LEN < PROJECT_NAME_LEN);
const _: () = assert!(CLUSTER_PREFIX_LEN >= 1 && CLUSTER_PREFIX_LEN < CLUSTER_NAME_LEN);

/// Characters allowed in generated suffixes.
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Prepended when the sanitized input does not start with a letter.
const LEADING_CHAR: char = 'x';

/// Fills short prefixes up to their fixed length.
const PAD_CHAR: char = '0';

/// Derive a deterministic name of exactly `total_len` characters.
///
/// The first `prefix_len` characters are the lowercased alphanumeric
/// characters of `raw` (padded or truncated, always starting with a letter);
/// the rest is a hex suffix of the SHA-256 of the raw input.
///
/// `prefix_len` is clamped to `1..=total_len`. A `total_len` of zero yields
/// an empty string.
pub fn derive_name(raw: &str, prefix_len: usize, total_len: usize) -> String {
    if total_len == 0 {
        return String::new();
    }
    let prefix_len = prefix_len.clamp(1, total_len);

    let mut name = sanitized_prefix(raw, prefix_len);
    name.push_str(&hash_suffix(raw, total_len - prefix_len));
    name
}

/// Derive a process-unique name of exactly `total_len` characters.
///
/// Same prefix as [`derive_name`], followed by a random suffix drawn from a
/// cryptographically secure generator. Use this for resources whose identity
/// is carried by a label rather than by the name.
pub fn derive_unique_name(raw: &str, prefix_len: usize, total_len: usize) -> String {
    if total_len == 0 {
        return String::new();
    }
    let prefix_len = prefix_len.clamp(1, total_len);

    let mut name = sanitized_prefix(raw, prefix_len);
    let mut rng = rand::thread_rng();
    for _ in prefix_len..total_len {
        let idx = rng.gen_range(0..SUFFIX_ALPHABET.len());
        name.push(SUFFIX_ALPHABET[idx] as char);
    }
    name
}

/// Deterministic project name for an organization.
pub fn project_name(organization_name: &str) -> String {
    derive_name(organization_name, PROJECT_PREFIX_LEN, PROJECT_NAME_LEN)
}

/// Fresh cluster resource name, used when the resource is first created.
pub fn cluster_name(cluster_name: &str) -> String {
    derive_unique_name(cluster_name, CLUSTER_PREFIX_LEN, CLUSTER_NAME_LEN)
}

fn sanitized_prefix(raw: &str, len: usize) -> String {
    let mut prefix: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if !prefix.starts_with(|c: char| c.is_ascii_lowercase()) {
        prefix.insert(0, LEADING_CHAR);
    }

    // ASCII only past the filter, so byte truncation is char-safe.
    prefix.truncate(len);
    while prefix.len() < len {
        prefix.push(PAD_CHAR);
    }
    prefix
}

fn hash_suffix(raw: &str, len: usize) -> String {
    let mut suffix = String::with_capacity(len + 64);
    let mut digest = Sha256::digest(raw.as_bytes());
    while suffix.len() < len {
        suffix.push_str(&hex::encode(digest));
        digest = Sha256::digest(digest.as_slice());
    }
    suffix.truncate(len);
    suffix
}
