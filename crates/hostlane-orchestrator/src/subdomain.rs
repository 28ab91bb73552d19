// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subdomain labels: validation and deterministic suggestions.

const MAX_LABEL_LEN: usize = 63;

const LEADING: &[&str] = &[
    "swift", "brave", "happy", "lucky", "sunny", "jolly", "noble", "merry", "calm", "kind",
    "gentle", "witty", "clever", "cozy", "mellow", "amber", "azure", "teal", "coral", "indigo",
    "ruby", "jade", "pearl", "mint", "fox", "wolf", "otter", "lynx", "badger", "corgi",
];

const TRAILING: &[&str] = &[
    "oak", "pine", "maple", "birch", "cedar", "aspen", "willow", "spruce", "juniper", "walnut",
    "pear", "mango", "peach", "plum", "kiwi", "melon", "fig", "lotus", "tulip", "iris",
    "poppy", "clover", "orchid", "fox", "wolf", "otter", "lynx", "heron", "finch", "seal",
];

/// Validate a DNS label: 1-63 chars of `[a-z0-9-]`, no leading/trailing hyphen.
pub fn validate_label(label: &str) -> Result<(), String> {
    if label.is_empty() {
        return Err("subdomain must not be empty".to_string());
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!(
            "subdomain '{}' exceeds {} characters",
            label, MAX_LABEL_LEN
        ));
    }
    if let Some(c) = label
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(format!(
            "subdomain '{}' contains invalid character '{}'",
            label, c
        ));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(format!(
            "subdomain '{}' must not start or end with '-'",
            label
        ));
    }
    Ok(())
}

/// Suggest a memorable `word-word` label derived from `seed`.
///
/// Same seed, same label. Callers still check uniqueness.
pub fn suggest(seed: &str) -> String {
    let hash = seed
        .chars()
        .fold(0u64, |h, c| (h * 31 + c as u64) % 1_000_000_007);

    let first = LEADING[(hash % LEADING.len() as u64) as usize];
    let mut second_index = ((hash / 100) % TRAILING.len() as u64) as usize;
    if TRAILING[second_index] == first {
        second_index = (second_index + 1) % TRAILING.len();
    }

    format!("{}-{}", first, TRAILING[second_index])
}
