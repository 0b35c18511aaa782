// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-volume chunking/filter-chain option lists (§3, §4.4 ChangeOptions).
//! Stored as ordered name=value pairs, exactly as accepted by the dedup
//! engine's `ChangeOptions` (§6).

use serde::Deserialize;
use serde::Serialize;

/// `{filter_options, chunking_options}` as threaded through `ChangeOptions`
/// (§4.4): "separates filter-chain-options and chunking-options from the
/// input; delegates to dedup volume; on failure reverts to previously
/// saved sets."
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    pub filter_options: Vec<(String, String)>,
    pub chunking_options: Vec<(String, String)>,
}

/// Recognized option-name prefixes used to split a flat change-list into
/// the two sets ChangeOptions delegates separately (the core's own
/// naming convention, not a dedup-engine detail).
const FILTER_PREFIX: &str = "filter.";
const CHUNKING_PREFIX: &str = "chunking.";

impl VolumeOptions {
    /// Splits a flat `name=value` change-list into filter vs. chunking
    /// options based on the `filter.`/`chunking.` prefix; keys without
    /// either prefix are treated as chunking options (the default scope of
    /// the dedup engine's option surface).
    pub fn partition(changes: &[(String, String)]) -> VolumeOptions {
        let mut options = VolumeOptions::default();
        for (name, value) in changes {
            if let Some(rest) = name.strip_prefix(FILTER_PREFIX) {
                options.filter_options.push((rest.to_string(), value.clone()));
            } else if let Some(rest) = name.strip_prefix(CHUNKING_PREFIX) {
                options.chunking_options.push((rest.to_string(), value.clone()));
            } else {
                options.chunking_options.push((name.clone(), value.clone()));
            }
        }
        options
    }

    pub fn as_flat_list(&self) -> Vec<(String, String)> {
        let mut flat = Vec::with_capacity(self.filter_options.len() + self.chunking_options.len());
        flat.extend(
            self.filter_options
                .iter()
                .map(|(k, v)| (format!("{}{}", FILTER_PREFIX, k), v.clone())),
        );
        flat.extend(self.chunking_options.iter().cloned());
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_by_prefix() {
        let changes = vec![
            ("filter.dedup_enabled".to_string(), "true".to_string()),
            ("chunking.avg_chunk_size".to_string(), "8192".to_string()),
            ("other".to_string(), "x".to_string()),
        ];
        let options = VolumeOptions::partition(&changes);
        assert_eq!(
            options.filter_options,
            vec![("dedup_enabled".to_string(), "true".to_string())]
        );
        assert_eq!(options.chunking_options.len(), 2);
    }
}
