//! Per-depot cache/no-cache decision.
//!
//! The configured depot list is small (tens to low hundreds of entries), so
//! it is kept as a sorted, deduplicated `Vec<u32>` and probed with a binary
//! search.  If an operator needs to cache more depots than that, `cache_all`
//! is the better knob.

use tracing::{info, warn};

use crate::config::SteamConfig;

/// Immutable caching policy built once at startup.
#[derive(Debug, Clone, Default)]
pub struct DepotPolicy {
    /// Sorted ascending, no duplicates.
    depots: Vec<u32>,
    cache_all: bool,
}

impl DepotPolicy {
    /// Build a policy from an arbitrary list of depot ids.
    pub fn new(depots: impl IntoIterator<Item = u32>, cache_all: bool) -> Self {
        let mut depots: Vec<u32> = depots.into_iter().collect();
        depots.sort_unstable();
        depots.dedup();
        Self { depots, cache_all }
    }

    /// Build a policy from the `steam` config section and log what will be
    /// cached.
    pub fn from_config(config: &SteamConfig) -> Self {
        let policy = Self::new(config.depots.iter().copied(), config.cache_all);
        if policy.cache_all() {
            info!("caching all depots");
        } else {
            info!(depots = ?policy.depots(), "caching depots");
        }
        policy
    }

    pub fn depots(&self) -> &[u32] {
        &self.depots
    }

    pub fn cache_all(&self) -> bool {
        self.cache_all
    }

    /// Whether `depot` is explicitly listed.  Ids that are not plain decimal
    /// `u32` values are never listed.
    pub fn has_depot(&self, depot: &str) -> bool {
        match parse_depot_id(depot) {
            Some(id) => self.depots.binary_search(&id).is_ok(),
            None => {
                warn!(%depot, "could not parse depot ID as u32");
                false
            }
        }
    }

    /// Decide whether content for `depot` should be persisted locally.
    ///
    /// `bypass` is the global kill-switch and wins over everything else.
    pub fn should_cache(&self, depot: &str, bypass: bool) -> bool {
        if bypass {
            return false;
        }
        self.cache_all || self.has_depot(depot)
    }
}

/// Parse a depot id: ASCII digits only, no sign, fits in a `u32`.
fn parse_depot_id(depot: &str) -> Option<u32> {
    if depot.is_empty() || !depot.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    depot.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sorts_and_dedups() {
        let policy = DepotPolicy::new([731, 228980, 730, 731, 5], false);
        assert_eq!(policy.depots(), &[5, 730, 731, 228980]);
    }

    #[test]
    fn listed_depot_is_cached() {
        let policy = DepotPolicy::new([730], false);
        assert!(policy.should_cache("730", false));
    }

    #[test]
    fn unlisted_depot_is_skipped() {
        let policy = DepotPolicy::new([730], false);
        assert!(!policy.should_cache("440", false));
    }

    #[test]
    fn cache_all_covers_unlisted_and_malformed() {
        let policy = DepotPolicy::new([], true);
        assert!(policy.should_cache("440", false));
        assert!(policy.should_cache("not-a-depot", false));
    }

    #[test]
    fn bypass_wins_over_everything() {
        let policy = DepotPolicy::new([730], true);
        assert!(!policy.should_cache("730", true));
        assert!(!policy.should_cache("440", true));
    }

    #[test]
    fn malformed_ids_are_not_cacheable() {
        let policy = DepotPolicy::new([730], false);
        for depot in ["", "abc", "-730", "+730", "7 30", "730.0", "4294967296"] {
            assert!(!policy.should_cache(depot, false), "{depot:?}");
        }
    }

    #[test]
    fn boundary_ids_parse() {
        let policy = DepotPolicy::new([0, u32::MAX], false);
        assert!(policy.has_depot("0"));
        assert!(policy.has_depot("4294967295"));
        assert!(policy.has_depot("00730") == policy.has_depot("730"));
    }

    #[test]
    fn decision_is_deterministic() {
        let sets: [&[u32]; 3] = [&[], &[1, 2, 3], &[730, 731, 440]];
        for set in sets {
            for cache_all in [false, true] {
                let policy = DepotPolicy::new(set.iter().copied(), cache_all);
                for bypass in [false, true] {
                    for depot in ["1", "440", "730", "x", ""] {
                        let first = policy.should_cache(depot, bypass);
                        let second = policy.clone().should_cache(depot, bypass);
                        assert_eq!(first, second);
                    }
                }
            }
        }
    }
}
