//! Store-snapshot comparator
//!
//! Certifies that two halted nodes' stores converged. Input is one
//! [`StoreDump`] per node: the key/value pairs in lexicographic key order
//! plus the store's last-applied counter. The comparison is an ordered
//! merge-diff; the verdict allows a bounded divergence when the counters
//! show one store is ahead of the other.

use std::collections::BTreeMap;

use log::{debug, error};
use serde::Serialize;
use thiserror::Error;

use crate::process::parse_counter_line;

/// Store-internal keys that legitimately differ between replicas (leases
/// and master pointers carry timestamps).
pub const EXEMPT_KEYS: [&str; 4] = ["*lease", "*lease2", "*i", "*master"];

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("malformed counter line {0:?}")]
    BadCounterLine(String),
    #[error("stores diverge in {count} key(s), {allowed} allowed\n{report}")]
    TooManyDivergences {
        count: usize,
        allowed: usize,
        report: DivergenceReport,
    },
}

/// Ordered export of one node's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDump {
    /// Last-applied sequence index reported by the store.
    pub counter: i64,
    /// Key/value pairs in lexicographic key order.
    pub entries: Vec<(String, String)>,
}

impl StoreDump {
    pub fn new(counter: i64, entries: Vec<(String, String)>) -> Self {
        StoreDump { counter, entries }
    }

    /// Parse `--dump-store` output: a counter line (`i: Some("…")` or
    /// `i: None`) followed by one `key<TAB>value` line per pair. A value
    /// may itself contain tabs; lines without a tab are skipped.
    pub fn parse(text: &str) -> Result<StoreDump, CompareError> {
        let mut lines = text.lines();
        let counter_line = lines.next().unwrap_or("");
        let counter = parse_counter_line(counter_line)
            .ok_or_else(|| CompareError::BadCounterLine(counter_line.to_string()))?;
        let mut entries = Vec::new();
        for line in lines {
            if let Some((key, value)) = line.split_once('\t') {
                entries.push((key.to_string(), value.to_string()));
            }
        }
        Ok(StoreDump { counter, entries })
    }
}

/// Outcome of the merge-diff between two dumps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DivergenceReport {
    pub left_node: String,
    pub right_node: String,
    /// Keys present only in the left dump.
    pub left_only: BTreeMap<String, String>,
    /// Keys present only in the right dump.
    pub right_only: BTreeMap<String, String>,
    /// Keys present in both with differing values: key -> (left, right).
    pub conflicting: BTreeMap<String, (String, String)>,
    /// Last-applied counters (left, right).
    pub counters: (i64, i64),
}

impl DivergenceReport {
    /// Total number of diverging keys, one-sided and conflicting alike.
    pub fn divergence_count(&self) -> usize {
        self.left_only.len() + self.right_only.len() + self.conflicting.len()
    }

    /// Absolute counter skew between the two stores.
    pub fn skew(&self) -> i64 {
        (self.counters.0 - self.counters.1).abs()
    }

    /// Divergences tolerated at this skew: one store may be a single
    /// applied entry ahead; at equal counters nothing may differ.
    pub fn allowed_divergences(&self) -> usize {
        if self.skew() != 0 {
            1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.divergence_count() == 0
    }
}

impl std::fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// Ordered merge-diff of two dumps. Both inputs must be sorted by key;
/// `exempt` keys never count as conflicts (they may still show up as
/// one-sided divergences, matching the store's own audit semantics).
pub fn diff_dumps(
    left_node: &str,
    left: &StoreDump,
    right_node: &str,
    right: &StoreDump,
    exempt: &[&str],
) -> DivergenceReport {
    let mut report = DivergenceReport {
        left_node: left_node.to_string(),
        right_node: right_node.to_string(),
        counters: (left.counter, right.counter),
        ..Default::default()
    };

    let ls = &left.entries;
    let rs = &right.entries;
    let (mut i, mut j) = (0, 0);

    while i < ls.len() && j < rs.len() {
        let (lk, lv) = &ls[i];
        let (rk, rv) = &rs[j];
        match lk.cmp(rk) {
            std::cmp::Ordering::Equal => {
                if lv != rv && !exempt.contains(&lk.as_str()) {
                    debug!("stores have different values for {lk}");
                    report
                        .conflicting
                        .insert(lk.clone(), (lv.clone(), rv.clone()));
                }
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => {
                debug!("store of {left_node} has a value for {lk}, store of {right_node} doesn't");
                report.left_only.insert(lk.clone(), lv.clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                debug!("store of {right_node} has a value for {rk}, store of {left_node} doesn't");
                report.right_only.insert(rk.clone(), rv.clone());
                j += 1;
            }
        }
    }
    for (k, v) in &ls[i..] {
        report.left_only.insert(k.clone(), v.clone());
    }
    for (k, v) in &rs[j..] {
        report.right_only.insert(k.clone(), v.clone());
    }
    report
}

/// Diff two dumps and apply the bounded-divergence verdict. The failing
/// case carries the full report for post-mortem inspection.
pub fn certify(
    left_node: &str,
    left: &StoreDump,
    right_node: &str,
    right: &StoreDump,
    exempt: &[&str],
) -> Result<DivergenceReport, CompareError> {
    let report = diff_dumps(left_node, left, right_node, right, exempt);
    if report.skew() > 1 {
        error!(
            "store counters differ too much ({left_node}: {}, {right_node}: {})",
            left.counter, right.counter
        );
    }
    let count = report.divergence_count();
    let allowed = report.allowed_divergences();
    if count > allowed {
        return Err(CompareError::TooManyDivergences {
            count,
            allowed,
            report,
        });
    }
    debug!("stores of {left_node} and {right_node} are valid");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump(counter: i64, pairs: &[(&str, &str)]) -> StoreDump {
        StoreDump::new(
            counter,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn identical_dumps_pass() {
        let a = dump(10, &[("k1", "v1"), ("k2", "v2")]);
        let b = dump(10, &[("k1", "v1"), ("k2", "v2")]);
        let report = certify("a", &a, "b", &b, &EXEMPT_KEYS).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn single_conflict_fails_at_zero_skew() {
        let a = dump(10, &[("k1", "v1")]);
        let b = dump(10, &[("k1", "v1x")]);
        let err = certify("a", &a, "b", &b, &EXEMPT_KEYS).unwrap_err();
        match err {
            CompareError::TooManyDivergences {
                count,
                allowed,
                report,
            } => {
                assert_eq!(count, 1);
                assert_eq!(allowed, 0);
                assert_eq!(
                    report.conflicting.get("k1"),
                    Some(&("v1".to_string(), "v1x".to_string()))
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn single_conflict_tolerated_at_skew_one() {
        let a = dump(10, &[("k1", "v1")]);
        let b = dump(11, &[("k1", "v1x")]);
        let report = certify("a", &a, "b", &b, &EXEMPT_KEYS).unwrap();
        assert_eq!(report.divergence_count(), 1);
        assert_eq!(report.allowed_divergences(), 1);
    }

    #[test]
    fn one_sided_key_lands_in_that_nodes_map() {
        let a = dump(10, &[("k1", "v1"), ("k2", "v2")]);
        let b = dump(11, &[("k1", "v1")]);
        let report = certify("a", &a, "b", &b, &EXEMPT_KEYS).unwrap();
        assert_eq!(report.left_only.get("k2"), Some(&"v2".to_string()));
        assert!(report.right_only.is_empty());
        assert!(report.conflicting.is_empty());
    }

    #[test]
    fn exempt_keys_do_not_conflict() {
        let a = dump(10, &[("*lease", "a@1"), ("*master", "n0"), ("k", "v")]);
        let b = dump(10, &[("*lease", "b@2"), ("*master", "n1"), ("k", "v")]);
        let report = certify("a", &a, "b", &b, &EXEMPT_KEYS).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn two_divergences_exceed_zero_tolerance() {
        // k2 conflicts on both sides, k3 exists only on the right.
        let a = dump(10, &[("k1", "v1"), ("k2", "v2")]);
        let b = dump(10, &[("k1", "v1"), ("k2", "v2x"), ("k3", "v3")]);
        let err = certify("A", &a, "B", &b, &EXEMPT_KEYS).unwrap_err();
        match err {
            CompareError::TooManyDivergences {
                count,
                allowed,
                report,
            } => {
                assert_eq!(count, 2);
                assert_eq!(allowed, 0);
                assert!(report.left_only.is_empty());
                assert_eq!(report.right_only.get("k3"), Some(&"v3".to_string()));
                assert_eq!(
                    report.conflicting.get("k2"),
                    Some(&("v2".to_string(), "v2x".to_string()))
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stream_exhaustion_drains_remainder() {
        let a = dump(5, &[("a", "1")]);
        let b = dump(5, &[("a", "1"), ("b", "2"), ("c", "3")]);
        let report = diff_dumps("a", &a, "b", &b, &EXEMPT_KEYS);
        assert_eq!(report.right_only.len(), 2);
        assert_eq!(report.divergence_count(), 2);
    }

    #[test]
    fn parses_dump_text() {
        let text = "i: Some(\"19999\")\nk1\tv1\nk2\tv2\twith\ttabs\nnotab\n";
        let dump = StoreDump::parse(text).unwrap();
        assert_eq!(dump.counter, 19999);
        assert_eq!(
            dump.entries,
            vec![
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2\twith\ttabs".to_string()),
            ]
        );
    }

    #[test]
    fn parses_empty_store_dump() {
        let dump = StoreDump::parse("i: None\n").unwrap();
        assert_eq!(dump.counter, 0);
        assert!(dump.entries.is_empty());
    }

    #[test]
    fn rejects_garbage_counter_line() {
        let err = StoreDump::parse("hello\nk\tv\n").unwrap_err();
        assert!(matches!(err, CompareError::BadCounterLine(_)));
    }
}
