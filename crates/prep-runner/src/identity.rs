//! Participant identity assignment.
//!
//! Raw exports label participants with free-form strings. The identity map
//! turns them into dense integers; ids ending in a digit run are ordered by
//! that number ("s_2" before "s_10"), the rest follow in first-seen order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

const ANON_CODE_LEN: usize = 6;

fn trailing_digits_re() -> &'static Regex {
    static TRAILING_DIGITS_RE: OnceLock<Regex> = OnceLock::new();
    TRAILING_DIGITS_RE.get_or_init(|| Regex::new(r"[0-9]+$").expect("valid trailing digit regex"))
}

pub fn trailing_digits(value: &str) -> Option<&str> {
    trailing_digits_re().find(value).map(|m| m.as_str())
}

fn cmp_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdOrdering {
    /// Numeric-suffix ids sorted by suffix, then the rest by first appearance.
    #[default]
    NumericSuffix,
    FirstAppearance,
    /// Random six-letter codes from the run's anonymization map.
    Anonymized,
}

/// Bijection from original participant ids onto `0..n`, fixed at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantIdentityMap {
    order: Vec<String>,
    index: HashMap<String, usize>,
}

impl ParticipantIdentityMap {
    pub fn build<I, S>(values: I, ordering: IdOrdering) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut distinct: Vec<String> = Vec::new();
        for v in values {
            let v = v.as_ref();
            if seen.insert(v.to_string()) {
                distinct.push(v.to_string());
            }
        }

        let order = match ordering {
            IdOrdering::NumericSuffix => {
                let (mut with_suffix, without_suffix): (Vec<String>, Vec<String>) = distinct
                    .into_iter()
                    .partition(|v| trailing_digits(v).is_some());
                // stable: equal suffixes keep first-seen order
                with_suffix.sort_by(|a, b| {
                    cmp_digit_runs(
                        trailing_digits(a).unwrap_or_default(),
                        trailing_digits(b).unwrap_or_default(),
                    )
                });
                with_suffix.extend(without_suffix);
                with_suffix
            }
            IdOrdering::FirstAppearance | IdOrdering::Anonymized => distinct,
        };

        let index = order
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        Self { order, index }
    }

    pub fn get(&self, original: &str) -> Option<usize> {
        self.index.get(original).copied()
    }

    pub fn original(&self, dense: usize) -> Option<&str> {
        self.order.get(dense).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.order.iter().enumerate().map(|(i, v)| (v.as_str(), i))
    }
}

/// Original id to anonymous code, shared by every input of one run so the
/// same person gets the same code across files.
#[derive(Debug)]
pub struct AnonymizationMap {
    rng: StdRng,
    codes: HashMap<String, String>,
    used: HashSet<String>,
}

impl AnonymizationMap {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            codes: HashMap::new(),
            used: HashSet::new(),
        }
    }

    pub fn code_for(&mut self, original: &str) -> String {
        let key = original.trim().to_string();
        if let Some(code) = self.codes.get(&key) {
            return code.clone();
        }
        let code = loop {
            let candidate: String = (0..ANON_CODE_LEN)
                .map(|_| self.rng.gen_range(b'A'..=b'Z') as char)
                .collect();
            if self.used.insert(candidate.clone()) {
                break candidate;
            }
        };
        self.codes.insert(key, code.clone());
        code
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(map: &ParticipantIdentityMap, id: &str) -> usize {
        map.get(id).expect("id must be mapped")
    }

    #[test]
    fn suffix_numeric_order_beats_lexical_order() {
        let map = ParticipantIdentityMap::build(["a_10", "a_2"], IdOrdering::NumericSuffix);
        assert!(assigned(&map, "a_2") < assigned(&map, "a_10"));
    }

    #[test]
    fn mixed_ids_put_unsuffixed_last_in_first_seen_order() {
        let map =
            ParticipantIdentityMap::build(["x_3", "foo", "x_1", "bar", "foo"], IdOrdering::NumericSuffix);
        assert_eq!(assigned(&map, "x_1"), 0);
        assert_eq!(assigned(&map, "x_3"), 1);
        assert_eq!(assigned(&map, "foo"), 2);
        assert_eq!(assigned(&map, "bar"), 3);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn mapping_is_a_bijection_onto_dense_range() {
        let ids = ["p9", "zeta", "p10", "p01", "alpha", "p9", "p1000000000000000000000000"];
        let map = ParticipantIdentityMap::build(ids, IdOrdering::NumericSuffix);
        let mut dense: Vec<usize> = map.iter().map(|(_, i)| i).collect();
        dense.sort_unstable();
        assert_eq!(dense, (0..map.len()).collect::<Vec<_>>());
        for (orig, i) in map.iter() {
            assert_eq!(map.original(i), Some(orig));
        }
        assert_eq!(map.original(map.len() - 1), Some("alpha"));
    }

    #[test]
    fn equal_suffixes_keep_first_appearance() {
        let map = ParticipantIdentityMap::build(["b_1", "a_01", "c_1"], IdOrdering::NumericSuffix);
        assert_eq!(assigned(&map, "b_1"), 0);
        assert_eq!(assigned(&map, "a_01"), 1);
        assert_eq!(assigned(&map, "c_1"), 2);
    }

    #[test]
    fn non_ascii_digits_are_not_suffixes() {
        assert_eq!(trailing_digits("p\u{0663}"), None);
        assert_eq!(trailing_digits("ppt_0042"), Some("0042"));
    }

    #[test]
    fn first_appearance_ordering_is_plain_factorize() {
        let map = ParticipantIdentityMap::build(["s_2", "s_1"], IdOrdering::FirstAppearance);
        assert_eq!(assigned(&map, "s_2"), 0);
        assert_eq!(assigned(&map, "s_1"), 1);
    }

    #[test]
    fn anonymization_is_stable_within_a_run() {
        let mut anon = AnonymizationMap::new(42);
        let a = anon.code_for("5f1c9e");
        let b = anon.code_for("other");
        assert_eq!(anon.code_for(" 5f1c9e "), a);
        assert_ne!(a, b);
        assert_eq!(a.len(), ANON_CODE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_uppercase()));

        let mut replay = AnonymizationMap::new(42);
        assert_eq!(replay.code_for("5f1c9e"), a);
    }
}
