//! Contradiction detection between evidence units
//!
//! Two units conflict when they talk about the same subject and disagree:
//! the same configuration key with different values, opposite polarity, or
//! different quantities for the same unit. Conflicting units share a
//! `contradiction_group`; neither is discarded.

use super::claims::{self, key_value, number_value};
use super::{Evidence, EvidenceType};
use lodestar_common::text;
use std::collections::{BTreeMap, HashMap, HashSet};

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "cannot", "without", "none", "neither", "nor", "doesn", "isn", "aren", "won",
    "don", "didn", "can't", "wasn", "shouldn",
];

/// Minimum subject overlap (Jaccard) for two statements to be comparable
const SUBJECT_OVERLAP: f32 = 0.6;

struct Statement {
    key_value: Option<(String, String)>,
    subject: HashSet<String>,
    negated: bool,
    quantities: BTreeMap<String, f64>,
}

impl Statement {
    fn parse(evidence: &Evidence) -> Self {
        let lower = evidence.text.to_lowercase();
        let words = claims::words(&lower);
        let negated = words.iter().filter(|w| NEGATIONS.contains(w)).count() % 2 == 1;

        let subject = claims::claim_terms(&evidence.text)
            .into_iter()
            .filter(|t| !claims::is_number(t) && !NEGATIONS.contains(&t.as_str()))
            .collect();

        Self {
            key_value: key_value(evidence.text.trim()),
            subject,
            negated,
            quantities: quantities(&words),
        }
    }

    fn conflicts_with(&self, other: &Statement) -> bool {
        if let (Some((key_a, value_a)), Some((key_b, value_b))) = (&self.key_value, &other.key_value) {
            return key_a == key_b && !value_a.eq_ignore_ascii_case(value_b);
        }

        if self.subject.len() < 2 || other.subject.len() < 2 {
            return false;
        }
        let shared = self.subject.intersection(&other.subject).count();
        let union = self.subject.union(&other.subject).count();
        if (shared as f32 / union as f32) < SUBJECT_OVERLAP {
            return false;
        }

        if self.negated != other.negated {
            return true;
        }
        self.quantities
            .iter()
            .any(|(unit, value)| other.quantities.get(unit).is_some_and(|v| (v - value).abs() > f64::EPSILON))
    }
}

/// Numbers keyed by the unit they count: the next content word, else the previous one
fn quantities(words: &[&str]) -> BTreeMap<String, f64> {
    let mut found = BTreeMap::new();
    for (idx, word) in words.iter().enumerate() {
        let Some(value) = number_value(word) else {
            continue;
        };
        let is_unit = |w: &&&str| !text::is_stop_word(w) && !claims::is_number(w);
        let unit = words[idx + 1..]
            .iter()
            .find(is_unit)
            .or_else(|| words[..idx].iter().rev().find(is_unit));
        if let Some(unit) = unit {
            found.entry(text::stem(unit)).or_insert(value);
        }
    }
    found
}

fn eligible(evidence_type: EvidenceType) -> bool {
    matches!(
        evidence_type,
        EvidenceType::Definition | EvidenceType::Assertion | EvidenceType::Configuration | EvidenceType::Metadata
    )
}

/// Assign contradiction groups in place; returns the number of groups
pub fn flag_contradictions(items: &mut [Evidence]) -> usize {
    let statements: Vec<Option<Statement>> = items
        .iter()
        .map(|e| eligible(e.evidence_type).then(|| Statement::parse(e)))
        .collect();

    let mut parent: Vec<usize> = (0..items.len()).collect();
    let mut conflicted = vec![false; items.len()];

    for i in 0..items.len() {
        let Some(a) = &statements[i] else { continue };
        for j in (i + 1)..items.len() {
            let Some(b) = &statements[j] else { continue };
            // Evidence from the same claim region never contradicts itself
            if items[i].chunk_id == items[j].chunk_id && items[i].lines == items[j].lines {
                continue;
            }
            if a.conflicts_with(b) {
                union(&mut parent, i, j);
                conflicted[i] = true;
                conflicted[j] = true;
            }
        }
    }

    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for idx in 0..items.len() {
        if !conflicted[idx] {
            continue;
        }
        let root = find(&mut parent, idx);
        let next = group_of_root.len() + 1;
        let group = *group_of_root.entry(root).or_insert(next);
        items[idx].contradiction_group = Some(group);
    }
    group_of_root.len()
}

fn find(parent: &mut [usize], mut idx: usize) -> usize {
    while parent[idx] != idx {
        parent[idx] = parent[parent[idx]];
        idx = parent[idx];
    }
    idx
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}
