//! Trial generation: two independently shuffled lists drawn from one entity
//! set, plus the ground-truth mapping between them.

use crate::pool::PoolEntity;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrialError {
    #[error("trial needs exactly {expected} entities, got {actual}")]
    WrongGroupSize { expected: usize, actual: usize },
    #[error("entity index {0} appears more than once in one trial")]
    DuplicateEntity(u64),
    #[error("group size must be at least 2, got {0}")]
    GroupTooSmall(usize),
    /// The description side is built from the same reference ids as the name
    /// side, so a miss here is an internal defect, never bad input.
    #[error("internal mapping failure: no description carries reference id {ref_id}")]
    MappingNotFound { ref_id: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStrategy {
    /// The mapping preserves name-to-description identity.
    #[default]
    Correct,
    /// Negative control: the shown descriptions are the true ones, but the
    /// recorded mapping is an independent permutation.
    Random,
}

impl MappingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStrategy::Correct => "correct",
            MappingStrategy::Random => "random",
        }
    }
}

impl fmt::Display for MappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "correct" => Ok(MappingStrategy::Correct),
            "random" => Ok(MappingStrategy::Random),
            other => Err(format!(
                "unknown mapping strategy '{}': expected correct | random",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShownName {
    pub text: String,
    pub ref_id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShownDescription {
    pub text: String,
    /// Reference id the mapping resolves against. Equals `owner_ref` under
    /// the correct strategy.
    pub ref_id: usize,
    /// Reference id of the entity that actually wrote this description.
    pub owner_ref: usize,
}

/// One row of the audit manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub shown_name: String,
    pub name_ref: usize,
    pub description_position: usize,
    pub description_owner_ref: usize,
    pub description_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    pub index: u32,
    pub strategy: MappingStrategy,
    pub seed: u64,
    pub entity_indices: Vec<u64>,
    pub names: Vec<ShownName>,
    pub descriptions: Vec<ShownDescription>,
    /// `mapping[i]` is the 1-based position in `descriptions` paired with
    /// `names[i]`.
    pub mapping: Vec<usize>,
}

const PREVIEW_CHARS: usize = 30;

pub fn generate_trial(
    index: u32,
    entities: &[PoolEntity],
    group_size: usize,
    strategy: MappingStrategy,
    seed: u64,
) -> Result<Trial, TrialError> {
    if group_size < 2 {
        return Err(TrialError::GroupTooSmall(group_size));
    }
    if entities.len() != group_size {
        return Err(TrialError::WrongGroupSize {
            expected: group_size,
            actual: entities.len(),
        });
    }
    let mut seen = HashSet::new();
    for e in entities {
        if !seen.insert(e.index) {
            return Err(TrialError::DuplicateEntity(e.index));
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let k = entities.len();

    let mut names: Vec<ShownName> = entities
        .iter()
        .enumerate()
        .map(|(ref_id, e)| ShownName {
            text: e.display_name(),
            ref_id,
        })
        .collect();

    let mut desc_refs: Vec<usize> = (0..k).collect();
    if strategy == MappingStrategy::Random {
        desc_refs.shuffle(&mut rng);
    }
    let mut descriptions: Vec<ShownDescription> = entities
        .iter()
        .enumerate()
        .map(|(owner_ref, e)| ShownDescription {
            text: e.description.clone(),
            ref_id: desc_refs[owner_ref],
            owner_ref,
        })
        .collect();

    names.shuffle(&mut rng);
    descriptions.shuffle(&mut rng);

    let mapping = derive_mapping(&names, &descriptions)?;

    Ok(Trial {
        index,
        strategy,
        seed,
        entity_indices: entities.iter().map(|e| e.index).collect(),
        names,
        descriptions,
        mapping,
    })
}

fn derive_mapping(
    names: &[ShownName],
    descriptions: &[ShownDescription],
) -> Result<Vec<usize>, TrialError> {
    names
        .iter()
        .map(|name| {
            descriptions
                .iter()
                .position(|d| d.ref_id == name.ref_id)
                .map(|pos| pos + 1)
                .ok_or(TrialError::MappingNotFound {
                    ref_id: name.ref_id,
                })
        })
        .collect()
}

impl Trial {
    pub fn group_size(&self) -> usize {
        self.names.len()
    }

    pub fn manifest(&self) -> Vec<ManifestRow> {
        self.names
            .iter()
            .zip(self.mapping.iter())
            .map(|(name, &pos)| {
                let desc = &self.descriptions[pos - 1];
                ManifestRow {
                    shown_name: name.text.clone(),
                    name_ref: name.ref_id,
                    description_position: pos,
                    description_owner_ref: desc.owner_ref,
                    description_preview: preview(&desc.text),
                }
            })
            .collect()
    }

    pub fn manifest_tsv(&self) -> String {
        let mut out = String::from(
            "Shuffled_Name\tName_Ref_ID\tMapped_Desc_Position\tDesc_Original_Ref_ID\tDesc_Preview\n",
        );
        for row in self.manifest() {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                row.shown_name,
                row.name_ref,
                row.description_position,
                row.description_owner_ref,
                row.description_preview
            ));
        }
        out
    }

    pub fn mapping_row(&self) -> String {
        self.mapping
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("\t")
    }

    /// Assembles the oracle prompt: the query template, then List A (names)
    /// and List B (descriptions tagged 1..k).
    pub fn render_prompt(&self, template: &str) -> String {
        let mut out = template.trim_end().to_string();
        out.push_str("\n\nList A\n");
        for name in &self.names {
            out.push_str(&name.text);
            out.push('\n');
        }
        out.push_str("\nList B\n");
        for (i, desc) in self.descriptions.iter().enumerate() {
            out.push_str(&format!("ID {}: {}\n", i + 1, desc.text));
        }
        out
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace(['\t', '\n', '\r'], " ");
    let mut chars = flat.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

pub const DEFAULT_QUERY_TEMPLATE: &str = "\
You will be given two lists. List A contains people identified by name and \
birth year. List B contains personality descriptions, each tagged with an ID.
For every person in List A, rate how well each description in List B fits \
that person on a scale from 0.00 (no fit) to 1.00 (perfect fit).
Respond with a table only: one row per person in List A (in the order given), \
one column per description ID in List B (in ID order). Use '|' to separate \
cells and start each row with the person's name.";

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u64, name: &str, year: i32) -> PoolEntity {
        PoolEntity {
            index,
            source_id: 1000 + index,
            name: name.to_string(),
            year,
            description: format!("Description written for {}", name),
        }
    }

    fn abcd() -> Vec<PoolEntity> {
        vec![
            entity(1, "A", 1901),
            entity(2, "B", 1902),
            entity(3, "C", 1903),
            entity(4, "D", 1904),
        ]
    }

    fn assert_bijection(mapping: &[usize]) {
        let mut sorted = mapping.to_vec();
        sorted.sort_unstable();
        let expected: Vec<usize> = (1..=mapping.len()).collect();
        assert_eq!(sorted, expected, "mapping {:?} is not a permutation", mapping);
    }

    #[test]
    fn mapping_is_a_bijection_for_both_strategies() {
        let pool = abcd();
        for seed in 0..200u64 {
            for strategy in [MappingStrategy::Correct, MappingStrategy::Random] {
                let trial = generate_trial(1, &pool, 4, strategy, seed).expect("trial");
                assert_bijection(&trial.mapping);
            }
        }
    }

    #[test]
    fn correct_strategy_round_trips_identity() {
        let pool = abcd();
        for seed in 0..200u64 {
            let trial = generate_trial(1, &pool, 4, MappingStrategy::Correct, seed).expect("trial");
            for (name, &pos) in trial.names.iter().zip(trial.mapping.iter()) {
                let desc = &trial.descriptions[pos - 1];
                assert_eq!(desc.owner_ref, name.ref_id);
                let owner = &pool[desc.owner_ref];
                assert_eq!(name.text, owner.display_name());
                assert_eq!(desc.text, owner.description);
            }
        }
    }

    #[test]
    fn random_strategy_keeps_description_set_and_decorrelates_mapping() {
        let pool = abcd();
        let mut expected: Vec<String> = pool.iter().map(|e| e.description.clone()).collect();
        expected.sort();
        let mut decorrelated = 0;
        let runs = 200u64;
        for seed in 0..runs {
            let trial = generate_trial(1, &pool, 4, MappingStrategy::Random, seed).expect("trial");
            let mut shown: Vec<String> = trial.descriptions.iter().map(|d| d.text.clone()).collect();
            shown.sort();
            assert_eq!(shown, expected);
            let leaks_identity = trial
                .names
                .iter()
                .zip(trial.mapping.iter())
                .all(|(n, &pos)| trial.descriptions[pos - 1].owner_ref == n.ref_id);
            if !leaks_identity {
                decorrelated += 1;
            }
        }
        // Identity survives only when the inner permutation is the identity (1 in 24).
        assert!(decorrelated > runs * 3 / 4, "only {} of {} decorrelated", decorrelated, runs);
    }

    #[test]
    fn manifest_records_original_owner_under_random() {
        let pool = abcd();
        let trial = (0..50u64)
            .map(|seed| generate_trial(1, &pool, 4, MappingStrategy::Random, seed).unwrap())
            .find(|t| t.descriptions.iter().any(|d| d.ref_id != d.owner_ref))
            .expect("some seed decorrelates");
        let rows = trial.manifest();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().any(|r| r.name_ref != r.description_owner_ref));
        for row in rows {
            let desc = &trial.descriptions[row.description_position - 1];
            assert_eq!(desc.ref_id, row.name_ref);
            assert_eq!(desc.owner_ref, row.description_owner_ref);
        }
    }

    #[test]
    fn same_seed_yields_identical_trial() {
        let pool = abcd();
        let a = generate_trial(5, &pool[..3], 3, MappingStrategy::Correct, 7).expect("a");
        let b = generate_trial(5, &pool[..3], 3, MappingStrategy::Correct, 7).expect("b");
        assert_eq!(a, b);
        assert_eq!(a.render_prompt("Q"), b.render_prompt("Q"));
        assert_eq!(a.manifest_tsv(), b.manifest_tsv());
    }

    #[test]
    fn three_of_four_seed_seven_reconstructs() {
        let pool = abcd();
        let trial = generate_trial(1, &pool[..3], 3, MappingStrategy::Correct, 7).expect("trial");
        assert_eq!(trial.mapping.len(), 3);
        assert_bijection(&trial.mapping);
        for (i, name) in trial.names.iter().enumerate() {
            let desc = &trial.descriptions[trial.mapping[i] - 1];
            let owner = &pool[desc.owner_ref];
            assert_eq!(name.text, owner.display_name());
        }
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let pool = abcd();
        assert_eq!(
            generate_trial(1, &pool[..2], 3, MappingStrategy::Correct, 1),
            Err(TrialError::WrongGroupSize { expected: 3, actual: 2 })
        );
        let dup = vec![pool[0].clone(), pool[0].clone()];
        assert_eq!(
            generate_trial(1, &dup, 2, MappingStrategy::Correct, 1),
            Err(TrialError::DuplicateEntity(1))
        );
        assert_eq!(
            generate_trial(1, &pool[..1], 1, MappingStrategy::Correct, 1),
            Err(TrialError::GroupTooSmall(1))
        );
    }

    #[test]
    fn derive_mapping_fails_loudly_on_missing_reference() {
        let names = vec![ShownName { text: "A (1)".into(), ref_id: 0 }];
        let descriptions = vec![ShownDescription {
            text: "x".into(),
            ref_id: 1,
            owner_ref: 1,
        }];
        assert_eq!(
            derive_mapping(&names, &descriptions),
            Err(TrialError::MappingNotFound { ref_id: 0 })
        );
    }

    #[test]
    fn prompt_lists_names_then_tagged_descriptions() {
        let pool = abcd();
        let trial = generate_trial(1, &pool[..3], 3, MappingStrategy::Correct, 11).expect("trial");
        let prompt = trial.render_prompt("Match them.\n");
        assert!(prompt.starts_with("Match them.\n\nList A\n"));
        let list_b = prompt.split("List B\n").nth(1).expect("list b");
        assert!(list_b.starts_with("ID 1: "));
        assert!(list_b.contains("ID 3: "));
        assert_eq!(trial.mapping_row().split('\t').count(), 3);
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(40);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(30)));
        assert_eq!(preview("a\tb"), "a b");
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Random".parse::<MappingStrategy>(), Ok(MappingStrategy::Random));
        assert!("identity".parse::<MappingStrategy>().is_err());
    }
}
