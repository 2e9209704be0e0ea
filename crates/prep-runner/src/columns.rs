use crate::error::{PrepError, PrepResult};
use crate::schema::{CanonicalField, FieldKind};
use crate::table::{Cell, Table};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Ordered map from lower-cased raw column name to canonical field.
/// Earlier entries win when two raw columns resolve to the same field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasTable {
    entries: Vec<(String, CanonicalField)>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aliases seen across the corpus exports; used when a profile names none.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        for (alias, field) in [
            ("ppn", CanonicalField::ParticipantId),
            ("participant", CanonicalField::ParticipantId),
            ("patricipant_id", CanonicalField::ParticipantId),
            ("ppt", CanonicalField::ParticipantId),
            ("subj", CanonicalField::ParticipantId),
            ("subject", CanonicalField::ParticipantId),
            ("recognition_rt", CanonicalField::Rt),
            ("image", CanonicalField::ImageFilename),
        ] {
            table.insert(alias, field);
        }
        table
    }

    /// Adds an alias; re-inserting an existing alias keeps its original priority.
    pub fn insert(&mut self, alias: &str, field: CanonicalField) {
        let key = alias.trim().to_lowercase();
        match self.entries.iter_mut().find(|(a, _)| *a == key) {
            Some(entry) => entry.1 = field,
            None => self.entries.push((key, field)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, CanonicalField)> {
        self.entries.iter().map(|(a, f)| (a.as_str(), *f))
    }

    pub fn target(&self, raw: &str) -> Option<CanonicalField> {
        self.lookup(raw).map(|(_, field)| field)
    }

    fn lookup(&self, raw: &str) -> Option<(usize, CanonicalField)> {
        let key = raw.trim().to_lowercase();
        self.entries
            .iter()
            .position(|(a, _)| *a == key)
            .map(|pos| (pos, self.entries[pos].1))
    }
}

impl<'de> Deserialize<'de> for AliasTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AliasVisitor;

        impl<'de> Visitor<'de> for AliasVisitor {
            type Value = AliasTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping from raw column name to canonical field")
            }

            fn visit_map<A>(self, mut map: A) -> Result<AliasTable, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut table = AliasTable::new();
                while let Some((alias, field)) = map.next_entry::<String, CanonicalField>()? {
                    table.insert(&alias, field);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(AliasVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub renamed: Vec<(String, CanonicalField)>,
    pub passthrough: Vec<String>,
}

/// Renames raw columns to canonical names in place.
///
/// A raw column spelling a canonical name (any casing) outranks every
/// alias; among aliases the table order decides, then column order.
pub fn resolve_columns(table: &mut Table, aliases: &AliasTable) -> Resolution {
    let mut best: BTreeMap<CanonicalField, (usize, usize)> = BTreeMap::new();
    for (idx, raw) in table.headers().iter().enumerate() {
        let candidate = match CanonicalField::from_column(raw) {
            Some(field) => Some((0, field)),
            None => aliases.lookup(raw).map(|(pos, field)| (pos + 1, field)),
        };
        if let Some((priority, field)) = candidate {
            let slot = best.entry(field).or_insert((priority, idx));
            if (priority, idx) < *slot {
                *slot = (priority, idx);
            }
        }
    }

    let mut resolution = Resolution::default();
    let winners: BTreeMap<usize, CanonicalField> =
        best.into_iter().map(|(field, (_, idx))| (idx, field)).collect();
    let headers: Vec<String> = table.headers().to_vec();
    for (idx, raw) in headers.iter().enumerate() {
        match winners.get(&idx) {
            Some(field) => {
                if raw != field.as_str() {
                    debug!(raw = %raw, canonical = %field, "column renamed");
                }
                table.rename_column(idx, field.as_str());
                resolution.renamed.push((raw.clone(), *field));
            }
            None => resolution.passthrough.push(raw.clone()),
        }
    }
    resolution
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantFallback {
    #[default]
    Positional,
    #[serde(rename = "none")]
    Disabled,
}

/// Adds every absent required field with its default: flags false,
/// numbers missing, participant ids the positional row index.
/// `trial_id` is left to the trial indexer.
pub fn synthesize_defaults(
    table: &mut Table,
    required: &[CanonicalField],
    fallback: ParticipantFallback,
) -> PrepResult<Vec<CanonicalField>> {
    let mut synthesized = Vec::new();
    let mut wanted: Vec<CanonicalField> = vec![CanonicalField::ParticipantId];
    for field in required {
        if !wanted.contains(field) {
            wanted.push(*field);
        }
    }
    let rows = table.len();
    for field in wanted {
        if field == CanonicalField::TrialId || table.column_index(field.as_str()).is_some() {
            continue;
        }
        let values = match field.kind() {
            FieldKind::Flag => vec![Cell::Bool(false); rows],
            FieldKind::Numeric | FieldKind::Text => vec![Cell::Missing; rows],
            FieldKind::Identifier => match fallback {
                ParticipantFallback::Positional => {
                    (0..rows).map(|i| Cell::Text(i.to_string())).collect()
                }
                ParticipantFallback::Disabled => return Err(PrepError::NoParticipantSource),
            },
        };
        table.set_column(field.as_str(), values);
        synthesized.push(field);
    }
    Ok(synthesized)
}

/// Coerces numeric and flag columns in place; returns how many non-missing
/// numeric cells could not be parsed and became missing.
pub fn coerce_types(table: &mut Table) -> usize {
    let mut unparsed = 0usize;
    for field in CanonicalField::ALL {
        let Some(idx) = table.column_index(field.as_str()) else {
            continue;
        };
        match field.kind() {
            FieldKind::Numeric => table.map_column(idx, |cell| {
                let coerced = cell.coerce_numeric();
                if coerced.is_missing() && !cell.is_missing() {
                    unparsed += 1;
                }
                coerced
            }),
            FieldKind::Flag => table.map_column(idx, |cell| Cell::Bool(cell.is_truthy())),
            _ => {}
        }
    }
    unparsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_case_insensitively() {
        let mut table = Table::from_records(
            &["PPN", "Recognition_RT", "Image", "extra"],
            &[&["ppt_1", "512", "cat.jpg", "x"]],
        );
        let res = resolve_columns(&mut table, &AliasTable::builtin());
        assert_eq!(
            table.headers(),
            &["participant_id", "rt", "image_filename", "extra"]
        );
        assert_eq!(res.passthrough, vec!["extra".to_string()]);
        assert_eq!(res.renamed.len(), 3);
    }

    #[test]
    fn alias_order_decides_collisions() {
        let mut table = Table::from_records(&["subject", "ppn"], &[&["a", "b"]]);
        resolve_columns(&mut table, &AliasTable::builtin());
        assert_eq!(table.headers(), &["subject", "participant_id"]);
    }

    #[test]
    fn canonical_spelling_beats_aliases() {
        let mut table = Table::from_records(&["ppn", "Participant_ID"], &[&["a", "b"]]);
        resolve_columns(&mut table, &AliasTable::builtin());
        assert_eq!(table.headers(), &["ppn", "participant_id"]);
    }

    #[test]
    fn no_fuzzy_matching() {
        let mut table = Table::from_records(&["participants", "rt_ms"], &[&["a", "1"]]);
        let res = resolve_columns(&mut table, &AliasTable::builtin());
        assert!(res.renamed.is_empty());
    }

    #[test]
    fn yaml_alias_table_keeps_document_order() {
        let table: AliasTable =
            serde_yaml::from_str("Subject: participant_id\nPPN: participant_id\ncomp: stimulus\n")
                .expect("parse");
        let entries: Vec<_> = table.entries().collect();
        assert_eq!(
            entries,
            vec![
                ("subject", CanonicalField::ParticipantId),
                ("ppn", CanonicalField::ParticipantId),
                ("comp", CanonicalField::Stimulus),
            ]
        );
        assert!(serde_yaml::from_str::<AliasTable>("comp: stimulous\n").is_err());
    }

    #[test]
    fn missing_flag_defaults_to_false_and_numeric_to_missing() {
        let mut table = Table::from_records(&["participant_id"], &[&["a"], &["b"]]);
        let synthesized = synthesize_defaults(
            &mut table,
            &[CanonicalField::IsInvalid, CanonicalField::Rt],
            ParticipantFallback::Positional,
        )
        .expect("defaults");
        assert_eq!(synthesized, vec![CanonicalField::IsInvalid, CanonicalField::Rt]);
        let flags = table.column_by_name("is_invalid").expect("flag column");
        assert!(flags.iter().all(|c| *c == Cell::Bool(false)));
        let rts = table.column_by_name("rt").expect("rt column");
        assert!(rts.iter().all(Cell::is_missing));
    }

    #[test]
    fn participant_falls_back_to_row_position() {
        let mut table = Table::from_records(&["resp"], &[&["x"], &["y"], &["z"]]);
        synthesize_defaults(&mut table, &[], ParticipantFallback::Positional).expect("defaults");
        let ids: Vec<String> = table
            .column_by_name("participant_id")
            .expect("ids")
            .iter()
            .map(Cell::render)
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn no_participant_source_is_a_configuration_error() {
        let mut table = Table::from_records(&["resp"], &[&["x"]]);
        let err = synthesize_defaults(&mut table, &[], ParticipantFallback::Disabled)
            .expect_err("must fail");
        assert!(matches!(err, PrepError::NoParticipantSource));
    }

    #[test]
    fn coercion_counts_unparseable_numbers() {
        let mut table = Table::from_records(
            &["rt", "is_invalid", "stimulus"],
            &[&["512", "TRUE", "cat"], &["slow", "0", "12"], &["", "yes", "dog"]],
        );
        assert_eq!(coerce_types(&mut table), 1);
        assert_eq!(table.cell(0, 0), &Cell::Int(512));
        assert!(table.cell(1, 0).is_missing());
        assert_eq!(table.cell(0, 1), &Cell::Bool(true));
        assert_eq!(table.cell(1, 1), &Cell::Bool(false));
        assert_eq!(table.cell(2, 1), &Cell::Bool(true));
        assert_eq!(table.cell(1, 2), &Cell::Text("12".into()));
    }
}
