//! Detects array structure in a table definition.
//!
//! TopSpeed applications store repeated values two ways: a single field
//! declared with an element count greater than one (`VALUES DOUBLE,DIM(12)`),
//! or a series of sibling fields sharing a stem and a 1-based integer
//! suffix (`PROD1` through `PROD12`).  Both collapse to one JSON-array
//! column in the converted schema.

use itertools::Itertools;
use serde::Serialize;

use crate::table_def::{FieldType, TableDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayKind {
    SingleField,
    MultiField,
}

/// One detected array and the fields that make it up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayFieldInfo {
    pub kind: ArrayKind,
    pub base_name: String,
    pub element_type: FieldType,
    pub element_count: u32,
    /// Ordinals into `TableDef::fields`: one entry for a single-field
    /// array, the members in suffix order for a multi-field array.
    pub members: Vec<usize>,
    /// Name of the TEXT column holding the JSON array.
    pub sqlite_column_name: String,
}

/// Splits a trailing decimal suffix off a field name.
///
/// `PROD12` becomes `("PROD", 12)`.  Names that are all digits, carry no
/// digits, or whose suffix is zero yield `None`; suffixes are 1-based.
fn split_suffix(name: &str) -> Option<(&str, u32)> {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits == name.len() {
        return None;
    }
    let (stem, suffix) = name.split_at(name.len() - digits);
    let n: u32 = suffix.parse().ok()?;
    if n == 0 {
        return None;
    }
    Some((stem, n))
}

/// Inspects a table definition and emits one descriptor per detected
/// array.  Descriptors appear in the order of their first member field.
pub fn analyze(def: &TableDef) -> Vec<ArrayFieldInfo> {
    let mut infos: Vec<ArrayFieldInfo> = Vec::new();

    // Rule 1: one field with an element count above one.  This rule wins
    // over suffix grouping, so these fields are excluded from rule 2.
    let mut consumed = vec![false; def.fields.len()];
    for (i, f) in def.fields.iter().enumerate() {
        if f.field_type == FieldType::Group {
            consumed[i] = true;
            continue;
        }
        if f.is_array() {
            consumed[i] = true;
            infos.push(ArrayFieldInfo {
                kind: ArrayKind::SingleField,
                base_name: f.name.clone(),
                element_type: f.field_type,
                element_count: f.element_count,
                members: vec![i],
                sqlite_column_name: f.name.clone(),
            });
        }
    }

    // Rule 2: group scalar siblings by stem and collapse a contiguous
    // 1-based suffix run of at least two members.
    let groups = def
        .fields
        .iter()
        .enumerate()
        .filter(|(i, _)| !consumed[*i])
        .filter_map(|(i, f)| split_suffix(&f.name).map(|(stem, n)| (stem.to_string(), (n, i))))
        .into_group_map();

    let scalar_names: std::collections::HashSet<&str> = def
        .fields
        .iter()
        .enumerate()
        .filter(|(i, _)| !consumed[*i])
        .map(|(_, f)| f.name.as_str())
        .collect();

    for (stem, mut candidates) in groups {
        // A stem that is itself a field name would collide as a column;
        // the members stay scalar in that case.
        if scalar_names.contains(stem.as_str()) {
            continue;
        }
        candidates.sort_by_key(|(n, _)| *n);
        // Take the tightest contiguous run starting at suffix 1, with all
        // members agreeing on type and width.
        let mut run: Vec<usize> = Vec::new();
        let mut expect = 1_u32;
        for (n, i) in &candidates {
            if *n != expect {
                break;
            }
            if let Some(&first) = run.first() {
                let a = &def.fields[first];
                let b = &def.fields[*i];
                if a.field_type != b.field_type || a.length != b.length {
                    break;
                }
            }
            run.push(*i);
            expect += 1;
        }
        if run.len() < 2 {
            continue;
        }
        let first = &def.fields[run[0]];
        infos.push(ArrayFieldInfo {
            kind: ArrayKind::MultiField,
            base_name: stem.clone(),
            element_type: first.field_type,
            element_count: run.len() as u32,
            members: run,
            sqlite_column_name: stem,
        });
    }

    infos.sort_by_key(|info| info.members[0]);
    infos
}
