//! Projects a table definition onto a SQLite schema.
//!
//! Scalars become typed columns, arrays become TEXT columns carrying JSON,
//! memos become BLOB columns.  Table and index names take the per-source
//! prefix; an index is always prefixed identically to its parent table so
//! the two never drift apart in a merged database.

use crate::arrays::ArrayFieldInfo;
use crate::table_def::{FieldType, ParseMode, TableDef};

/// DDL for the auxiliary table recording array structure per converted
/// table, so consumers can round-trip JSON columns.
pub const SCHEMA_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS _schema (\
     table_name TEXT PRIMARY KEY, array_fields TEXT, source_prefix TEXT)";

/// DDL for the resume-marker table; present only while a conversion is
/// interrupted.
pub const RESUME_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS _resume (\
     table_name TEXT PRIMARY KEY, last_record INTEGER)";

/// Column name used by the minimal (opaque) projection.
pub const RAW_RECORD_COLUMN: &str = "record_data";

/// Where one output column takes its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    /// Ordinal into `TableDef::fields`.
    Scalar { field: usize },
    /// Ordinal into the `ArrayFieldInfo` list.
    Array { array: usize },
    /// Ordinal into `TableDef::memos`.
    Memo { memo: usize },
    /// The whole raw record, for minimal definitions.
    RawRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPlan {
    pub name: String,
    pub sql_type: &'static str,
    pub kind: ColumnKind,
}

/// The DDL and column plan for one converted table.
#[derive(Debug, Clone)]
pub struct Projection {
    pub table_name: String,
    pub columns: Vec<ColumnPlan>,
    pub create_table: String,
    pub create_indexes: Vec<String>,
    pub insert_sql: String,
}

/// Maps a scalar field type to its SQLite column type.
fn sql_type_for(t: FieldType) -> &'static str {
    match t {
        FieldType::Byte
        | FieldType::Short
        | FieldType::UShort
        | FieldType::Long
        | FieldType::ULong => "INTEGER",
        FieldType::Double | FieldType::SReal | FieldType::Decimal => "REAL",
        FieldType::String | FieldType::CString | FieldType::PString => "TEXT",
        // ISO-8601 strings.
        FieldType::Date | FieldType::Time => "TEXT",
        FieldType::Memo => "BLOB",
        // Groups are overlay containers and never become columns.
        FieldType::Group => "BLOB",
    }
}

/// Rewrites an arbitrary TopSpeed identifier into a safe SQLite one.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Builds the column plan, DDL and prepared-insert SQL for one table.
///
/// `base_name` is the unprefixed table name; `prefix` is `""`, `"phd_"`
/// or `"mod_"` by source context.
pub fn project(
    def: &TableDef,
    arrays: &[ArrayFieldInfo],
    base_name: &str,
    prefix: &str,
) -> Projection {
    let table_name = format!("{}{}", prefix, sanitize_name(base_name));
    let mut columns: Vec<ColumnPlan> = Vec::new();

    if def.parse_mode == ParseMode::Minimal {
        columns.push(ColumnPlan {
            name: RAW_RECORD_COLUMN.to_string(),
            sql_type: "BLOB",
            kind: ColumnKind::RawRecord,
        });
    } else {
        // member field ordinal -> array ordinal
        let mut member_of = vec![None; def.fields.len()];
        for (ai, info) in arrays.iter().enumerate() {
            for &m in &info.members {
                member_of[m] = Some(ai);
            }
        }
        for (fi, f) in def.fields.iter().enumerate() {
            if f.field_type == FieldType::Group {
                continue;
            }
            match member_of[fi] {
                Some(ai) => {
                    // The array column sits where its first member sat.
                    if arrays[ai].members[0] == fi {
                        columns.push(ColumnPlan {
                            name: sanitize_name(&arrays[ai].sqlite_column_name),
                            sql_type: "TEXT",
                            kind: ColumnKind::Array { array: ai },
                        });
                    }
                }
                None => columns.push(ColumnPlan {
                    name: sanitize_name(&f.name),
                    sql_type: sql_type_for(f.field_type),
                    kind: ColumnKind::Scalar { field: fi },
                }),
            }
        }
        for (mi, m) in def.memos.iter().enumerate() {
            columns.push(ColumnPlan {
                name: sanitize_name(&m.name),
                sql_type: "BLOB",
                kind: ColumnKind::Memo { memo: mi },
            });
        }
    }

    let col_defs = columns
        .iter()
        .map(|c| format!("{} {}", quoted(&c.name), c.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quoted(&table_name),
        col_defs
    );

    let create_indexes = build_indexes(def, arrays, &columns, &table_name);

    let placeholders = vec!["?"; columns.len()].join(", ");
    let col_names = columns
        .iter()
        .map(|c| quoted(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let insert_sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted(&table_name),
        col_names,
        placeholders
    );

    Projection {
        table_name,
        columns,
        create_table,
        create_indexes,
        insert_sql,
    }
}

/// Index DDL.  Every index name carries the same prefix as its table.
/// Members that collapsed into an array column reference that column;
/// members with no column (groups) are dropped, and an index left with
/// no members is skipped.
fn build_indexes(
    def: &TableDef,
    arrays: &[ArrayFieldInfo],
    columns: &[ColumnPlan],
    table_name: &str,
) -> Vec<String> {
    let mut stmts = Vec::new();
    for ix in &def.indexes {
        let mut cols: Vec<String> = Vec::new();
        for &m in &ix.members {
            let fi = m as usize;
            let col = columns.iter().find(|c| match &c.kind {
                ColumnKind::Scalar { field } => *field == fi,
                ColumnKind::Array { array } => arrays[*array].members.contains(&fi),
                _ => false,
            });
            if let Some(c) = col {
                let q = quoted(&c.name);
                if !cols.contains(&q) {
                    cols.push(q);
                }
            }
        }
        if cols.is_empty() {
            continue;
        }
        let index_name = format!("{}_{}", table_name, sanitize_name(&ix.name));
        stmts.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quoted(&index_name),
            quoted(table_name),
            cols.join(", ")
        ));
    }
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::analyze;
    use crate::table_def::encode::DefBuilder;
    use crate::table_def::parse;

    fn project_built(b: DefBuilder, prefix: &str) -> Projection {
        let def = parse(1, &b.build()).unwrap();
        let arrays = analyze(&def);
        project(&def, &arrays, "CUSTOMER", prefix)
    }

    #[test]
    fn test_scalar_projection() {
        let p = project_built(
            DefBuilder::new(20)
                .field(0x06, 0, "NUMBER", 1, 4)
                .field(0x12, 4, "NAME", 1, 10)
                .field(0x09, 14, "BALANCE", 1, 8)
                .key("KEY_NUMBER", &[0]),
            "phd_",
        );
        assert_eq!(p.table_name, "phd_CUSTOMER");
        assert_eq!(
            p.create_table,
            "CREATE TABLE IF NOT EXISTS \"phd_CUSTOMER\" (\"NUMBER\" INTEGER, \"NAME\" TEXT, \"BALANCE\" REAL)"
        );
        assert_eq!(p.create_indexes.len(), 1);
        assert_eq!(
            p.create_indexes[0],
            "CREATE INDEX IF NOT EXISTS \"phd_CUSTOMER_KEY_NUMBER\" ON \"phd_CUSTOMER\" (\"NUMBER\")"
        );
        assert_eq!(
            p.insert_sql,
            "INSERT INTO \"phd_CUSTOMER\" (\"NUMBER\", \"NAME\", \"BALANCE\") VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_array_becomes_text_column() {
        let p = project_built(
            DefBuilder::new(100)
                .field(0x06, 0, "ID", 1, 4)
                .field(0x09, 4, "VALUES", 12, 96),
            "",
        );
        assert_eq!(p.columns.len(), 2);
        assert_eq!(p.columns[1].name, "VALUES");
        assert_eq!(p.columns[1].sql_type, "TEXT");
        assert_eq!(p.columns[1].kind, ColumnKind::Array { array: 0 });
    }

    #[test]
    fn test_multi_field_series_collapses_to_one_column() {
        let mut b = DefBuilder::new(100).field(0x06, 0, "ID", 1, 4);
        for i in 0..12 {
            b = b.field(0x09, (4 + i * 8) as u16, &format!("PROD{}", i + 1), 1, 8);
        }
        let p = project_built(b, "mod_");
        assert_eq!(p.columns.len(), 2);
        assert_eq!(p.columns[1].name, "PROD");
        assert_eq!(p.table_name, "mod_CUSTOMER");
    }

    #[test]
    fn test_group_fields_are_skipped() {
        let p = project_built(
            DefBuilder::new(8)
                .field(0x16, 0, "GRP", 1, 8)
                .field(0x06, 0, "A", 1, 4)
                .field(0x06, 4, "B", 1, 4),
            "",
        );
        let names: Vec<&str> = p.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_memo_appends_blob_column() {
        let p = project_built(
            DefBuilder::new(4).field(0x06, 0, "ID", 1, 4).memo("NOTES"),
            "",
        );
        assert_eq!(p.columns.len(), 2);
        assert_eq!(p.columns[1].name, "NOTES");
        assert_eq!(p.columns[1].sql_type, "BLOB");
        assert_eq!(p.columns[1].kind, ColumnKind::Memo { memo: 0 });
    }

    #[test]
    fn test_minimal_projection_is_one_blob() {
        let mut raw = DefBuilder::new(2528).build();
        raw[4] = 1;
        raw.extend_from_slice(&[0xff, 0xff]);
        let def = parse(1, &raw).unwrap();
        let p = project(&def, &[], "FORCAST", "phd_");
        assert_eq!(p.columns.len(), 1);
        assert_eq!(p.columns[0].name, RAW_RECORD_COLUMN);
        assert_eq!(
            p.create_table,
            "CREATE TABLE IF NOT EXISTS \"phd_FORCAST\" (\"record_data\" BLOB)"
        );
    }

    #[test]
    fn test_index_over_array_member_targets_array_column() {
        let p = project_built(
            DefBuilder::new(12)
                .field(0x06, 0, "A1", 1, 4)
                .field(0x06, 4, "A2", 1, 4)
                .field(0x06, 8, "ID", 1, 4)
                .key("KEY_A", &[0, 1, 2]),
            "phd_",
        );
        // A1/A2 collapse to column A; the index references it once.
        assert_eq!(
            p.create_indexes[0],
            "CREATE INDEX IF NOT EXISTS \"phd_CUSTOMER_KEY_A\" ON \"phd_CUSTOMER\" (\"A\", \"ID\")"
        );
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("CUS:NAME"), "CUS_NAME");
        assert_eq!(sanitize_name("2NDTRY"), "_2NDTRY");
        assert_eq!(sanitize_name(""), "_");
        assert_eq!(sanitize_name("PLAIN_1"), "PLAIN_1");
    }
}
