//! Picks the one table out of an unpacked archive that carries the form's
//! payload. Archives ship several DBF files per date (totals, branches,
//! reference sheets) under names that drift across years, so selection
//! goes by schema first and filename second.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::dbf::reader::{self, FieldDescriptor};
use crate::error::SelectError;

const HINT_BONUS: i32 = 10;
const FIELD_BONUS: i32 = 3;

/// Candidate field names for each role the pipeline reads, in preference
/// order. `code_bonus` and `value_bonus` name spellings that mark the
/// canonical payload table as opposed to a look-alike.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleSpec {
    #[serde(default)]
    pub regn: Vec<String>,
    #[serde(default)]
    pub code: Vec<String>,
    #[serde(default)]
    pub value: Vec<String>,
    #[serde(default)]
    pub section: Vec<String>,
    #[serde(default)]
    pub code_bonus: Vec<String>,
    #[serde(default)]
    pub value_bonus: Vec<String>,
}

/// Field indexes of the chosen table, ready for record access.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub regn: usize,
    pub code: usize,
    pub value: usize,
    pub section: Option<usize>,
}

#[derive(Debug)]
pub struct TablePick {
    pub path: PathBuf,
    pub layout: TableLayout,
    pub score: i32,
}

/// All DBF files under `root`, recursively, in sorted path order. The
/// order matters: score ties resolve to the first path.
pub fn list_tables(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_dbf = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("dbf"))
            .unwrap_or(false);
        if is_dbf {
            found.push(entry.into_path());
        }
    }
    found.sort();
    found
}

/// Scores every table under `root` and returns the best qualifying one.
///
/// A table qualifies only if all three mandatory roles resolve against its
/// schema; a filename that matches `hint` is worth more than canonical
/// field spellings but can never rescue a table with the wrong schema.
pub fn pick_table(
    root: &Path,
    roles: &RoleSpec,
    hint: Option<&str>,
) -> Result<TablePick, SelectError> {
    let tables = list_tables(root);
    if tables.is_empty() {
        return Err(SelectError::NoTables);
    }

    let mut best: Option<TablePick> = None;
    for path in &tables {
        let fields = match reader::read_schema(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable table header");
                continue;
            }
        };

        let resolved = (
            find_role(&fields, &roles.regn),
            find_role(&fields, &roles.code),
            find_role(&fields, &roles.value),
        );
        let (regn, code, value) = match resolved {
            (Some(r), Some(c), Some(v)) => (r, c, v),
            _ => continue,
        };
        let section = find_role(&fields, &roles.section);

        let mut score = 0;
        if let Some(h) = hint {
            if stem_contains(path, h) {
                score += HINT_BONUS;
            }
        }
        if name_listed(&fields[code].name, &roles.code_bonus) {
            score += FIELD_BONUS;
        }
        if name_listed(&fields[value].name, &roles.value_bonus) {
            score += FIELD_BONUS;
        }
        debug!(path = %path.display(), score, "table qualifies");

        let better = match &best {
            None => true,
            Some(b) => score > b.score,
        };
        if better {
            best = Some(TablePick {
                path: path.clone(),
                layout: TableLayout {
                    regn,
                    code,
                    value,
                    section,
                },
                score,
            });
        }
    }

    match best {
        Some(pick) => Ok(pick),
        None => {
            let sample = &tables[0];
            let fields = reader::read_schema(sample)
                .map(|f| f.into_iter().map(|d| d.name).collect())
                .unwrap_or_default();
            Err(SelectError::NoMatch {
                sample: sample
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("?")
                    .to_owned(),
                fields,
            })
        }
    }
}

/// First candidate that names a field wins; candidate order is preference
/// order, not schema order.
fn find_role(fields: &[FieldDescriptor], candidates: &[String]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|cand| fields.iter().position(|f| f.name.eq_ignore_ascii_case(cand)))
}

fn name_listed(name: &str, listed: &[String]) -> bool {
    listed.iter().any(|l| l.eq_ignore_ascii_case(name))
}

fn stem_contains(path: &Path, needle: &str) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbf::reader::TextEncoding;
    use crate::dbf::writer::{write_dbf, ColumnSpec};
    use tempfile::tempdir;

    fn spec() -> RoleSpec {
        RoleSpec {
            regn: vec!["REGN".to_owned()],
            code: vec!["C1".to_owned(), "CODE".to_owned()],
            value: vec!["C3".to_owned(), "VAL".to_owned()],
            section: vec!["A_P".to_owned()],
            code_bonus: vec!["C1".to_owned(), "C_1".to_owned(), "C1_3".to_owned()],
            value_bonus: vec!["C3".to_owned(), "C_3".to_owned(), "C2_3".to_owned()],
        }
    }

    fn write_table(path: &Path, names: &[&str]) {
        let columns: Vec<ColumnSpec> = names.iter().map(|n| ColumnSpec::character(n, 8)).collect();
        write_dbf(path, &columns, &[], TextEncoding::Cp866).unwrap();
    }

    #[test]
    fn qualifying_schema_beats_filename_hint() {
        let dir = tempdir().unwrap();
        // the hinted file lacks the mandatory roles entirely
        write_table(&dir.path().join("123data.dbf"), &["NAME", "DATE"]);
        write_table(&dir.path().join("zz.dbf"), &["REGN", "CODE", "VAL"]);

        let pick = pick_table(dir.path(), &spec(), Some("123d")).unwrap();
        assert!(pick.path.ends_with("zz.dbf"));
        assert_eq!(pick.score, 0);
    }

    #[test]
    fn filename_hint_outranks_field_bonuses() {
        let dir = tempdir().unwrap();
        write_table(&dir.path().join("aux.dbf"), &["REGN", "C1", "C3"]);
        write_table(&dir.path().join("b1_main.dbf"), &["REGN", "CODE", "VAL"]);

        let pick = pick_table(dir.path(), &spec(), Some("B1")).unwrap();
        assert!(pick.path.ends_with("b1_main.dbf"));
        assert_eq!(pick.score, 10);
    }

    #[test]
    fn bonus_names_break_hintless_ties() {
        let dir = tempdir().unwrap();
        write_table(&dir.path().join("a.dbf"), &["REGN", "CODE", "VAL"]);
        write_table(&dir.path().join("b.dbf"), &["REGN", "C1", "C3"]);

        let pick = pick_table(dir.path(), &spec(), None).unwrap();
        assert!(pick.path.ends_with("b.dbf"));
        assert_eq!(pick.score, 6);
    }

    #[test]
    fn score_ties_resolve_to_the_first_sorted_path() {
        let dir = tempdir().unwrap();
        write_table(&dir.path().join("b.dbf"), &["REGN", "CODE", "VAL"]);
        write_table(&dir.path().join("a.dbf"), &["REGN", "CODE", "VAL"]);

        let pick = pick_table(dir.path(), &spec(), None).unwrap();
        assert!(pick.path.ends_with("a.dbf"));
    }

    #[test]
    fn layout_carries_the_resolved_indexes() {
        let dir = tempdir().unwrap();
        write_table(&dir.path().join("t.dbf"), &["A_P", "REGN", "CODE", "VAL"]);

        let pick = pick_table(dir.path(), &spec(), None).unwrap();
        assert_eq!(pick.layout.regn, 1);
        assert_eq!(pick.layout.code, 2);
        assert_eq!(pick.layout.value, 3);
        assert_eq!(pick.layout.section, Some(0));
    }

    #[test]
    fn empty_directory_reports_no_tables() {
        let dir = tempdir().unwrap();
        match pick_table(dir.path(), &spec(), None) {
            Err(SelectError::NoTables) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unmatched_tables_report_a_sample_schema() {
        let dir = tempdir().unwrap();
        write_table(&dir.path().join("odd.dbf"), &["NAME", "DATE"]);

        match pick_table(dir.path(), &spec(), None) {
            Err(SelectError::NoMatch { sample, fields }) => {
                assert_eq!(sample, "odd.dbf");
                assert_eq!(fields, vec!["NAME".to_owned(), "DATE".to_owned()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
