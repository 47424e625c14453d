//! Formula models, read from `models/formulas.csv`. Each row describes one
//! output column for one form: a named sum of account codes (`formula`) or
//! a single indicator passed through verbatim (`metric`). The `extra`
//! column carries `key=value` pairs separated by semicolons; the only key
//! in use is `section`, which pins a formula to one balance section.

use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_FORMULAS_PATH: &str = "models/formulas.csv";

const COLUMNS: [&str; 5] = ["form", "kind", "name", "expression", "extra"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaKind {
    Formula,
    Metric,
}

impl FormulaKind {
    fn from_label(label: &str) -> Option<FormulaKind> {
        match label.trim().to_ascii_lowercase().as_str() {
            "formula" => Some(FormulaKind::Formula),
            "metric" => Some(FormulaKind::Metric),
            _ => None,
        }
    }
}

/// One model row, trimmed but otherwise untouched; code normalisation
/// happens later, under the owning form's policy.
#[derive(Debug, Clone)]
pub struct FormulaSpec {
    pub form: String,
    pub kind: FormulaKind,
    pub name: String,
    pub expression: String,
    pub section: Option<String>,
}

pub fn load_formulas(path: &Path) -> Result<Vec<FormulaSpec>, ConfigError> {
    let csv_err = |source| ConfigError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = rdr.headers().map_err(csv_err)?.clone();

    let mut cols = [0usize; 5];
    for (i, name) in COLUMNS.iter().enumerate() {
        cols[i] = headers
            .iter()
            .position(|h| h.trim() == *name)
            .ok_or_else(|| ConfigError::MissingColumn {
                path: path.to_path_buf(),
                column: (*name).to_owned(),
            })?;
    }

    let mut out = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let row = i + 2; // 1-based, after the header line
        let cell = |c: usize| record.get(cols[c]).unwrap_or("").trim();

        let form = cell(0).to_owned();
        let name = cell(2).to_owned();
        if form.is_empty() {
            return Err(ConfigError::BadRow {
                path: path.to_path_buf(),
                row,
                detail: "empty form".to_owned(),
            });
        }
        if name.is_empty() {
            return Err(ConfigError::BadRow {
                path: path.to_path_buf(),
                row,
                detail: "empty name".to_owned(),
            });
        }
        let kind = FormulaKind::from_label(cell(1)).ok_or_else(|| ConfigError::BadRow {
            path: path.to_path_buf(),
            row,
            detail: format!("unknown kind '{}'", cell(1)),
        })?;
        let section = parse_extra(&name, cell(4))?;

        out.push(FormulaSpec {
            form,
            kind,
            name,
            expression: cell(3).to_owned(),
            section,
        });
    }
    debug!(count = out.len(), path = %path.display(), "formula models loaded");
    Ok(out)
}

/// Model rows for one form, in file order.
pub fn formulas_for<'a>(rows: &'a [FormulaSpec], form: &str) -> Vec<&'a FormulaSpec> {
    let wanted = form.trim();
    rows.iter().filter(|r| r.form == wanted).collect()
}

/// Indicator name -> rank, in order of first appearance. Drives the row
/// grouping of the wide summary.
pub type IndicatorOrder = IndexMap<String, usize>;

pub fn indicator_order(models: &[&FormulaSpec]) -> IndicatorOrder {
    let mut order = IndicatorOrder::new();
    for model in models {
        let rank = order.len();
        order.entry(model.name.clone()).or_insert(rank);
    }
    order
}

fn parse_extra(name: &str, extra: &str) -> Result<Option<String>, ConfigError> {
    let mut section = None;
    for part in extra.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let value = kv.next().unwrap_or("").trim();
        match key {
            "section" => section = Some(value.to_owned()),
            other => {
                return Err(ConfigError::UnknownExtraKey {
                    name: name.to_owned(),
                    key: other.to_owned(),
                })
            }
        }
    }
    Ok(section)
}
