//! Wide summary tables, pivoted from a form run's long rows: one row per
//! (indicator, bank), one column per report date, cells holding
//! spreadsheet formulas or metric values. Row order is indicator-major in
//! model order, banks within an indicator in panel order. Exported as
//! CSV, optionally also as a dBase snapshot for consumers that still live
//! in that world.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::info;

use crate::banks::Bank;
use crate::dbf::reader::TextEncoding;
use crate::dbf::writer::{write_dbf, ColumnSpec};
use crate::error::RunError;
use crate::formulas::IndicatorOrder;

/// One evaluated cell in long format, the durable output of a form run.
/// `value` is a `"="`-prefixed formula string or a plain metric value.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRow {
    pub date: NaiveDate,
    pub bank: String,
    pub indicator: String,
    pub value: String,
}

pub struct WideTable {
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<WideRow>,
}

pub struct WideRow {
    pub indicator: String,
    pub bank: String,
    pub values: Vec<String>,
}

/// Date column label, `dd.mm.yyyy` as the summaries have always shown it.
fn date_label(date: NaiveDate) -> String {
    date.format("%d.%m.%Y").to_string()
}

/// Pivots long rows into the wide summary. Date columns appear in the
/// order the dates first occur, indicators follow their model rank, banks
/// keep panel order. A cell with no long row reads as empty; duplicate
/// long rows for one cell keep the first.
pub fn build_wide(rows: &[LongRow], banks: &[Bank], order: &IndicatorOrder) -> WideTable {
    let mut dates: Vec<NaiveDate> = Vec::new();
    let mut cells: HashMap<(&str, &str, NaiveDate), &str> = HashMap::new();
    for row in rows {
        if !dates.contains(&row.date) {
            dates.push(row.date);
        }
        cells
            .entry((row.indicator.as_str(), row.bank.as_str(), row.date))
            .or_insert_with(|| row.value.as_str());
    }

    let mut out = Vec::with_capacity(order.len() * banks.len());
    for indicator in order.keys() {
        for bank in banks {
            let values = dates
                .iter()
                .map(|date| {
                    cells
                        .get(&(indicator.as_str(), bank.bank.as_str(), *date))
                        .copied()
                        .unwrap_or("")
                        .to_owned()
                })
                .collect();
            out.push(WideRow {
                indicator: indicator.clone(),
                bank: bank.bank.clone(),
                values,
            });
        }
    }
    WideTable { dates, rows: out }
}

/// `form<code>_summary.csv` under the output directory.
pub fn summary_path(out_dir: &Path, form_id: &str) -> PathBuf {
    out_dir.join(format!("form{}_summary.csv", form_id))
}

pub fn export_csv(path: &Path, table: &WideTable) -> Result<(), RunError> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = Vec::with_capacity(table.dates.len() + 2);
    header.push("indicator".to_owned());
    header.push("bank".to_owned());
    header.extend(table.dates.iter().map(|d| date_label(*d)));
    writer.write_record(&header)?;

    for row in &table.rows {
        let mut record = Vec::with_capacity(row.values.len() + 2);
        record.push(row.indicator.as_str());
        record.push(row.bank.as_str());
        record.extend(row.values.iter().map(String::as_str));
        writer.write_record(&record)?;
    }
    writer.flush().map_err(RunError::Io)?;
    info!(path = %path.display(), rows = table.rows.len(), "summary exported");
    Ok(())
}

/// Same table as a dBase file, date columns named `DYYYYMMDD`. Cells are
/// clipped to the column width, which loses nothing for ordinary values
/// but can shorten very long formulas.
pub fn export_dbf(path: &Path, table: &WideTable) -> Result<(), RunError> {
    let mut columns = Vec::with_capacity(table.dates.len() + 2);
    columns.push(ColumnSpec::character("INDICATOR", 80));
    columns.push(ColumnSpec::character("BANK", 60));
    for date in &table.dates {
        columns.push(ColumnSpec::character(
            &format!("D{}", date.format("%Y%m%d")),
            254,
        ));
    }
    let rows: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| {
            let mut cells = Vec::with_capacity(row.values.len() + 2);
            cells.push(row.indicator.clone());
            cells.push(row.bank.clone());
            cells.extend(row.values.iter().cloned());
            cells
        })
        .collect();
    write_dbf(path, &columns, &rows, TextEncoding::Cp866)?;
    info!(path = %path.display(), rows = table.rows.len(), "snapshot exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbf::reader::{DbfTable, FieldValue};
    use std::fs;
    use tempfile::tempdir;

    fn bank(name: &str, regn: i64, sort: i64) -> Bank {
        Bank {
            bank: name.to_owned(),
            regn,
            sort,
        }
    }

    fn long(date: NaiveDate, indicator: &str, bank: &str, value: &str) -> LongRow {
        LongRow {
            date,
            bank: bank.to_owned(),
            indicator: indicator.to_owned(),
            value: value.to_owned(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn panel() -> Vec<Bank> {
        vec![bank("Sber", 1481, 1), bank("VTB", 1000, 2)]
    }

    fn order() -> IndicatorOrder {
        let mut order = IndicatorOrder::new();
        order.insert("Capital".to_owned(), 0);
        order.insert("Sum".to_owned(), 1);
        order
    }

    fn sample_rows() -> Vec<LongRow> {
        vec![
            long(date(2024, 1, 1), "Capital", "Sber", "=100"),
            long(date(2024, 1, 1), "Capital", "VTB", "=5"),
            long(date(2024, 1, 1), "Sum", "Sber", "=100+0"),
            long(date(2024, 1, 1), "Sum", "VTB", "=5+0"),
            long(date(2024, 2, 1), "Capital", "Sber", "=120"),
            long(date(2024, 2, 1), "Capital", "VTB", "=0"),
            long(date(2024, 2, 1), "Sum", "Sber", "=120+0"),
            long(date(2024, 2, 1), "Sum", "VTB", "=0+0"),
        ]
    }

    fn sample_table() -> WideTable {
        build_wide(&sample_rows(), &panel(), &order())
    }

    #[test]
    fn rows_are_indicator_major_in_model_order() {
        let table = sample_table();
        let keys: Vec<(&str, &str)> = table
            .rows
            .iter()
            .map(|r| (r.indicator.as_str(), r.bank.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Capital", "Sber"),
                ("Capital", "VTB"),
                ("Sum", "Sber"),
                ("Sum", "VTB"),
            ]
        );
    }

    #[test]
    fn cells_line_up_with_the_date_columns() {
        let table = sample_table();
        assert_eq!(table.dates, vec![date(2024, 1, 1), date(2024, 2, 1)]);
        assert_eq!(table.rows[0].values, vec!["=100", "=120"]);
        assert_eq!(table.rows[1].values, vec!["=5", "=0"]);
        assert_eq!(table.rows[3].values, vec!["=5+0", "=0+0"]);
    }

    #[test]
    fn cells_without_a_long_row_read_empty() {
        let rows = vec![
            long(date(2024, 1, 1), "Capital", "Sber", "=100"),
            long(date(2024, 2, 1), "Capital", "Sber", "=120"),
            long(date(2024, 1, 1), "Capital", "VTB", "=5"),
        ];
        let table = build_wide(&rows, &panel(), &order());
        assert_eq!(table.rows[1].values, vec!["=5", ""]);
        // an indicator in the model order with no rows at all still shows up
        assert_eq!(table.rows[2].indicator, "Sum");
        assert_eq!(table.rows[2].values, vec!["", ""]);
    }

    #[test]
    fn duplicate_cells_keep_the_first_row() {
        let rows = vec![
            long(date(2024, 1, 1), "Capital", "Sber", "=100"),
            long(date(2024, 1, 1), "Capital", "Sber", "=999"),
        ];
        let table = build_wide(&rows, &panel(), &order());
        assert_eq!(table.rows[0].values, vec!["=100"]);
    }

    #[test]
    fn csv_export_matches_the_layout() {
        let dir = tempdir().unwrap();
        let path = summary_path(dir.path(), "101");
        assert!(path.ends_with("form101_summary.csv"));
        export_csv(&path, &sample_table()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("indicator,bank,01.01.2024,01.02.2024"));
        assert_eq!(lines.next(), Some("Capital,Sber,=100,=120"));
    }

    #[test]
    fn dbf_snapshot_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("form101_summary.dbf");
        export_dbf(&path, &sample_table()).unwrap();

        let table = DbfTable::open(&path, TextEncoding::Cp866).unwrap();
        let names: Vec<&str> = table.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["INDICATOR", "BANK", "D20240101", "D20240201"]);
        let first = table.records().next().unwrap();
        assert_eq!(first.value(0), FieldValue::Text("Capital".to_owned()));
        assert_eq!(first.value(2), FieldValue::Text("=100".to_owned()));
    }
}
