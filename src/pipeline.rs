//! The per-form run: walk the report dates, download and unpack each
//! archive, select and decode its table, and index it for lookups. A date
//! that fails is logged and skipped; the remaining dates still produce a
//! summary. Dates run on a worker pool when requested, and results come
//! back in calendar order either way.

use std::convert::TryFrom;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::banks::Bank;
use crate::config::FormConfig;
use crate::dbf::picker::{self, TableLayout};
use crate::dbf::reader::DbfTable;
use crate::error::{ConfigError, DateError, RunError};
use crate::eval;
use crate::extract::Extractor;
use crate::fetch::Fetcher;
use crate::formulas::{self, FormulaSpec};
use crate::index::{LookupIndex, RawRecord};
use crate::output::{self, LongRow, WideTable};
use crate::scratch::ScratchDir;

/// Cooperative cancellation flag, checked between pipeline stages. Set it
/// from any thread; in-flight downloads finish, nothing new starts.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run progress callbacks, for embedders that want a progress bar or
/// counters. Every method has an empty default so implementors pick what
/// they care about.
pub trait ProgressObserver: Send + Sync {
    fn started(&self, _form: &str, _dates: usize) {}
    fn date_ok(&self, _form: &str, _date: NaiveDate, _records: usize) {}
    fn date_skipped(&self, _form: &str, _date: NaiveDate, _error: &DateError) {}
    fn finished(&self, _form: &str, _processed: usize, _skipped: usize) {}
}

pub struct NullObserver;

impl ProgressObserver for NullObserver {}

/// Everything a form run borrows from its surroundings.
pub struct FormContext<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub extractor: &'a dyn Extractor,
    pub cancel: &'a CancelToken,
    pub observer: &'a dyn ProgressObserver,
    pub workers: usize,
}

/// One decoded report date.
pub struct DateTable {
    pub date: NaiveDate,
    pub index: LookupIndex,
}

pub struct DateSeries {
    pub tables: Vec<DateTable>,
    pub skipped: usize,
}

pub struct FormOutcome {
    pub form_id: String,
    pub name: String,
    /// Every evaluated (date, bank, indicator) cell, dates outermost.
    pub rows: Vec<LongRow>,
    pub table: WideTable,
    pub processed: usize,
    pub skipped: usize,
}

/// Runs one form over the date grid, evaluates its models into long rows
/// and pivots them into the wide summary.
pub fn run_form(
    form_id: &str,
    cfg: &FormConfig,
    dates: &[NaiveDate],
    banks: &[Bank],
    models: &[&FormulaSpec],
    ctx: &FormContext,
) -> Result<FormOutcome, RunError> {
    if models.is_empty() {
        return Err(ConfigError::NoFormulas(form_id.to_owned()).into());
    }
    let mut compiled = Vec::with_capacity(models.len());
    for model in models {
        compiled.push(eval::compile(model, cfg.code_policy)?);
    }
    info!(
        form = form_id,
        dates = dates.len(),
        formulas = compiled.len(),
        "form run starting"
    );

    let series = collect_dates(form_id, cfg, dates, ctx)?;
    let mut rows = Vec::with_capacity(series.tables.len() * compiled.len() * banks.len());
    for date_table in &series.tables {
        let views: Vec<_> = banks
            .iter()
            .map(|b| (b, date_table.index.bank(&b.regn_key())))
            .collect();
        for formula in &compiled {
            for (bank, view) in &views {
                rows.push(LongRow {
                    date: date_table.date,
                    bank: bank.bank.clone(),
                    indicator: formula.name.clone(),
                    value: eval::evaluate(formula, view),
                });
            }
        }
    }
    let order = formulas::indicator_order(models);
    let table = output::build_wide(&rows, banks, &order);
    ctx.observer
        .finished(form_id, series.tables.len(), series.skipped);
    info!(
        form = form_id,
        processed = series.tables.len(),
        skipped = series.skipped,
        "form run finished"
    );
    Ok(FormOutcome {
        form_id: form_id.to_owned(),
        name: cfg.name.clone(),
        rows,
        table,
        processed: series.tables.len(),
        skipped: series.skipped,
    })
}

/// Downloads and indexes every requested date. The scratch directory is
/// shared by all workers; per-date names keep them out of each other's
/// way.
pub fn collect_dates(
    form_id: &str,
    cfg: &FormConfig,
    dates: &[NaiveDate],
    ctx: &FormContext,
) -> Result<DateSeries, RunError> {
    let scratch = ScratchDir::new()?;
    ctx.observer.started(form_id, dates.len());

    let mut results: Vec<(usize, Result<LookupIndex, DateError>)> = if ctx.workers > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.workers)
            .build()
            .map_err(|e| RunError::Pool(e.to_string()))?;
        pool.install(|| {
            dates
                .par_iter()
                .enumerate()
                .map(|(i, date)| (i, process_date(form_id, cfg, *date, &scratch, ctx)))
                .collect()
        })
    } else {
        dates
            .iter()
            .enumerate()
            .map(|(i, date)| (i, process_date(form_id, cfg, *date, &scratch, ctx)))
            .collect()
    };
    scratch.cleanup();

    if ctx.cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    results.sort_by_key(|(i, _)| *i);
    let mut tables = Vec::new();
    let mut skipped = 0;
    for (i, res) in results {
        let date = dates[i];
        match res {
            Ok(index) => {
                debug!(form = form_id, date = %date, records = index.len(), "report date ready");
                ctx.observer.date_ok(form_id, date, index.len());
                tables.push(DateTable { date, index });
            }
            Err(e) => {
                warn!(form = form_id, date = %date, error = %e, "report date skipped");
                ctx.observer.date_skipped(form_id, date, &e);
                skipped += 1;
            }
        }
    }
    Ok(DateSeries { tables, skipped })
}

fn process_date(
    form_id: &str,
    cfg: &FormConfig,
    date: NaiveDate,
    scratch: &ScratchDir,
    ctx: &FormContext,
) -> Result<LookupIndex, DateError> {
    if ctx.cancel.is_cancelled() {
        return Err(DateError::Cancelled);
    }
    let ymd = date.format("%Y%m%d").to_string();
    let url = cfg.archive_url(form_id, date);
    let bytes = ctx.fetcher.fetch(&url)?;

    if ctx.cancel.is_cancelled() {
        return Err(DateError::Cancelled);
    }
    let archive = scratch.archive_path(&ymd, &cfg.archive_ext);
    fs::write(&archive, &bytes)?;
    let dest = scratch.extract_dir(&ymd);
    ctx.extractor.extract(&archive, &dest)?;

    if ctx.cancel.is_cancelled() {
        return Err(DateError::Cancelled);
    }
    let pick = picker::pick_table(&dest, &cfg.roles, cfg.table_hint.as_deref())?;
    debug!(
        form = form_id,
        date = %date,
        table = %pick.path.display(),
        score = pick.score,
        "table selected"
    );
    let table = DbfTable::open(&pick.path, cfg.text_encoding())?;
    Ok(build_index(&table, &pick.layout, cfg))
}

/// Reads the three (or four) role columns of every live record and hands
/// them to the index; rows that normalise to nothing are dropped there.
fn build_index(table: &DbfTable, layout: &TableLayout, cfg: &FormConfig) -> LookupIndex {
    let mut records = Vec::with_capacity(table.record_count());
    for row in table.records() {
        let regn = row.value(layout.regn).display().unwrap_or_default();
        let code = row.value(layout.code).display().unwrap_or_default();
        let value = row.value(layout.value).display();
        let section = layout
            .section
            .and_then(|i| row.value(i).as_int())
            .and_then(|v| u32::try_from(v).ok());
        records.push(RawRecord {
            regn,
            code,
            section,
            value,
        });
    }
    LookupIndex::build(records, cfg.code_policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbf::reader::TextEncoding;
    use crate::dbf::writer::{write_dbf, ColumnSpec};
    use crate::eval::CodePolicy;
    use tempfile::tempdir;

    #[test]
    fn cancel_token_is_sticky_and_shared() {
        let token = CancelToken::new();
        let viewer = token.clone();
        assert!(!viewer.is_cancelled());
        token.cancel();
        assert!(viewer.is_cancelled());
    }

    #[test]
    fn index_construction_reads_the_layout_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b1.dbf");
        let columns = vec![
            ColumnSpec::character("REGN", 8),
            ColumnSpec::character("NUM_SC", 8),
            ColumnSpec::character("A_P", 2),
            ColumnSpec::numeric("IITG", 12, 2),
        ];
        let rows = vec![
            vec![
                "01481".to_owned(),
                "10207".to_owned(),
                "1".to_owned(),
                "100.5".to_owned(),
            ],
            vec![
                "1481".to_owned(),
                "20202".to_owned(),
                "".to_owned(),
                "7".to_owned(),
            ],
        ];
        write_dbf(&path, &columns, &rows, TextEncoding::Cp866).unwrap();

        let cfg: FormConfig = toml::from_str(
            r#"
            name = "f101"
            code_policy = "decimal"
            [roles]
            regn = ["REGN"]
            code = ["NUM_SC"]
            value = ["IITG"]
            section = ["A_P"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.code_policy, CodePolicy::Decimal);
        let pick = picker::pick_table(dir.path(), &cfg.roles, None).unwrap();
        let table = DbfTable::open(&pick.path, TextEncoding::Cp866).unwrap();
        let index = build_index(&table, &pick.layout, &cfg);

        let bank = index.bank("1481");
        assert_eq!(bank.resolve(Some(1), "10207"), "100.5");
        assert_eq!(bank.resolve(None, "20202"), "7");
        assert_eq!(bank.resolve(None, "99999"), "0");
    }
}
