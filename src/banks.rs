//! The bank panel, read from `models/banks.csv`. Columns: `bank` (display
//! name), `regn` (registration number in the credit institution registry)
//! and `sort` (position in the output). Rows without a positive `regn`
//! belong to entities that never report and are dropped.

use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_BANKS_PATH: &str = "models/banks.csv";

#[derive(Debug, Clone)]
pub struct Bank {
    pub bank: String,
    pub regn: i64,
    pub sort: i64,
}

impl Bank {
    /// Canonical registry key, matching how table registration numbers are
    /// normalised before indexing.
    pub fn regn_key(&self) -> String {
        self.regn.to_string()
    }
}

pub fn load_banks(path: &Path) -> Result<Vec<Bank>, ConfigError> {
    let csv_err = |source| ConfigError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = rdr.headers().map_err(csv_err)?.clone();

    let mut cols = [0usize; 3];
    for (i, name) in ["bank", "regn", "sort"].iter().enumerate() {
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
        let row = i + 2;
        let cell = |c: usize| record.get(cols[c]).unwrap_or("").trim();

        let bank = cell(0).to_owned();
        let regn: i64 = cell(1).parse().map_err(|_| ConfigError::BadRow {
            path: path.to_path_buf(),
            row,
            detail: format!("bad regn '{}'", cell(1)),
        })?;
        let sort: i64 = cell(2).parse().map_err(|_| ConfigError::BadRow {
            path: path.to_path_buf(),
            row,
            detail: format!("bad sort '{}'", cell(2)),
        })?;
        if regn <= 0 {
            debug!(bank = %bank, "skipping bank without a registration number");
            continue;
        }
        out.push(Bank { bank, regn, sort });
    }
    // stable, so equal sort keys keep their file order
    out.sort_by_key(|b| b.sort);
    debug!(count = out.len(), path = %path.display(), "bank panel loaded");
    Ok(out)
}
