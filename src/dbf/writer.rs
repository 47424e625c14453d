//! Minimal dBase III writer. Good enough for archival snapshots and for
//! table fixtures in tests; no memo fields, no index files.

use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use chrono::{Datelike, Local};

use crate::dbf::reader::TextEncoding;
use crate::error::DbfError;

#[derive(Debug, Clone, Copy)]
pub enum ColumnType {
    Character,
    Numeric,
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnType,
    pub width: u8,
    pub decimals: u8,
}

impl ColumnSpec {
    pub fn character(name: &str, width: u8) -> ColumnSpec {
        ColumnSpec {
            name: name.to_owned(),
            kind: ColumnType::Character,
            width,
            decimals: 0,
        }
    }

    pub fn numeric(name: &str, width: u8, decimals: u8) -> ColumnSpec {
        ColumnSpec {
            name: name.to_owned(),
            kind: ColumnType::Numeric,
            width,
            decimals,
        }
    }
}

/// Writes `rows` as a dBase III table. Cells are truncated to the column
/// width; rows shorter than the column list are padded with blanks.
pub fn write_dbf(
    path: &Path,
    columns: &[ColumnSpec],
    rows: &[Vec<String>],
    encoding: TextEncoding,
) -> Result<(), DbfError> {
    let record_len: usize = 1 + columns.iter().map(|c| c.width as usize).sum::<usize>();
    let header_len = 32 + columns.len() * 32 + 1;
    let mut out = Vec::with_capacity(header_len + rows.len() * record_len + 1);

    out.push(0x03); // dBase III, no memo
    let today = Local::now();
    out.push(u8::try_from(today.year() - 1900).unwrap_or(0));
    out.push(today.month() as u8);
    out.push(today.day() as u8);
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(&(record_len as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 20]);

    for col in columns {
        let mut descriptor = [0u8; 32];
        let name = field_name(&col.name);
        descriptor[..name.len()].copy_from_slice(name.as_bytes());
        descriptor[11] = match col.kind {
            ColumnType::Character => b'C',
            ColumnType::Numeric => b'N',
        };
        descriptor[16] = col.width;
        descriptor[17] = col.decimals;
        out.extend_from_slice(&descriptor);
    }
    out.push(0x0d);

    let empty = String::new();
    for row in rows {
        out.push(0x20); // live record
        for (i, col) in columns.iter().enumerate() {
            let cell = row.get(i).unwrap_or(&empty);
            push_cell(&mut out, col, cell, encoding);
        }
    }
    out.push(0x1a);

    fs::write(path, &out)?;
    Ok(())
}

/// Field names are at most 10 bytes of ASCII letters, digits and
/// underscores, uppercased the way every table in the feed spells them.
fn field_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_uppercase())
        .take(10)
        .collect();
    if cleaned.is_empty() {
        "FIELD".to_owned()
    } else {
        cleaned
    }
}

fn push_cell(out: &mut Vec<u8>, col: &ColumnSpec, cell: &str, encoding: TextEncoding) {
    let width = col.width as usize;
    match col.kind {
        ColumnType::Character => {
            let encoded = encode_text(cell, encoding);
            let take = encoded.len().min(width);
            out.extend_from_slice(&encoded[..take]);
            out.resize(out.len() + width - take, b' ');
        }
        ColumnType::Numeric => {
            let digits: Vec<u8> = cell
                .bytes()
                .filter(|b| b.is_ascii() && !b.is_ascii_whitespace())
                .collect();
            let take = digits.len().min(width);
            // numeric cells are right-aligned
            out.resize(out.len() + width - take, b' ');
            out.extend_from_slice(&digits[..take]);
        }
    }
}

fn encode_text(cell: &str, encoding: TextEncoding) -> Vec<u8> {
    let table = match encoding {
        TextEncoding::Cp866 => encoding_rs::IBM866,
        TextEncoding::Cp1251 => encoding_rs::WINDOWS_1251,
    };
    let (bytes, _, _) = table.encode(cell);
    bytes.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_geometry_matches_the_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dbf");
        let columns = vec![
            ColumnSpec::character("REGN", 8),
            ColumnSpec::numeric("IITG", 12, 2),
        ];
        write_dbf(&path, &columns, &[], TextEncoding::Cp866).unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(data[0], 0x03);
        assert_eq!(u32::from_le_bytes([data[4], data[5], data[6], data[7]]), 0);
        assert_eq!(u16::from_le_bytes([data[8], data[9]]), 97);
        assert_eq!(u16::from_le_bytes([data[10], data[11]]), 21);
        assert_eq!(data[96], 0x0d);
        assert_eq!(*data.last().unwrap(), 0x1a);
    }

    #[test]
    fn long_names_are_clipped_to_ten_bytes() {
        assert_eq!(field_name("sim_itogo_total"), "SIM_ITOGO_");
        assert_eq!(field_name(""), "FIELD");
    }

    #[test]
    fn numeric_cells_are_right_aligned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dbf");
        let columns = vec![ColumnSpec::numeric("V", 6, 0)];
        let rows = vec![vec!["42".to_owned()]];
        write_dbf(&path, &columns, &rows, TextEncoding::Cp866).unwrap();

        let data = fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
        assert_eq!(&data[header_len..header_len + 7], b"\x20    42");
    }
}
