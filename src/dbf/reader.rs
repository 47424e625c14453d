//! Reader for dBase III/IV tables as published by the regulator.
//!
//! The files in the wild are messy: character payloads in cp866 with the
//! occasional cp1251 stray, numeric columns that hold text, packed
//! little-endian integers inside fields declared as numeric, and deleted
//! rows left in place. Decoding is therefore deliberately forgiving; a
//! field that cannot be made sense of yields [`FieldValue::Absent`] rather
//! than an error.

use std::convert::TryFrom;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use encoding_rs::{Encoding, IBM866, WINDOWS_1251};

use crate::error::DbfError;

const DELETED_FLAG: u8 = 0x2a;
const DESCRIPTOR_TERMINATOR: u8 = 0x0d;
const DESCRIPTOR_LEN: usize = 32;
const HEADER_LEN: usize = 32;

/// Single-byte codepages seen in the regulator's archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Cp866,
    Cp1251,
}

impl TextEncoding {
    pub fn from_label(label: &str) -> Option<TextEncoding> {
        match label.trim().to_ascii_lowercase().as_str() {
            "cp866" | "ibm866" | "866" => Some(TextEncoding::Cp866),
            "cp1251" | "windows-1251" | "windows1251" | "1251" => Some(TextEncoding::Cp1251),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Cp866 => "cp866",
            TextEncoding::Cp1251 => "cp1251",
        }
    }

    fn table(self) -> &'static Encoding {
        match self {
            TextEncoding::Cp866 => IBM866,
            TextEncoding::Cp1251 => WINDOWS_1251,
        }
    }

    fn counterpart(self) -> TextEncoding {
        match self {
            TextEncoding::Cp866 => TextEncoding::Cp1251,
            TextEncoding::Cp1251 => TextEncoding::Cp866,
        }
    }
}

/// Decodes character payloads with the configured codepage, retrying the
/// sibling codepage for fields the primary one cannot represent.
#[derive(Debug, Clone, Copy)]
pub struct TextCodec {
    primary: TextEncoding,
}

impl TextCodec {
    pub fn new(primary: TextEncoding) -> TextCodec {
        TextCodec { primary }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _, had_errors) = self.primary.table().decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
        let (alt, _, alt_errors) = self.primary.counterpart().table().decode(bytes);
        if alt_errors {
            text.into_owned()
        } else {
            alt.into_owned()
        }
    }
}

/// One column of a table: name as stored (uppercased), dBase type tag,
/// width in bytes, and the byte offset inside a record.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: u8,
    pub length: usize,
    pub decimals: u8,
    pub offset: usize,
}

/// A decoded cell. Numeric columns come back as `Int`/`Float`, character
/// columns as `Text`, and anything blank or unparseable as `Absent`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Absent,
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Canonical textual rendering, or `None` when the cell carries nothing.
    pub fn display(&self) -> Option<String> {
        match self {
            FieldValue::Absent => None,
            FieldValue::Int(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(format_float(*v)),
            FieldValue::Text(s) => {
                if s.is_empty() {
                    None
                } else {
                    Some(s.clone())
                }
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Absent => None,
            FieldValue::Int(v) => Some(*v),
            FieldValue::Float(v) => Some(v.trunc() as i64),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Whole floats keep a trailing `.0` so that `45.0` and `45` render apart.
fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// A table loaded fully into memory.
#[derive(Debug)]
pub struct DbfTable {
    data: Vec<u8>,
    header_len: usize,
    record_len: usize,
    record_count: usize,
    fields: Vec<FieldDescriptor>,
    codec: TextCodec,
}

impl DbfTable {
    pub fn open(path: &Path, encoding: TextEncoding) -> Result<DbfTable, DbfError> {
        let data = fs::read(path)?;
        if data.len() < HEADER_LEN {
            return Err(DbfError::Truncated(data.len()));
        }
        let declared = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
        let record_len = u16::from_le_bytes([data[10], data[11]]) as usize;
        if header_len <= HEADER_LEN || header_len > data.len() {
            return Err(DbfError::BadHeader {
                header_len,
                file_len: data.len(),
            });
        }
        if record_len == 0 {
            return Err(DbfError::BadLayout { record_len });
        }
        let fields = parse_descriptors(&data[HEADER_LEN..header_len], record_len)?;
        // Truncated files understate their payload; never walk past the end.
        let available = (data.len() - header_len) / record_len;
        let record_count = declared.min(available);
        Ok(DbfTable {
            data,
            header_len,
            record_len,
            record_count,
            fields,
            codec: TextCodec::new(encoding),
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Iterates live records; rows flagged as deleted are skipped.
    pub fn records(&self) -> Records<'_> {
        Records {
            table: self,
            next: 0,
        }
    }
}

/// Parses just the column descriptors of a table, without its payload.
/// Cheap enough to run over every candidate file inside an archive.
pub fn read_schema(path: &Path) -> Result<Vec<FieldDescriptor>, DbfError> {
    let file_len = fs::metadata(path)?.len() as usize;
    if file_len < HEADER_LEN {
        return Err(DbfError::Truncated(file_len));
    }
    let mut file = fs::File::open(path)?;
    let mut head = [0u8; HEADER_LEN];
    read_fully(&mut file, &mut head, file_len)?;
    let header_len = u16::from_le_bytes([head[8], head[9]]) as usize;
    let record_len = u16::from_le_bytes([head[10], head[11]]) as usize;
    if header_len <= HEADER_LEN || header_len > file_len {
        return Err(DbfError::BadHeader {
            header_len,
            file_len,
        });
    }
    if record_len == 0 {
        return Err(DbfError::BadLayout { record_len });
    }
    let mut area = vec![0u8; header_len - HEADER_LEN];
    read_fully(&mut file, &mut area, file_len)?;
    parse_descriptors(&area, record_len)
}

fn read_fully(file: &mut fs::File, buf: &mut [u8], file_len: usize) -> Result<(), DbfError> {
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DbfError::Truncated(file_len)),
        Err(e) => Err(e.into()),
    }
}

fn parse_descriptors(area: &[u8], record_len: usize) -> Result<Vec<FieldDescriptor>, DbfError> {
    let mut fields = Vec::new();
    let mut offset = 1; // byte 0 of every record is the deletion flag
    let mut pos = 0;
    while pos < area.len() && area[pos] != DESCRIPTOR_TERMINATOR {
        if pos + DESCRIPTOR_LEN > area.len() {
            return Err(DbfError::BadLayout { record_len });
        }
        let raw = &area[pos..pos + DESCRIPTOR_LEN];
        let name_end = raw[..11].iter().position(|b| *b == 0).unwrap_or(11);
        let name = String::from_utf8_lossy(&raw[..name_end])
            .trim()
            .to_uppercase();
        let length = raw[16] as usize;
        fields.push(FieldDescriptor {
            name,
            kind: raw[11],
            length,
            decimals: raw[17],
            offset,
        });
        offset += length;
        pos += DESCRIPTOR_LEN;
    }
    if offset > record_len {
        return Err(DbfError::BadLayout { record_len });
    }
    Ok(fields)
}

pub struct Records<'a> {
    table: &'a DbfTable,
    next: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = RecordView<'a>;

    fn next(&mut self) -> Option<RecordView<'a>> {
        while self.next < self.table.record_count {
            let start = self.table.header_len + self.next * self.table.record_len;
            self.next += 1;
            let raw = &self.table.data[start..start + self.table.record_len];
            if raw[0] == DELETED_FLAG {
                continue;
            }
            return Some(RecordView {
                table: self.table,
                raw,
            });
        }
        None
    }
}

/// A borrowed view over one live record.
pub struct RecordView<'a> {
    table: &'a DbfTable,
    raw: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Decodes the cell at the given field index.
    pub fn value(&self, field: usize) -> FieldValue {
        let desc = &self.table.fields[field];
        let end = (desc.offset + desc.length).min(self.raw.len());
        if desc.offset >= end {
            return FieldValue::Absent;
        }
        decode_field(desc.kind, &self.raw[desc.offset..end], &self.table.codec)
    }
}

fn decode_field(kind: u8, bytes: &[u8], codec: &TextCodec) -> FieldValue {
    match kind {
        b'C' => {
            let text = codec.decode(bytes);
            let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
            FieldValue::Text(trimmed.to_owned())
        }
        b'N' | b'F' => decode_numeric(bytes),
        b'I' => decode_packed_signed(bytes),
        b'L' => match bytes.first() {
            Some(b'T') | Some(b't') | Some(b'Y') | Some(b'y') => FieldValue::Text("T".to_owned()),
            Some(b'F') | Some(b'f') | Some(b'N') | Some(b'n') => FieldValue::Text("F".to_owned()),
            _ => FieldValue::Absent,
        },
        b'D' => {
            let text: String = bytes
                .iter()
                .map(|b| *b as char)
                .filter(|c| !c.is_whitespace() && *c != '\0')
                .collect();
            if text.is_empty() {
                FieldValue::Absent
            } else {
                FieldValue::Text(text)
            }
        }
        // Memo and other exotic types carry nothing the pipeline uses.
        _ => FieldValue::Absent,
    }
}

/// Numeric cells are tried in order: plain integer text, float text with a
/// decimal comma, a packed little-endian integer when the field is 2, 4 or
/// 8 bytes wide, and finally the text with all non-ASCII bytes dropped.
/// Blank cells short-circuit to `Absent` before the packed probe so a run
/// of spaces is never mistaken for an integer.
fn decode_numeric(bytes: &[u8]) -> FieldValue {
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|b| *b != 0).collect();
    let text = String::from_utf8_lossy(&cleaned);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return FieldValue::Absent;
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return FieldValue::Int(v);
    }
    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return FieldValue::Float(v);
    }
    if let Some(v) = packed_le_unsigned(bytes) {
        return FieldValue::Int(v);
    }
    let ascii: String = trimmed.chars().filter(|c| c.is_ascii()).collect();
    let dotted = ascii.replace(',', ".");
    let stripped = dotted.trim();
    if stripped.is_empty() {
        return FieldValue::Absent;
    }
    if let Ok(v) = stripped.parse::<i64>() {
        FieldValue::Int(v)
    } else if let Ok(v) = stripped.parse::<f64>() {
        FieldValue::Float(v)
    } else {
        FieldValue::Absent
    }
}

fn packed_le_unsigned(bytes: &[u8]) -> Option<i64> {
    match bytes.len() {
        2 => Some(i64::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => Some(i64::from(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            i64::try_from(u64::from_le_bytes(buf)).ok()
        }
        _ => None,
    }
}

fn decode_packed_signed(bytes: &[u8]) -> FieldValue {
    match bytes.len() {
        2 => FieldValue::Int(i64::from(i16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => FieldValue::Int(i64::from(i32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            FieldValue::Int(i64::from_le_bytes(buf))
        }
        _ => decode_numeric(bytes),
    }
}
