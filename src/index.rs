use indexmap::IndexMap;

use crate::eval::{normalize_code, normalize_regn, normalize_value, CodePolicy};

/// One decoded table row, still carrying raw field strings. Normalization
/// happens when the row is folded into the index.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub regn: String,
    pub code: String,
    pub section: Option<u32>,
    pub value: Option<String>,
}

type CodeMap = IndexMap<String, Option<String>>;

/// Per-date lookup over decoded records, keyed by registration number and
/// code, with an optional section dimension. The first record seen for a key
/// wins; later duplicates are ignored, including duplicates of keys whose
/// stored value decoded to absent.
#[derive(Debug, Default)]
pub struct LookupIndex {
    plain: IndexMap<String, CodeMap>,
    sectioned: IndexMap<String, IndexMap<u32, CodeMap>>,
}

impl LookupIndex {
    pub fn build(records: impl IntoIterator<Item = RawRecord>, policy: CodePolicy) -> LookupIndex {
        let mut index = LookupIndex::default();

        for record in records {
            let regn = normalize_regn(&record.regn);
            if regn.is_empty() {
                continue;
            }
            let code = normalize_code(&record.code, policy);
            if code.is_empty() {
                continue;
            }
            let value = normalize_value(record.value.as_deref());

            if let Some(section) = record.section {
                index
                    .sectioned
                    .entry(regn.clone())
                    .or_insert_with(IndexMap::new)
                    .entry(section)
                    .or_insert_with(IndexMap::new)
                    .entry(code.clone())
                    .or_insert_with(|| value.clone());
            }

            index
                .plain
                .entry(regn)
                .or_insert_with(IndexMap::new)
                .entry(code)
                .or_insert(value);
        }

        index
    }

    /// Number of distinct (regn, code) pairs indexed.
    pub fn len(&self) -> usize {
        self.plain.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty()
    }

    pub fn bank(&self, regn: &str) -> BankView<'_> {
        BankView {
            plain: self.plain.get(regn),
            sectioned: self.sectioned.get(regn),
        }
    }
}

/// Borrowed view of one bank's slice of the index, resolved once per bank so
/// the per-token lookups stay O(1) map probes.
#[derive(Debug, Clone, Copy)]
pub struct BankView<'a> {
    plain: Option<&'a CodeMap>,
    sectioned: Option<&'a IndexMap<u32, CodeMap>>,
}

impl<'a> BankView<'a> {
    /// Key presence decides which map answers: a sectioned key that exists
    /// shadows the plain one even when its stored value is absent. Absent
    /// values and missing keys both resolve to "0".
    pub fn resolve(&self, section: Option<u32>, code: &str) -> &'a str {
        let mut slot = None;
        if let (Some(s), Some(by_section)) = (section, self.sectioned) {
            slot = by_section.get(&s).and_then(|codes| codes.get(code));
        }
        if slot.is_none() {
            slot = self.plain.and_then(|codes| codes.get(code));
        }
        match slot {
            Some(Some(value)) => value.as_str(),
            _ => "0",
        }
    }
}
