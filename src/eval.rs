use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::formulas::{FormulaKind, FormulaSpec};
use crate::index::BankView;

/// How account/indicator codes are canonicalized for a form, applied to both
/// the table side and the expression side of a lookup.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodePolicy {
    /// Digits and decimal points survive, commas become points ("Н1.0" -> "1.0").
    Decimal,
    /// Digits only, canonicalized through integer parsing ("0123" -> "123").
    Integer,
    /// Whitespace is stripped and the rest uppercased ("сим а" -> "СИМА").
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Plus,
    Minus,
    Code(String),
}

#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub name: String,
    pub section: Option<u32>,
    pub kind: CompiledKind,
}

#[derive(Debug, Clone)]
pub enum CompiledKind {
    /// Concatenates looked-up values and operators into an "="-prefixed string.
    Formula { tokens: Vec<Token> },
    /// Reads a single value verbatim.
    Metric { code: String },
}

pub fn normalize_regn(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let trimmed = digits.trim_start_matches('0');
    if !trimmed.is_empty() {
        trimmed.to_owned()
    } else if digits.is_empty() {
        String::new()
    } else {
        "0".to_owned()
    }
}

pub fn normalize_code(raw: &str, policy: CodePolicy) -> String {
    match policy {
        CodePolicy::Decimal => {
            let s = raw.trim().replace(',', ".");
            s.chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect()
        }
        CodePolicy::Integer => {
            let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
            let trimmed = digits.trim_start_matches('0');
            if !trimmed.is_empty() {
                trimmed.to_owned()
            } else if digits.is_empty() {
                String::new()
            } else {
                "0".to_owned()
            }
        }
        CodePolicy::Label => raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_uppercase)
            .collect(),
    }
}

/// Empty or missing values become None; the lookup substitutes "0" for those.
pub fn normalize_value(raw: Option<&str>) -> Option<String> {
    let s = raw?.trim().replace(',', ".");
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Splits an expression into codes and +/- operators. Anything the policy's
/// token pattern does not recognize is dropped, so "Н1.0" tokenizes to "1.0"
/// under the decimal policy.
pub fn tokenize(expression: &str, policy: CodePolicy) -> Vec<Token> {
    lazy_static! {
        static ref RE_DECIMAL_TOKENS: Regex = Regex::new(r"\d+(?:\.\d+)?|[+]|[-]").unwrap();
        static ref RE_INTEGER_TOKENS: Regex = Regex::new(r"\d+|[+]|[-]").unwrap();
        static ref RE_LABEL_TOKENS: Regex = Regex::new(r"[A-Za-zА-Яа-я0-9]+|[+]|[-]").unwrap();
    }

    let re: &Regex = match policy {
        CodePolicy::Decimal => &RE_DECIMAL_TOKENS,
        CodePolicy::Integer => &RE_INTEGER_TOKENS,
        CodePolicy::Label => &RE_LABEL_TOKENS,
    };

    re.find_iter(expression)
        .map(|m| match m.as_str() {
            "+" => Token::Plus,
            "-" => Token::Minus,
            code => Token::Code(normalize_code(code, policy)),
        })
        .collect()
}

pub fn compile(spec: &FormulaSpec, policy: CodePolicy) -> Result<CompiledFormula, ConfigError> {
    let section = match spec.section.as_deref() {
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) => Some(v),
            Err(_) => {
                return Err(ConfigError::BadSection {
                    name: spec.name.clone(),
                    value: raw.to_owned(),
                })
            }
        },
        None => None,
    };

    match spec.kind {
        FormulaKind::Formula => Ok(CompiledFormula {
            name: spec.name.clone(),
            section,
            kind: CompiledKind::Formula {
                tokens: tokenize(&spec.expression, policy),
            },
        }),
        FormulaKind::Metric => {
            let code = normalize_code(&spec.expression, policy);
            if code.is_empty() {
                return Err(ConfigError::EmptyExpression {
                    name: spec.name.clone(),
                });
            }
            if section.is_some() {
                warn!(formula = %spec.name, "metric formulas ignore the section extra");
            }
            Ok(CompiledFormula {
                name: spec.name.clone(),
                section: None,
                kind: CompiledKind::Metric { code },
            })
        }
    }
}

/// Builds the output cell for one bank and one compiled formula. Formulas
/// become "="-prefixed concatenations of values and operators; the string is
/// never evaluated arithmetically here, that is left to the spreadsheet the
/// table lands in. Metrics pass the stored value through unchanged.
pub fn evaluate(formula: &CompiledFormula, bank: &BankView) -> String {
    match &formula.kind {
        CompiledKind::Formula { tokens } => {
            let mut acc = String::from("=");
            for token in tokens {
                match token {
                    Token::Plus => acc.push('+'),
                    Token::Minus => acc.push('-'),
                    Token::Code(code) => acc.push_str(bank.resolve(formula.section, code)),
                }
            }
            acc
        }
        CompiledKind::Metric { code } => bank.resolve(None, code).to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{LookupIndex, RawRecord};

    fn record(regn: &str, code: &str, section: Option<u32>, value: &str) -> RawRecord {
        RawRecord {
            regn: regn.to_owned(),
            code: code.to_owned(),
            section,
            value: Some(value.to_owned()),
        }
    }

    #[test]
    fn regn_normalization_strips_to_canonical_digits() {
        assert_eq!(normalize_regn(" 0451 "), "451");
        assert_eq!(normalize_regn("р-1481"), "1481");
        assert_eq!(normalize_regn("000"), "0");
        assert_eq!(normalize_regn("none"), "");
    }

    #[test]
    fn code_normalization_follows_policy() {
        assert_eq!(normalize_code("Н1.0", CodePolicy::Decimal), "1.0");
        assert_eq!(normalize_code(" 45,2 ", CodePolicy::Decimal), "45.2");
        assert_eq!(normalize_code("0123", CodePolicy::Integer), "123");
        assert_eq!(normalize_code("000", CodePolicy::Integer), "0");
        assert_eq!(normalize_code(" 11 000 ", CodePolicy::Label), "11000");
        assert_eq!(normalize_code("сим а", CodePolicy::Label), "СИМА");
    }

    #[test]
    fn value_normalization_maps_blank_to_absent() {
        assert_eq!(normalize_value(Some(" 12,5 ")), Some("12.5".to_owned()));
        assert_eq!(normalize_value(Some("")), None);
        assert_eq!(normalize_value(Some("   ")), None);
        assert_eq!(normalize_value(None), None);
    }

    #[test]
    fn tokenize_splits_codes_and_operators() {
        let tokens = tokenize("20202+20208-10605", CodePolicy::Decimal);
        assert_eq!(
            tokens,
            vec![
                Token::Code("20202".to_owned()),
                Token::Plus,
                Token::Code("20208".to_owned()),
                Token::Minus,
                Token::Code("10605".to_owned()),
            ]
        );
    }

    #[test]
    fn tokenize_decimal_keeps_fractional_codes_whole() {
        let tokens = tokenize("Н1.0 + Н2", CodePolicy::Decimal);
        assert_eq!(
            tokens,
            vec![
                Token::Code("1.0".to_owned()),
                Token::Plus,
                Token::Code("2".to_owned()),
            ]
        );
    }

    #[test]
    fn tokenize_label_accepts_cyrillic_symbols() {
        let tokens = tokenize("11000-СИМ1", CodePolicy::Label);
        assert_eq!(
            tokens,
            vec![
                Token::Code("11000".to_owned()),
                Token::Minus,
                Token::Code("СИМ1".to_owned()),
            ]
        );
    }

    #[test]
    fn formula_concatenates_without_arithmetic() {
        let index = LookupIndex::build(
            vec![
                record("1481", "20202", None, "100"),
                record("1481", "20208", None, "50"),
                record("1481", "10605", None, "30"),
            ],
            CodePolicy::Decimal,
        );
        let spec = FormulaSpec {
            form: "101".to_owned(),
            kind: FormulaKind::Formula,
            name: "Касса".to_owned(),
            expression: "20202+20208-10605".to_owned(),
            section: None,
        };
        let compiled = compile(&spec, CodePolicy::Decimal).unwrap();
        assert_eq!(evaluate(&compiled, &index.bank("1481")), "=100+50-30");
    }

    #[test]
    fn missing_codes_default_to_zero() {
        let index = LookupIndex::build(
            vec![record("1481", "20202", None, "100")],
            CodePolicy::Decimal,
        );
        let spec = FormulaSpec {
            form: "101".to_owned(),
            kind: FormulaKind::Formula,
            name: "x".to_owned(),
            expression: "20202+99999".to_owned(),
            section: None,
        };
        let compiled = compile(&spec, CodePolicy::Decimal).unwrap();
        assert_eq!(evaluate(&compiled, &index.bank("1481")), "=100+0");
        // a bank absent from the table resolves every code to zero
        assert_eq!(evaluate(&compiled, &index.bank("9999")), "=0+0");
    }

    #[test]
    fn metric_returns_value_verbatim() {
        let index = LookupIndex::build(
            vec![record("1481", "Н1.0", None, "12.35")],
            CodePolicy::Decimal,
        );
        let spec = FormulaSpec {
            form: "135".to_owned(),
            kind: FormulaKind::Metric,
            name: "Н1.0".to_owned(),
            expression: "Н1.0".to_owned(),
            section: None,
        };
        let compiled = compile(&spec, CodePolicy::Decimal).unwrap();
        assert_eq!(evaluate(&compiled, &index.bank("1481")), "12.35");
        assert_eq!(evaluate(&compiled, &index.bank("1")), "0");
    }

    #[test]
    fn sectioned_formula_prefers_sectioned_entries() {
        let index = LookupIndex::build(
            vec![
                record("1481", "20202", Some(1), "700"),
                record("1481", "20202", Some(2), "800"),
            ],
            CodePolicy::Decimal,
        );
        let spec = FormulaSpec {
            form: "101".to_owned(),
            kind: FormulaKind::Formula,
            name: "Актив".to_owned(),
            expression: "20202".to_owned(),
            section: Some("1".to_owned()),
        };
        let compiled = compile(&spec, CodePolicy::Decimal).unwrap();
        assert_eq!(evaluate(&compiled, &index.bank("1481")), "=700");
    }

    #[test]
    fn bad_section_value_is_rejected() {
        let spec = FormulaSpec {
            form: "101".to_owned(),
            kind: FormulaKind::Formula,
            name: "x".to_owned(),
            expression: "20202".to_owned(),
            section: Some("actives".to_owned()),
        };
        assert!(matches!(
            compile(&spec, CodePolicy::Decimal),
            Err(ConfigError::BadSection { .. })
        ));
    }
}
