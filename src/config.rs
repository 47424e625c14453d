//! Form catalogue, loaded from `config/forms.toml`. One entry per form
//! code describes where its archives live, which codepage the tables use,
//! how field roles map onto table schemas and how codes are normalised.
//!
//! Everything is validated up front so a bad catalogue fails the run
//! before a single request goes out.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use crate::dbf::picker::RoleSpec;
use crate::dbf::reader::TextEncoding;
use crate::error::ConfigError;
use crate::eval::CodePolicy;

pub const DEFAULT_FORMS_PATH: &str = "config/forms.toml";

fn default_base_url() -> String {
    "https://www.cbr.ru/vfs/credit/forms".to_owned()
}

fn default_archive_ext() -> String {
    "rar".to_owned()
}

fn default_encoding() -> String {
    "cp866".to_owned()
}

#[derive(Deserialize, Debug, Clone)]
pub struct FormConfig {
    /// Short label used in filenames and logs, e.g. `f101`.
    pub name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_archive_ext")]
    pub archive_ext: String,
    /// Filename fragment that marks the payload table inside an archive.
    #[serde(default)]
    pub table_hint: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    pub code_policy: CodePolicy,
    pub roles: RoleSpec,
}

impl FormConfig {
    /// Archive URL for one report date, `<base>/<form>-<YYYYMMDD>.<ext>`.
    pub fn archive_url(&self, form_id: &str, date: NaiveDate) -> String {
        format!(
            "{}/{}-{}.{}",
            self.base_url.trim_end_matches('/'),
            form_id,
            date.format("%Y%m%d"),
            self.archive_ext
        )
    }

    pub fn text_encoding(&self) -> TextEncoding {
        // load_forms rejects labels from_label does not know
        TextEncoding::from_label(&self.encoding).unwrap_or(TextEncoding::Cp866)
    }
}

/// Reads and validates the catalogue. Validation order is stable (sorted
/// by form code) so error messages do not jump around between runs.
pub fn load_forms(path: &Path) -> Result<HashMap<String, FormConfig>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let forms: HashMap<String, FormConfig> =
        toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
    let mut ids: Vec<&String> = forms.keys().collect();
    ids.sort();
    for id in ids {
        validate_form(id, &forms[id])?;
    }
    debug!(count = forms.len(), path = %path.display(), "form catalogue loaded");
    Ok(forms)
}

fn validate_form(id: &str, form: &FormConfig) -> Result<(), ConfigError> {
    let bad = |detail: &str| ConfigError::BadForm {
        form: id.to_owned(),
        detail: detail.to_owned(),
    };
    if form.name.trim().is_empty() {
        return Err(bad("empty name"));
    }
    if form.base_url.trim().is_empty() {
        return Err(bad("empty base_url"));
    }
    if form.archive_ext.trim().is_empty() {
        return Err(bad("empty archive_ext"));
    }
    if TextEncoding::from_label(&form.encoding).is_none() {
        return Err(ConfigError::UnknownEncoding {
            form: id.to_owned(),
            encoding: form.encoding.clone(),
        });
    }
    let roles: [(&'static str, &Vec<String>); 3] = [
        ("regn", &form.roles.regn),
        ("code", &form.roles.code),
        ("value", &form.roles.value),
    ];
    for (role, candidates) in roles.iter() {
        if candidates.is_empty() {
            return Err(ConfigError::EmptyRole {
                form: id.to_owned(),
                role,
            });
        }
    }
    Ok(())
}

/// Resolves the forms a run should cover. An empty request means every
/// configured form, in sorted code order.
pub fn select_forms<'a>(
    forms: &'a HashMap<String, FormConfig>,
    wanted: &[String],
) -> Result<Vec<(&'a str, &'a FormConfig)>, ConfigError> {
    let mut out = Vec::new();
    if wanted.is_empty() {
        let mut ids: Vec<&String> = forms.keys().collect();
        ids.sort();
        for id in ids {
            out.push((id.as_str(), &forms[id]));
        }
    } else {
        for w in wanted {
            let key = w.trim();
            match forms.get_key_value(key) {
                Some((id, cfg)) => out.push((id.as_str(), cfg)),
                None => return Err(ConfigError::UnknownForm(key.to_owned())),
            }
        }
    }
    Ok(out)
}
