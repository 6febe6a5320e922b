use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::DEFAULT_TTL;
use crate::domain::{CellRef, QueryId, QuerySpec};
use crate::error::ReportError;
use crate::redash::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::registry::QueryRegistry;
use crate::transform::ShapeFallback;

pub const CONFIG_FILE: &str = "report-pipeline.json";
pub const DEFAULT_LABEL: &str = "Antenna for Press_PremiumSVOD";
pub const DEFAULT_TEMPLATE: &str = "templates/Antenna for Press_PremiumSVOD_ yyyymmdd.xlsx";
pub const DEFAULT_OUTPUT_DIR: &str = "Output";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub report: Option<ReportEntry>,
    #[serde(default)]
    pub queries: Vec<QueryEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReportEntry {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub template: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub strict_sheets: Option<bool>,
    #[serde(default)]
    pub shape_fallback: Option<ShapeFallback>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum QueryIdEntry {
    Numeric(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryEntry {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub query_id: QueryIdEntry,
    pub sheet: String,
    pub cell: String,
    #[serde(default)]
    pub date_cell: Option<String>,
    #[serde(default)]
    pub pivot: bool,
    #[serde(default)]
    pub include_row_labels: Option<bool>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub schema_version: u32,
    pub label: String,
    pub template: PathBuf,
    pub output_dir: PathBuf,
    pub base_url: String,
    pub cache_ttl: Duration,
    pub timeout: Duration,
    pub strict_sheets: bool,
    pub shape_fallback: ShapeFallback,
    pub registry: QueryRegistry,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads an explicit config file, or `report-pipeline.json` from the current
    /// directory, or the per-user config file. Without any of them the built-in
    /// press report is used.
    pub fn resolve(path: Option<&str>) -> Result<ReportConfig, ReportError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let config = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| ReportError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| ReportError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("report-pipeline").join("config.json"))
            .filter(|path| path.is_file())
    }

    pub fn resolve_config(config: Config) -> Result<ReportConfig, ReportError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let report = config.report.unwrap_or_default();
        let entries = if config.queries.is_empty() {
            default_queries()
        } else {
            config.queries
        };

        let specs = entries
            .into_iter()
            .map(resolve_query)
            .collect::<Result<Vec<_>, ReportError>>()?;

        Ok(ReportConfig {
            schema_version,
            label: report.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            template: report
                .template
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE)),
            output_dir: report
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            base_url: report
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            cache_ttl: report
                .cache_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TTL),
            timeout: report
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT),
            strict_sheets: report.strict_sheets.unwrap_or(false),
            shape_fallback: report.shape_fallback.unwrap_or_default(),
            registry: QueryRegistry::new(specs),
        })
    }
}

fn resolve_query(entry: QueryEntry) -> Result<QuerySpec, ReportError> {
    let query_id = match &entry.query_id {
        QueryIdEntry::Numeric(id) => QueryId::from(*id),
        QueryIdEntry::Text(id) => id.parse()?,
    };
    let credential = match (&entry.api_key, &entry.api_key_env) {
        (Some(key), _) => key.clone(),
        (None, Some(var)) => std::env::var(var).unwrap_or_else(|_| {
            warn!(query = %entry.name, env = %var, "credential variable is not set");
            String::new()
        }),
        (None, None) => String::new(),
    };
    let group = entry
        .group
        .clone()
        .unwrap_or_else(|| default_group(&entry.name));

    Ok(QuerySpec {
        group,
        query_id,
        destination_cell: entry.cell.parse()?,
        date_cell: entry
            .date_cell
            .as_deref()
            .map(str::parse::<CellRef>)
            .transpose()?,
        pivot: entry.pivot,
        include_row_labels: entry.include_row_labels.unwrap_or(true),
        credential,
        fixed_parameters: entry.params,
        destination_sheet: entry.sheet,
        name: entry.name,
    })
}

pub fn default_group(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn press_params() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("p_A+ release date".to_string(), "230913".to_string());
    params.insert(
        "p_Latest Monthly Data".to_string(),
        "2023-08-01".to_string(),
    );
    params
}

fn press_query(
    name: &str,
    group: &str,
    query_id: u64,
    sheet: &str,
    cell: &str,
    date_cell: Option<&str>,
    pivot: bool,
) -> QueryEntry {
    QueryEntry {
        name: name.to_string(),
        group: Some(group.to_string()),
        query_id: QueryIdEntry::Numeric(query_id),
        sheet: sheet.to_string(),
        cell: cell.to_string(),
        date_cell: date_cell.map(str::to_string),
        pivot,
        include_row_labels: None,
        api_key: None,
        api_key_env: Some(format!("REDASH_KEY_{query_id}")),
        params: press_params(),
    }
}

/// The Press Premium SVOD update: sign-ups, gross adds and both churn variants.
pub fn default_queries() -> Vec<QueryEntry> {
    let mut churn_monthly = press_query(
        "Churn Monthly",
        "churn",
        20493,
        "Churn",
        "C10",
        Some("B6"),
        true,
    );
    churn_monthly.include_row_labels = Some(false);

    vec![
        press_query("Sign-ups", "signups", 20491, "Sign-ups", "A9", Some("B6"), true),
        press_query(
            "Gross Adds",
            "gross_adds",
            20492,
            "Gross Adds",
            "A10",
            Some("B7"),
            true,
        ),
        press_query("Churn Weighted", "churn", 20494, "Churn", "A10", None, false),
        churn_monthly,
    ]
}
