use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cache::ResultCache;
use crate::config::ReportConfig;
use crate::domain::{QuerySpec, Table};
use crate::error::{ErrorKind, ReportError};
use crate::inject::Injector;
use crate::redash::{CachedFetcher, QueryClient};
use crate::registry::QueryRegistry;
use crate::transform::{ShapeFallback, transform_with};
use crate::workbook::Workbook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Idle,
    FetchingAll,
    TransformingAll,
    Injecting,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentSink;

impl ProgressSink for SilentSink {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub success: bool,
    pub stage: Stage,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub failed_query: Option<String>,
    /// Report groups in registry order; `previews` and `row_counts` are keyed by them.
    pub groups: Vec<String>,
    pub generated_tables: BTreeMap<String, Table>,
    pub previews: BTreeMap<String, Table>,
    pub row_counts: BTreeMap<String, usize>,
    pub artifact_path: Option<PathBuf>,
    pub report_date: String,
}

impl ReportOutcome {
    fn started(report_date: NaiveDate, registry: &QueryRegistry) -> Self {
        Self {
            success: false,
            stage: Stage::Idle,
            error_kind: None,
            error_detail: None,
            failed_query: None,
            groups: registry.groups().into_iter().map(str::to_string).collect(),
            generated_tables: BTreeMap::new(),
            previews: BTreeMap::new(),
            row_counts: registry
                .groups()
                .into_iter()
                .map(|group| (group.to_string(), 0))
                .collect(),
            artifact_path: None,
            report_date: report_date.format("%Y-%m-%d").to_string(),
        }
    }

    fn record(&mut self, spec: &QuerySpec, table: Table) {
        *self.row_counts.entry(spec.group.clone()).or_insert(0) += table.len();
        if !table.is_empty() {
            self.previews
                .entry(spec.group.clone())
                .or_insert_with(|| table.clone());
        }
        self.generated_tables.insert(spec.name.clone(), table);
    }

    fn fail(mut self, query: Option<&str>, err: ReportError) -> Self {
        self.success = false;
        self.stage = Stage::Failed;
        self.error_kind = Some(err.kind());
        self.error_detail = Some(match query {
            Some(query) => format!("error processing {query}: {err}"),
            None => err.to_string(),
        });
        self.failed_query = query.map(str::to_string);
        self.artifact_path = None;
        self
    }

    fn succeed(mut self, artifact: PathBuf) -> Self {
        self.success = true;
        self.stage = Stage::Done;
        self.artifact_path = Some(artifact);
        self
    }

    /// Row counts in registry group order.
    pub fn group_row_counts(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.groups.iter().map(|group| {
            (
                group.as_str(),
                self.row_counts.get(group).copied().unwrap_or(0),
            )
        })
    }

    /// Preview of the first group, in registry order, that produced rows.
    pub fn first_preview(&self) -> Option<(&str, &Table)> {
        self.groups
            .iter()
            .find_map(|group| self.previews.get(group).map(|table| (group.as_str(), table)))
    }

    pub fn total_rows(&self) -> usize {
        self.row_counts.values().sum()
    }
}

/// Runs every registry query through fetch and transform, then fills the
/// template once. Any failure before injection aborts without an artifact.
pub struct ReportPipeline<C: QueryClient> {
    registry: QueryRegistry,
    fetcher: CachedFetcher<C>,
    template: PathBuf,
    injector: Injector,
    shape_fallback: ShapeFallback,
}

impl<C: QueryClient> ReportPipeline<C> {
    pub fn new(
        registry: QueryRegistry,
        fetcher: CachedFetcher<C>,
        template: impl Into<PathBuf>,
        injector: Injector,
    ) -> Self {
        Self {
            registry,
            fetcher,
            template: template.into(),
            injector,
            shape_fallback: ShapeFallback::Fail,
        }
    }

    pub fn from_config(config: &ReportConfig, client: C, cache: Arc<dyn ResultCache>) -> Self {
        let fetcher = CachedFetcher::with_ttl(client, cache, config.cache_ttl);
        let injector = Injector::new(config.output_dir.clone(), config.label.clone())
            .strict_sheets(config.strict_sheets);
        Self::new(
            config.registry.clone(),
            fetcher,
            config.template.clone(),
            injector,
        )
        .with_shape_fallback(config.shape_fallback)
    }

    pub fn with_shape_fallback(mut self, fallback: ShapeFallback) -> Self {
        self.shape_fallback = fallback;
        self
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn fetcher(&self) -> &CachedFetcher<C> {
        &self.fetcher
    }

    /// The pipeline entry point: today's report, no progress reporting.
    pub fn generate(&self) -> ReportOutcome {
        self.generate_with(Local::now().date_naive(), &SilentSink)
    }

    pub fn generate_with(&self, report_date: NaiveDate, sink: &dyn ProgressSink) -> ReportOutcome {
        let started = Instant::now();
        let mut outcome = ReportOutcome::started(report_date, &self.registry);

        for spec in &self.registry {
            outcome.stage = Stage::FetchingAll;
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; query {} ({})", spec.name, spec.query_id),
                elapsed: Some(started.elapsed()),
            });
            let raw = match self
                .fetcher
                .fetch(&spec.query_id, &spec.request_parameters())
            {
                Ok(raw) => raw,
                Err(err) => return self.abort(outcome, spec, err, sink),
            };

            outcome.stage = Stage::TransformingAll;
            let table = match transform_with(
                raw,
                spec.pivot,
                spec.include_row_labels,
                self.shape_fallback,
            ) {
                Ok(table) => table,
                Err(err) => return self.abort(outcome, spec, err, sink),
            };
            debug!(query = %spec.name, rows = table.len(), columns = table.width(), "query transformed");
            outcome.record(spec, table);
        }

        outcome.stage = Stage::Injecting;
        sink.event(ProgressEvent {
            message: format!("phase=Inject; template {}", self.template.display()),
            elapsed: Some(started.elapsed()),
        });
        let injected = Workbook::open(&self.template).and_then(|workbook| {
            self.injector.inject(
                workbook,
                &outcome.generated_tables,
                self.registry.specs(),
                report_date,
            )
        });

        match injected {
            Ok(artifact) => {
                info!(
                    artifact = %artifact.display(),
                    rows = outcome.total_rows(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "report generated"
                );
                sink.event(ProgressEvent {
                    message: format!("phase=Done; {}", artifact.display()),
                    elapsed: Some(started.elapsed()),
                });
                outcome.succeed(artifact)
            }
            Err(err) => {
                error!(error = %err, "report injection failed");
                sink.event(ProgressEvent {
                    message: format!("phase=Failed; {err}"),
                    elapsed: Some(started.elapsed()),
                });
                outcome.fail(None, err)
            }
        }
    }

    fn abort(
        &self,
        outcome: ReportOutcome,
        spec: &QuerySpec,
        err: ReportError,
        sink: &dyn ProgressSink,
    ) -> ReportOutcome {
        error!(query = %spec.name, query_id = %spec.query_id, error = %err, "report aborted");
        sink.event(ProgressEvent {
            message: format!("phase=Failed; {}: {err}", spec.name),
            elapsed: None,
        });
        outcome.fail(Some(&spec.name), err)
    }
}
