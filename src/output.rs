use std::io::{self, Write};

use serde::Serialize;

use crate::domain::Table;
use crate::registry::QueryRegistry;
use crate::report::{ProgressEvent, ProgressSink, ReportOutcome};

const PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcome(outcome: &ReportOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_registry(registry: &QueryRegistry) -> io::Result<()> {
        Self::print_json(registry)
    }

    pub fn print_sheets(sheets: &[&str]) -> io::Result<()> {
        Self::print_json(&sheets)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_outcome(outcome: &ReportOutcome) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        Self::write_outcome(&mut stdout, outcome)
    }

    pub fn write_outcome<W: Write>(out: &mut W, outcome: &ReportOutcome) -> io::Result<()> {
        if !outcome.success {
            writeln!(
                out,
                "Report failed [{}]",
                outcome
                    .error_kind
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )?;
            if let Some(detail) = &outcome.error_detail {
                writeln!(out, "  {detail}")?;
            }
            return Ok(());
        }

        writeln!(out, "Report date: {}", outcome.report_date)?;
        for (group, rows) in outcome.group_row_counts() {
            writeln!(out, "  {group}: {rows} rows")?;
        }
        if let Some((group, table)) = outcome.first_preview() {
            writeln!(out, "\nPreview ({group}):")?;
            write_table(out, table, PREVIEW_ROWS)?;
        }
        if let Some(path) = &outcome.artifact_path {
            writeln!(out, "\nArtifact: {}", path.display())?;
        }
        Ok(())
    }

    pub fn print_registry(registry: &QueryRegistry) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for spec in registry {
            writeln!(
                stdout,
                "{:<16} {:<12} query={:<8} {}!{}{} pivot={} row_labels={}",
                spec.name,
                spec.group,
                spec.query_id,
                spec.destination_sheet,
                spec.destination_cell,
                spec.date_cell
                    .map(|cell| format!(" date={cell}"))
                    .unwrap_or_default(),
                spec.pivot,
                spec.include_row_labels
            )?;
        }
        Ok(())
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("[{:>6} ms] {}", elapsed.as_millis(), event.message),
            None => eprintln!("{}", event.message),
        }
    }
}

fn write_table<W: Write>(out: &mut W, table: &Table, limit: usize) -> io::Result<()> {
    let rendered = table
        .rows
        .iter()
        .take(limit)
        .map(|row| row.iter().map(|value| value.to_string()).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let widths = table
        .headers
        .iter()
        .enumerate()
        .map(|(index, header)| {
            rendered
                .iter()
                .filter_map(|row| row.get(index).map(|cell| cell.len()))
                .chain(std::iter::once(header.len()))
                .max()
                .unwrap_or(0)
        })
        .collect::<Vec<_>>();

    let header = table
        .headers
        .iter()
        .zip(&widths)
        .map(|(header, width)| format!("{header:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    writeln!(out, "  {}", header.trim_end())?;
    for row in &rendered {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(out, "  {}", line.trim_end())?;
    }
    if table.len() > limit {
        writeln!(out, "  ... {} more rows", table.len() - limit)?;
    }
    Ok(())
}
