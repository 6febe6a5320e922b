use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::domain::{QuerySpec, Scalar, Table};
use crate::error::ReportError;
use crate::workbook::Workbook;

#[derive(Debug, Clone)]
pub struct Injector {
    output_dir: PathBuf,
    label: String,
    strict_sheets: bool,
}

impl Injector {
    pub fn new(output_dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            label: label.into(),
            strict_sheets: false,
        }
    }

    /// Fail with `SheetMissing` instead of skipping specs whose sheet is absent.
    pub fn strict_sheets(mut self, strict: bool) -> Self {
        self.strict_sheets = strict;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn artifact_path(&self, report_date: NaiveDate) -> PathBuf {
        self.output_dir.join(format!(
            "{}_{}.xlsx",
            self.label,
            report_date.format("%Y%m%d")
        ))
    }

    pub fn inject(
        &self,
        mut workbook: Workbook,
        tables: &BTreeMap<String, Table>,
        specs: &[QuerySpec],
        report_date: NaiveDate,
    ) -> Result<PathBuf, ReportError> {
        let date_text = report_date.format("%Y-%m-%d").to_string();

        for spec in specs {
            let table = tables.get(&spec.name).filter(|table| !table.is_empty());
            if table.is_none() && spec.date_cell.is_none() {
                continue;
            }
            if !workbook.has_sheet(&spec.destination_sheet) {
                if self.strict_sheets {
                    return Err(ReportError::SheetMissing(spec.destination_sheet.clone()));
                }
                warn!(
                    query = %spec.name,
                    sheet = %spec.destination_sheet,
                    "destination sheet not in template, skipping"
                );
                continue;
            }

            if let Some(table) = table {
                write_table(&mut workbook, spec, table)?;
                debug!(
                    query = %spec.name,
                    sheet = %spec.destination_sheet,
                    cell = %spec.destination_cell,
                    rows = table.len(),
                    "table written"
                );
            }
            if let Some(date_cell) = spec.date_cell {
                workbook.write(
                    &spec.destination_sheet,
                    date_cell,
                    Scalar::Text(date_text.clone()),
                )?;
            }
        }

        let artifact = self.artifact_path(report_date);
        workbook.save_as(&artifact)?;
        info!(path = %artifact.display(), "report artifact written");
        Ok(artifact)
    }
}

fn write_table(workbook: &mut Workbook, spec: &QuerySpec, table: &Table) -> Result<(), ReportError> {
    for (row_offset, row) in table.rows.iter().enumerate() {
        for (column_offset, value) in row.iter().enumerate() {
            let cell = spec
                .destination_cell
                .offset(row_offset as u32, column_offset as u32)
                .map_err(|_| {
                    ReportError::Injection(format!(
                        "{} does not fit on sheet `{}` from {}: {} rows x {} columns",
                        spec.name,
                        spec.destination_sheet,
                        spec.destination_cell,
                        table.len(),
                        row.len()
                    ))
                })?;
            workbook.write(&spec.destination_sheet, cell, value.clone())?;
        }
    }
    Ok(())
}
