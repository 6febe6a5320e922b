use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{RawResult, Scalar, Table};
use crate::error::ReportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeFallback {
    #[default]
    Fail,
    Passthrough,
}

/// Reshapes a fetched result into the grid written into the template.
///
/// A pivot uses the first declared column as row index, the second as column
/// headers and the third as cell values. Only observed (index, header) pairs
/// are filled; the rest stay null. Duplicate pairs resolve to the later row.
pub fn transform(
    raw: RawResult,
    pivot: bool,
    include_row_labels: bool,
) -> Result<Table, ReportError> {
    if raw.rows.is_empty() {
        return Ok(Table::empty());
    }
    if !pivot {
        return Ok(passthrough(raw));
    }
    if raw.columns.len() < 3 {
        return Err(ReportError::Shape {
            columns: raw.columns.len(),
            raw: Box::new(passthrough(raw)),
        });
    }
    Ok(pivot_table(&raw, include_row_labels))
}

/// Same as [`transform`], but applies `fallback` to shape errors.
pub fn transform_with(
    raw: RawResult,
    pivot: bool,
    include_row_labels: bool,
    fallback: ShapeFallback,
) -> Result<Table, ReportError> {
    match transform(raw, pivot, include_row_labels) {
        Err(ReportError::Shape { raw, .. }) if fallback == ShapeFallback::Passthrough => Ok(*raw),
        other => other,
    }
}

pub fn passthrough(raw: RawResult) -> Table {
    let RawResult { columns, rows } = raw;
    let rows = rows
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|column| record.remove(column).unwrap_or(Scalar::Null))
                .collect()
        })
        .collect();
    Table {
        headers: columns,
        rows,
    }
}

fn pivot_table(raw: &RawResult, include_row_labels: bool) -> Table {
    let index_column = &raw.columns[0];
    let header_column = &raw.columns[1];
    let value_column = &raw.columns[2];

    let mut grid: BTreeMap<Scalar, BTreeMap<Scalar, Scalar>> = BTreeMap::new();
    let mut header_values: BTreeSet<Scalar> = BTreeSet::new();
    for record in &raw.rows {
        let index = record.get(index_column).cloned().unwrap_or(Scalar::Null);
        let header = record.get(header_column).cloned().unwrap_or(Scalar::Null);
        let value = record.get(value_column).cloned().unwrap_or(Scalar::Null);
        header_values.insert(header.clone());
        grid.entry(index).or_default().insert(header, value);
    }

    let mut headers = Vec::with_capacity(header_values.len() + 1);
    if include_row_labels {
        headers.push(index_column.clone());
    }
    headers.extend(header_values.iter().map(|value| value.to_string()));

    let rows = grid
        .into_iter()
        .map(|(index, mut cells)| {
            let mut row = Vec::with_capacity(headers.len());
            if include_row_labels {
                row.push(index);
            }
            row.extend(
                header_values
                    .iter()
                    .map(|header| cells.remove(header).unwrap_or(Scalar::Null)),
            );
            row
        })
        .collect();

    Table { headers, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Row;
    use assert_matches::assert_matches;

    fn record(month: &str, service: &str, value: f64) -> Row {
        let mut row = Row::new();
        row.insert("month".to_string(), Scalar::from(month));
        row.insert("service".to_string(), Scalar::from(service));
        row.insert("value".to_string(), Scalar::from(value));
        row
    }

    fn columns() -> Vec<String> {
        vec!["month".to_string(), "service".to_string(), "value".to_string()]
    }

    #[test]
    fn pivot_sorts_rows_and_headers() {
        let raw = RawResult::new(
            columns(),
            vec![
                record("2023-01", "B", 10.0),
                record("2023-01", "A", 5.0),
                record("2023-02", "A", 7.0),
            ],
        );
        let table = transform(raw, true, true).unwrap();
        assert_eq!(table.headers, vec!["month", "A", "B"]);
        assert_eq!(
            table.rows,
            vec![
                vec![Scalar::from("2023-01"), Scalar::from(5.0), Scalar::from(10.0)],
                vec![Scalar::from("2023-02"), Scalar::from(7.0), Scalar::Null],
            ]
        );
    }

    #[test]
    fn pivot_without_row_labels_drops_index() {
        let raw = RawResult::new(
            columns(),
            vec![record("2023-02", "A", 7.0), record("2023-01", "A", 5.0)],
        );
        let table = transform(raw, true, false).unwrap();
        assert_eq!(table.headers, vec!["A"]);
        assert_eq!(
            table.rows,
            vec![vec![Scalar::from(5.0)], vec![Scalar::from(7.0)]]
        );
    }

    #[test]
    fn numeric_index_sorts_numerically() {
        let mut rows = Vec::new();
        for (index, value) in [(10.0, 1.0), (9.0, 2.0), (100.0, 3.0)] {
            let mut row = Row::new();
            row.insert("month".to_string(), Scalar::from(index));
            row.insert("service".to_string(), Scalar::from("A"));
            row.insert("value".to_string(), Scalar::from(value));
            rows.push(row);
        }
        let table = transform(RawResult::new(columns(), rows), true, true).unwrap();
        let labels = table.rows.iter().map(|row| row[0].clone()).collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![Scalar::from(9.0), Scalar::from(10.0), Scalar::from(100.0)]
        );
    }

    #[test]
    fn duplicate_pairs_keep_the_later_row() {
        let raw = RawResult::new(
            columns(),
            vec![record("2023-01", "A", 1.0), record("2023-01", "A", 2.0)],
        );
        let table = transform(raw, true, true).unwrap();
        assert_eq!(table.rows, vec![vec![Scalar::from("2023-01"), Scalar::from(2.0)]]);
    }

    #[test]
    fn passthrough_uses_declared_order_and_fills_missing() {
        let mut row = Row::new();
        row.insert("value".to_string(), Scalar::from(0.0317));
        row.insert("month".to_string(), Scalar::from("2023-08"));
        let raw = RawResult::new(columns(), vec![row]);
        let table = transform(raw, false, true).unwrap();
        assert_eq!(table.headers, columns());
        assert_eq!(
            table.rows,
            vec![vec![Scalar::from("2023-08"), Scalar::Null, Scalar::from(0.0317)]]
        );
    }

    #[test]
    fn empty_result_is_an_empty_table() {
        let table = transform(RawResult::new(columns(), Vec::new()), true, true).unwrap();
        assert!(table.is_empty());
        let table = transform(RawResult::default(), true, true).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn pivot_with_two_columns_is_a_shape_error() {
        let mut row = Row::new();
        row.insert("month".to_string(), Scalar::from("2023-01"));
        row.insert("value".to_string(), Scalar::from(1.0));
        let raw = RawResult::new(vec!["month".to_string(), "value".to_string()], vec![row]);

        let err = transform(raw.clone(), true, true).unwrap_err();
        assert_matches!(err, ReportError::Shape { columns: 2, ref raw } if raw.len() == 1);

        let table = transform_with(raw, true, true, ShapeFallback::Passthrough).unwrap();
        assert_eq!(table.headers, vec!["month", "value"]);
    }

    #[test]
    fn unpivot_recovers_every_observed_triple() {
        let source = vec![
            record("2023-03", "C", 3.5),
            record("2023-01", "B", 10.0),
            record("2023-01", "A", 5.0),
            record("2023-02", "C", 0.25),
        ];
        let raw = RawResult::new(columns(), source.clone());
        let table = transform(raw, true, true).unwrap();

        let mut recovered = BTreeSet::new();
        for row in &table.rows {
            for (offset, header) in table.headers.iter().enumerate().skip(1) {
                if !row[offset].is_null() {
                    recovered.insert((row[0].to_string(), header.clone(), row[offset].clone()));
                }
            }
        }
        let expected = source
            .iter()
            .map(|r| (r["month"].to_string(), r["service"].to_string(), r["value"].clone()))
            .collect::<BTreeSet<_>>();
        assert_eq!(recovered, expected);
    }
}
