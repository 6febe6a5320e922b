#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use report_pipeline::domain::{QueryId, RawResult, Row, Scalar};
use report_pipeline::error::ReportError;
use report_pipeline::redash::QueryClient;

pub fn write_template(path: &Path, sheets: &[&str]) {
    let file = File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let overrides = (1..=sheets.len())
        .map(|index| {
            format!(
                r#"<Override PartName="/xl/worksheets/sheet{index}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#
            )
        })
        .collect::<String>();
    let content_types = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
            "{}</Types>"
        ),
        overrides
    );
    zip.start_file("[Content_Types].xml", options).unwrap();
    zip.write_all(content_types.as_bytes()).unwrap();

    zip.start_file("_rels/.rels", options).unwrap();
    zip.write_all(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
            r#"</Relationships>"#
        )
        .as_bytes(),
    )
    .unwrap();

    let sheet_tags = sheets
        .iter()
        .enumerate()
        .map(|(index, name)| {
            format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                name.replace('&', "&amp;"),
                index + 1,
                index + 1
            )
        })
        .collect::<String>();
    let workbook = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" "#,
            r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
            "<sheets>{}</sheets></workbook>"
        ),
        sheet_tags
    );
    zip.start_file("xl/workbook.xml", options).unwrap();
    zip.write_all(workbook.as_bytes()).unwrap();

    let rels = (1..=sheets.len())
        .map(|index| {
            format!(
                r#"<Relationship Id="rId{index}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{index}.xml"/>"#
            )
        })
        .collect::<String>();
    zip.start_file("xl/_rels/workbook.xml.rels", options).unwrap();
    zip.write_all(
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">{rels}</Relationships>"#
        )
        .as_bytes(),
    )
    .unwrap();

    for (index, name) in sheets.iter().enumerate() {
        let sheet = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
                r#"<dimension ref="A1"/><sheetData>"#,
                r#"<row r="1" spans="1:1"><c r="A1" t="inlineStr"><is><t>{}</t></is></c></row>"#,
                r#"</sheetData></worksheet>"#
            ),
            name.replace('&', "&amp;")
        );
        zip.start_file(format!("xl/worksheets/sheet{}.xml", index + 1), options)
            .unwrap();
        zip.write_all(sheet.as_bytes()).unwrap();
    }

    zip.finish().unwrap();
}

pub fn raw(columns: &[&str], rows: &[&[Scalar]]) -> RawResult {
    let columns = columns.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    let rows = rows
        .iter()
        .map(|values| {
            columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect::<Row>()
        })
        .collect();
    RawResult::new(columns, rows)
}

pub fn s(value: &str) -> Scalar {
    Scalar::from(value)
}

pub fn n(value: f64) -> Scalar {
    Scalar::from(value)
}

#[derive(Clone)]
pub enum MockResponse {
    Rows(RawResult),
    Status(u16, String),
}

#[derive(Default)]
pub struct MockClient {
    responses: HashMap<String, MockResponse>,
    calls: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl MockClient {
    pub fn with(mut self, query_id: u64, response: MockResponse) -> Self {
        self.responses.insert(query_id.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl QueryClient for MockClient {
    fn fetch(
        &self,
        query_id: &QueryId,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RawResult, ReportError> {
        self.calls
            .lock()
            .unwrap()
            .push((query_id.to_string(), parameters.clone()));
        match self.responses.get(query_id.as_str()) {
            Some(MockResponse::Rows(raw)) => Ok(raw.clone()),
            Some(MockResponse::Status(status, message)) => Err(ReportError::QueryStatus {
                status: *status,
                message: message.clone(),
            }),
            None => Err(ReportError::QueryHttp(format!(
                "no mock response for query {query_id}"
            ))),
        }
    }
}

/// Responses for the four press report queries.
pub fn press_client() -> MockClient {
    MockClient::default()
        .with(
            20491,
            MockResponse::Rows(raw(
                &["month", "service", "signups"],
                &[
                    &[s("2023-08"), s("Netflix"), n(1200.0)],
                    &[s("2023-07"), s("Max"), n(800.5)],
                    &[s("2023-07"), s("Netflix"), n(1100.0)],
                ],
            )),
        )
        .with(
            20492,
            MockResponse::Rows(raw(
                &["month", "service", "gross_adds"],
                &[&[s("2023-08"), s("Hulu"), n(42.0)]],
            )),
        )
        .with(
            20494,
            MockResponse::Rows(raw(
                &["month", "weighted_churn"],
                &[&[s("2023-07"), n(0.0512)], &[s("2023-08"), n(0.0498)]],
            )),
        )
        .with(
            20493,
            MockResponse::Rows(raw(
                &["month", "service", "churn"],
                &[
                    &[s("2023-07"), s("Max"), n(0.061)],
                    &[s("2023-08"), s("Max"), n(0.058)],
                ],
            )),
        )
}
