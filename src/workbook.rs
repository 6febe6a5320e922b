use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, NoExpand, Regex};
use tempfile::Builder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::domain::{CellRef, Scalar, column_letters};
use crate::error::ReportError;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

static SHEET_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<sheet\b([^>]*?)/?>").unwrap());
static RELATIONSHIP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Relationship\b([^>]*?)/?>").unwrap());
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static SHEET_DATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<sheetData\b[^>]*?(?:/>|>(.*?)</sheetData>)").unwrap()
});
static ROW_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<row\b([^>]*?)(?:/>|>(.*?)</row>)").unwrap());
static CELL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").unwrap());
static DIMENSION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<dimension\b[^>]*/>").unwrap());
static SPANS_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\sspans\s*=\s*"[^"]*""#).unwrap());
static SHARED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<si>(.*?)</si>").unwrap());
static TEXT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<t(?:\s[^>]*)?>(.*?)</t>").unwrap());
static VALUE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<v>(.*?)</v>").unwrap());
static XSTRING_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").unwrap());
static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(amp|lt|gt|quot|apos|#x[0-9A-Fa-f]+|#[0-9]+);").unwrap()
});

#[derive(Debug, Clone)]
struct SheetPart {
    name: String,
    part: String,
}

/// Handle on an xlsx template.
///
/// Writes are buffered per worksheet and only applied by [`Workbook::save_as`],
/// which streams the package into a new file. The template itself is never
/// modified.
#[derive(Debug)]
pub struct Workbook {
    path: PathBuf,
    sheets: Vec<SheetPart>,
    pending: BTreeMap<String, BTreeMap<CellRef, Scalar>>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, ReportError> {
        if !path.is_file() {
            return Err(ReportError::TemplateMissing(path.to_path_buf()));
        }
        let mut archive = open_archive(path)?;
        let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?;
        let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?;

        let targets = RELATIONSHIP_TAG
            .captures_iter(&rels_xml)
            .filter_map(|caps| {
                let attrs = &caps[1];
                Some((attr_value(attrs, "Id")?, attr_value(attrs, "Target")?))
            })
            .collect::<HashMap<_, _>>();

        let mut sheets = Vec::new();
        for caps in SHEET_TAG.captures_iter(&workbook_xml) {
            let attrs = &caps[1];
            let name = attr_value(attrs, "name")
                .map(|name| unescape_xml(&name))
                .ok_or_else(|| ReportError::TemplateFormat("sheet without name".to_string()))?;
            let target = prefixed_attr_value(attrs, "id")
                .and_then(|rel_id| targets.get(&rel_id))
                .ok_or_else(|| {
                    ReportError::TemplateFormat(format!("sheet `{name}` has no relationship"))
                })?;
            sheets.push(SheetPart {
                name,
                part: resolve_target(target),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            sheets,
            pending: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|sheet| sheet.name.as_str()).collect()
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheet(name).is_some()
    }

    fn sheet(&self, name: &str) -> Option<&SheetPart> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    pub fn write(&mut self, sheet: &str, cell: CellRef, value: Scalar) -> Result<(), ReportError> {
        let part = self
            .sheet(sheet)
            .map(|sheet| sheet.part.clone())
            .ok_or_else(|| ReportError::SheetMissing(sheet.to_string()))?;
        self.pending.entry(part).or_default().insert(cell, value);
        Ok(())
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.values().map(|cells| cells.len()).sum()
    }

    /// Reads a cell as stored in the file on disk; pending writes are not visible.
    pub fn read(&self, sheet: &str, cell: CellRef) -> Result<Scalar, ReportError> {
        let part = self
            .sheet(sheet)
            .ok_or_else(|| ReportError::SheetMissing(sheet.to_string()))?;
        let mut archive = open_archive(&self.path)?;
        let xml = read_part(&mut archive, &part.part)?;
        let shared = match read_part(&mut archive, SHARED_STRINGS_PART) {
            Ok(content) => parse_shared_strings(&content),
            Err(_) => Vec::new(),
        };
        let grid = SheetGrid::from_worksheet(&xml)?;
        Ok(grid
            .cell(cell)
            .map(|xml| xml.value(&shared))
            .unwrap_or(Scalar::Null))
    }

    pub fn save_as(&self, destination: &Path) -> Result<(), ReportError> {
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| ReportError::Filesystem(err.to_string()))?;

        let mut archive = open_archive(&self.path)?;
        let mut temp = Builder::new()
            .prefix(".report-pipeline")
            .suffix(".xlsx")
            .tempfile_in(parent)
            .map_err(|err| ReportError::Filesystem(err.to_string()))?;

        {
            let mut writer = ZipWriter::new(temp.as_file_mut());
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            for index in 0..archive.len() {
                let name = archive
                    .by_index_raw(index)
                    .map_err(|err| ReportError::TemplateFormat(err.to_string()))?
                    .name()
                    .to_string();
                match self.pending.get(&name) {
                    Some(edits) => {
                        let mut xml = String::new();
                        archive
                            .by_index(index)
                            .map_err(|err| ReportError::TemplateFormat(err.to_string()))?
                            .read_to_string(&mut xml)
                            .map_err(|err| ReportError::TemplateFormat(format!("{name}: {err}")))?;
                        let patched = patch_worksheet(&xml, edits)?;
                        writer
                            .start_file(name.as_str(), options)
                            .map_err(|err| ReportError::Injection(err.to_string()))?;
                        writer
                            .write_all(patched.as_bytes())
                            .map_err(|err| ReportError::Injection(err.to_string()))?;
                    }
                    None => {
                        let entry = archive
                            .by_index_raw(index)
                            .map_err(|err| ReportError::TemplateFormat(err.to_string()))?;
                        writer
                            .raw_copy_file(entry)
                            .map_err(|err| ReportError::Injection(err.to_string()))?;
                    }
                }
            }
            writer
                .finish()
                .map_err(|err| ReportError::Injection(err.to_string()))?;
        }

        temp.persist(destination)
            .map_err(|err| ReportError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, ReportError> {
    let file = File::open(path)
        .map_err(|err| ReportError::TemplateFormat(format!("open {}: {err}", path.display())))?;
    ZipArchive::new(file).map_err(|err| ReportError::TemplateFormat(err.to_string()))
}

fn read_part(archive: &mut ZipArchive<File>, name: &str) -> Result<String, ReportError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|err| ReportError::TemplateFormat(format!("{name}: {err}")))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|err| ReportError::TemplateFormat(format!("{name}: {err}")))?;
    Ok(content)
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    }
}

fn attributes(attrs: &str) -> impl Iterator<Item = (String, String)> + '_ {
    ATTRIBUTE.captures_iter(attrs).map(|caps| {
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|value| value.as_str().to_string())
            .unwrap_or_default();
        (caps[1].to_string(), value)
    })
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    attributes(attrs).find(|(key, _)| key == name).map(|(_, value)| value)
}

fn prefixed_attr_value(attrs: &str, local: &str) -> Option<String> {
    attributes(attrs)
        .find(|(key, _)| {
            key.split_once(':')
                .map(|(_, name)| name == local)
                .unwrap_or(false)
        })
        .map(|(_, value)| value)
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Encodes characters XML 1.0 cannot carry (C0 controls other than tab, LF
/// and CR, plus U+FFFE and U+FFFF) with the spreadsheet `_xHHHH_` escape. A
/// literal `_xHHHH_` in the input has its underscore escaped as `_x005F_` so
/// it reads back unchanged.
pub fn encode_cell_text(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for (index, ch) in text.char_indices() {
        match ch {
            '_' if XSTRING_ESCAPE
                .find(&text[index..])
                .is_some_and(|found| found.start() == 0) =>
            {
                encoded.push_str("_x005F_")
            }
            '\t' | '\n' | '\r' => encoded.push(ch),
            '\u{0}'..='\u{1F}' | '\u{FFFE}' | '\u{FFFF}' => {
                encoded.push_str(&format!("_x{:04X}_", u32::from(ch)))
            }
            other => encoded.push(other),
        }
    }
    encoded
}

/// Inverse of [`encode_cell_text`].
pub fn decode_cell_text(text: &str) -> String {
    XSTRING_ESCAPE
        .replace_all(text, |caps: &Captures| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(|ch| ch.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn unescape_xml(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures| match &caps[1] {
            "amp" => "&".to_string(),
            "lt" => "<".to_string(),
            "gt" => ">".to_string(),
            "quot" => "\"".to_string(),
            "apos" => "'".to_string(),
            numeric => {
                let code = match numeric.strip_prefix("#x") {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => numeric.trim_start_matches('#').parse::<u32>().ok(),
                };
                code.and_then(char::from_u32)
                    .map(|ch| ch.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            }
        })
        .into_owned()
}

fn parse_shared_strings(xml: &str) -> Vec<String> {
    SHARED_ITEM
        .captures_iter(xml)
        .map(|item| {
            TEXT_RUN
                .captures_iter(&item[1])
                .map(|run| decode_cell_text(&unescape_xml(&run[1])))
                .collect::<String>()
        })
        .collect()
}

#[derive(Debug, Clone)]
struct CellXml {
    attrs: String,
    body: Option<String>,
}

impl CellXml {
    fn render(cell: CellRef, style: Option<&str>, value: &Scalar) -> Self {
        let mut attrs = format!(" r=\"{cell}\"");
        if let Some(style) = style {
            attrs.push_str(&format!(" s=\"{style}\""));
        }
        let body = match value {
            Scalar::Null => None,
            Scalar::Bool(flag) => {
                attrs.push_str(" t=\"b\"");
                Some(format!("<v>{}</v>", u8::from(*flag)))
            }
            Scalar::Integer(integer) => Some(format!("<v>{integer}</v>")),
            Scalar::Number(number) if number.is_finite() => Some(format!("<v>{number}</v>")),
            Scalar::Number(_) => {
                attrs.push_str(" t=\"e\"");
                Some("<v>#NUM!</v>".to_string())
            }
            Scalar::Text(text) => {
                attrs.push_str(" t=\"inlineStr\"");
                Some(format!(
                    "<is><t xml:space=\"preserve\">{}</t></is>",
                    escape_xml(&encode_cell_text(text))
                ))
            }
        };
        Self { attrs, body }
    }

    fn value(&self, shared: &[String]) -> Scalar {
        let body = self.body.as_deref().unwrap_or("");
        let raw = VALUE_TAG.captures(body).map(|caps| unescape_xml(&caps[1]));
        match attr_value(&self.attrs, "t").as_deref() {
            Some("inlineStr") => Scalar::Text(
                TEXT_RUN
                    .captures_iter(body)
                    .map(|run| decode_cell_text(&unescape_xml(&run[1])))
                    .collect(),
            ),
            Some("s") => raw
                .and_then(|index| index.trim().parse::<usize>().ok())
                .and_then(|index| shared.get(index).cloned())
                .map(Scalar::Text)
                .unwrap_or(Scalar::Null),
            Some("b") => raw
                .map(|flag| Scalar::Bool(flag.trim() == "1"))
                .unwrap_or(Scalar::Null),
            Some("str") | Some("e") => raw.map(Scalar::Text).unwrap_or(Scalar::Null),
            _ => raw
                .and_then(|number| {
                    let number = number.trim();
                    number
                        .parse::<i64>()
                        .map(Scalar::Integer)
                        .ok()
                        .or_else(|| number.parse::<f64>().ok().map(Scalar::Number))
                })
                .unwrap_or(Scalar::Null),
        }
    }

    fn to_xml(&self) -> String {
        match &self.body {
            Some(body) => format!("<c{}>{}</c>", self.attrs, body),
            None => format!("<c{}/>", self.attrs),
        }
    }
}

#[derive(Debug, Clone)]
struct RowXml {
    attrs: String,
    cells: BTreeMap<u32, CellXml>,
    touched: bool,
}

impl RowXml {
    fn empty(row: u32) -> Self {
        Self {
            attrs: format!(" r=\"{row}\""),
            cells: BTreeMap::new(),
            touched: true,
        }
    }

    fn to_xml(&self) -> String {
        let attrs = if self.touched {
            SPANS_ATTR.replace_all(&self.attrs, "").into_owned()
        } else {
            self.attrs.clone()
        };
        if self.cells.is_empty() {
            return format!("<row{attrs}/>");
        }
        let cells = self.cells.values().map(CellXml::to_xml).collect::<String>();
        format!("<row{attrs}>{cells}</row>")
    }
}

/// In-memory view of a worksheet's `<sheetData>`. Cells and rows without an
/// explicit `r` attribute get one so positions survive re-serialisation.
#[derive(Debug, Default)]
struct SheetGrid {
    rows: BTreeMap<u32, RowXml>,
}

impl SheetGrid {
    fn from_worksheet(xml: &str) -> Result<Self, ReportError> {
        let caps = SHEET_DATA
            .captures(xml)
            .ok_or_else(|| ReportError::TemplateFormat("worksheet has no sheetData".to_string()))?;
        Self::parse(caps.get(1).map_or("", |inner| inner.as_str()))
    }

    fn parse(inner: &str) -> Result<Self, ReportError> {
        let mut rows = BTreeMap::new();
        let mut next_row = 1u32;
        for row_caps in ROW_TAG.captures_iter(inner) {
            let mut attrs = row_caps[1].to_string();
            let number = match attr_value(&attrs, "r") {
                Some(value) => value.trim().parse::<u32>().map_err(|_| {
                    ReportError::TemplateFormat(format!("invalid row number `{value}`"))
                })?,
                None => {
                    attrs = format!(" r=\"{next_row}\"{attrs}");
                    next_row
                }
            };
            next_row = number + 1;

            let mut cells = BTreeMap::new();
            let mut next_column = 1u32;
            if let Some(body) = row_caps.get(2) {
                for cell_caps in CELL_TAG.captures_iter(body.as_str()) {
                    let mut cell_attrs = cell_caps[1].to_string();
                    let column = match attr_value(&cell_attrs, "r") {
                        Some(reference) => {
                            reference
                                .parse::<CellRef>()
                                .map_err(|_| {
                                    ReportError::TemplateFormat(format!(
                                        "invalid cell reference `{reference}`"
                                    ))
                                })?
                                .column
                        }
                        None => {
                            let reference = format!("{}{number}", column_letters(next_column));
                            cell_attrs = format!(" r=\"{reference}\"{cell_attrs}");
                            next_column
                        }
                    };
                    next_column = column + 1;
                    cells.insert(
                        column,
                        CellXml {
                            attrs: cell_attrs,
                            body: cell_caps.get(2).map(|body| body.as_str().to_string()),
                        },
                    );
                }
            }
            rows.insert(
                number,
                RowXml {
                    attrs,
                    cells,
                    touched: false,
                },
            );
        }
        Ok(Self { rows })
    }

    fn cell(&self, cell: CellRef) -> Option<&CellXml> {
        self.rows
            .get(&cell.row)
            .and_then(|row| row.cells.get(&cell.column))
    }

    fn set(&mut self, cell: CellRef, value: &Scalar) {
        let row = self
            .rows
            .entry(cell.row)
            .or_insert_with(|| RowXml::empty(cell.row));
        row.touched = true;
        let style = row
            .cells
            .get(&cell.column)
            .and_then(|existing| attr_value(&existing.attrs, "s"));
        row.cells
            .insert(cell.column, CellXml::render(cell, style.as_deref(), value));
    }

    fn dimension(&self) -> Option<String> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (row, xml) in &self.rows {
            for column in xml.cells.keys() {
                bounds = Some(match bounds {
                    None => (*row, *column, *row, *column),
                    Some((min_r, min_c, max_r, max_c)) => (
                        min_r.min(*row),
                        min_c.min(*column),
                        max_r.max(*row),
                        max_c.max(*column),
                    ),
                });
            }
        }
        bounds.map(|(min_r, min_c, max_r, max_c)| {
            let start = format!("{}{min_r}", column_letters(min_c));
            let end = format!("{}{max_r}", column_letters(max_c));
            if start == end { start } else { format!("{start}:{end}") }
        })
    }

    fn to_xml(&self) -> String {
        if self.rows.is_empty() {
            return "<sheetData/>".to_string();
        }
        let rows = self.rows.values().map(RowXml::to_xml).collect::<String>();
        format!("<sheetData>{rows}</sheetData>")
    }
}

/// Applies `edits` to a worksheet part, leaving everything outside
/// `<sheetData>` (and the `<dimension>` hint) untouched.
fn patch_worksheet(xml: &str, edits: &BTreeMap<CellRef, Scalar>) -> Result<String, ReportError> {
    let caps = SHEET_DATA
        .captures(xml)
        .ok_or_else(|| ReportError::TemplateFormat("worksheet has no sheetData".to_string()))?;
    let range = caps.get(0).map_or(0..0, |whole| whole.range());
    let mut grid = SheetGrid::parse(caps.get(1).map_or("", |inner| inner.as_str()))?;
    for (cell, value) in edits {
        grid.set(*cell, value);
    }

    let mut patched = String::with_capacity(xml.len() + edits.len() * 48);
    patched.push_str(&xml[..range.start]);
    patched.push_str(&grid.to_xml());
    patched.push_str(&xml[range.end..]);

    if let Some(dimension) = grid.dimension() {
        let tag = format!("<dimension ref=\"{dimension}\"/>");
        patched = DIMENSION_TAG
            .replace(&patched, NoExpand(&tag))
            .into_owned();
    }
    Ok(patched)
}
