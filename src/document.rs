use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate};
use rust_xlsxwriter::{
    Color, DataValidation, ExcelDateTime, Format, FormatAlign, FormatUnderline, Formula, Workbook,
    XlsxError,
};

use crate::models::hyperlink_formula;

// Fill and font colors shared by the sheet builders.
pub const GREEN: u32 = 0x008000;
pub const GRAY: u32 = 0x808080;
pub const RED: u32 = 0xFF0000;
pub const YELLOW: u32 = 0xFFFF00;
pub const AMBER: u32 = 0xFFC222;
pub const TEAL: u32 = 0x5F9EA0;
pub const SALMON: u32 = 0xF08080;
pub const HEADER_GRAY: u32 = 0xD3D3D3;
pub const WHITE: u32 = 0xFFFFFF;
pub const LINK_BLUE: u32 = 0x0000FF;

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    /// A raw formula carried over from an ingested workbook.
    Formula(String),
    /// A hyperlink rendered as an `=HYPERLINK(...)` formula.
    Link { url: String, label: String },
}

impl CellValue {
    /// Plain-text view of the cell. Link cells yield their display label,
    /// integral numbers drop the trailing `.0`.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::Formula(f) => f.clone(),
            CellValue::Link { label, .. } => label.clone(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellStyle {
    pub fill: Option<u32>,
    pub font_color: Option<u32>,
    pub bold: bool,
    pub underline: bool,
    pub font_size: Option<f64>,
    pub align_left: bool,
}

impl CellStyle {
    pub fn filled(color: u32) -> Self {
        CellStyle {
            fill: Some(color),
            ..Default::default()
        }
    }

    /// Blue underlined label used for CRM hyperlink cells.
    pub fn link() -> Self {
        CellStyle {
            font_color: Some(LINK_BLUE),
            underline: true,
            ..Default::default()
        }
    }

    /// The larger bold variant used on the per-client name row.
    pub fn header_link() -> Self {
        CellStyle {
            font_color: Some(LINK_BLUE),
            underline: true,
            bold: true,
            font_size: Some(12.0),
            align_left: true,
            ..Default::default()
        }
    }
}

/// A per-row list constraint sourced from an absolute range reference.
#[derive(Debug, Clone)]
pub struct ListValidation {
    pub row: u32,
    pub col: u16,
    pub source_range: String,
    pub error_title: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SheetData {
    pub name: String,
    pub hidden: bool,
    cells: BTreeMap<(u32, u16), (CellValue, CellStyle)>,
    merges: Vec<(u32, u16, u32, u16)>,
    column_widths: Vec<(u16, f64)>,
    validations: Vec<ListValidation>,
}

impl SheetData {
    pub fn new(name: impl Into<String>) -> Self {
        SheetData {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn set(&mut self, row: u32, col: u16, value: CellValue) {
        self.set_styled(row, col, value, CellStyle::default());
    }

    pub fn set_styled(&mut self, row: u32, col: u16, value: CellValue, style: CellStyle) {
        self.cells.insert((row, col), (value, style));
    }

    pub fn value(&self, row: u32, col: u16) -> Option<&CellValue> {
        self.cells.get(&(row, col)).map(|(value, _)| value)
    }

    pub fn style(&self, row: u32, col: u16) -> Option<&CellStyle> {
        self.cells.get(&(row, col)).map(|(_, style)| style)
    }

    /// Plain-text view of a cell; empty string for an empty cell.
    pub fn text(&self, row: u32, col: u16) -> String {
        self.value(row, col)
            .map(|value| value.as_text())
            .unwrap_or_default()
    }

    pub fn number(&self, row: u32, col: u16) -> Option<f64> {
        self.value(row, col).and_then(|value| value.as_number())
    }

    /// One past the last populated row index.
    pub fn row_count(&self) -> u32 {
        self.cells
            .keys()
            .map(|(row, _)| row + 1)
            .max()
            .unwrap_or(0)
    }

    /// One past the last populated column index, across all rows.
    pub fn column_count(&self) -> u16 {
        self.cells
            .keys()
            .map(|(_, col)| col + 1)
            .max()
            .unwrap_or(0)
    }

    /// One past the last populated column index of a single row.
    pub fn row_width(&self, row: u32) -> u16 {
        self.cells
            .keys()
            .filter(|(r, _)| *r == row)
            .map(|(_, col)| col + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn merge(&mut self, first_row: u32, first_col: u16, last_row: u32, last_col: u16) {
        self.merges.push((first_row, first_col, last_row, last_col));
    }

    pub fn set_column_width(&mut self, col: u16, width: f64) {
        self.column_widths.push((col, width));
    }

    pub fn add_list_validation(&mut self, validation: ListValidation) {
        self.validations.push(validation);
    }

    pub fn validations(&self) -> &[ListValidation] {
        &self.validations
    }
}

/// A workbook under construction: an ordered collection of sheets, finalized
/// only when serialized.
#[derive(Debug, Clone, Default)]
pub struct Document {
    sheets: Vec<SheetData>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    /// Append a sheet, discarding any prior sheet of the same name.
    pub fn push_sheet(&mut self, sheet: SheetData) {
        self.sheets.retain(|existing| existing.name != sheet.name);
        self.sheets.push(sheet);
    }

    /// Insert a sheet at a fixed position, discarding any prior sheet of the
    /// same name.
    pub fn insert_sheet(&mut self, index: usize, sheet: SheetData) {
        self.sheets.retain(|existing| existing.name != sheet.name);
        let index = index.min(self.sheets.len());
        self.sheets.insert(index, sheet);
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetData> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    pub fn sheets(&self) -> &[SheetData] {
        &self.sheets
    }

    /// Serialize the document to xlsx bytes.
    pub fn to_xlsx_buffer(&self) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        for sheet in &self.sheets {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(sheet.name.as_str())?;
            if sheet.hidden {
                worksheet.set_hidden(true);
            }
            // Merged ranges are registered with a blank placeholder; the
            // anchor cell is written afterwards like any other cell.
            for (first_row, first_col, last_row, last_col) in &sheet.merges {
                worksheet.merge_range(
                    *first_row,
                    *first_col,
                    *last_row,
                    *last_col,
                    "",
                    &Format::new(),
                )?;
            }
            for ((row, col), (value, style)) in &sheet.cells {
                let format = build_format(value, style);
                match value {
                    CellValue::Text(s) => {
                        worksheet.write_string_with_format(*row, *col, s.as_str(), &format)?;
                    }
                    CellValue::Number(n) => {
                        worksheet.write_number_with_format(*row, *col, *n, &format)?;
                    }
                    CellValue::Date(d) => {
                        let date =
                            ExcelDateTime::from_ymd(d.year() as u16, d.month() as u8, d.day() as u8)?;
                        worksheet.write_datetime_with_format(*row, *col, &date, &format)?;
                    }
                    CellValue::Formula(f) => {
                        worksheet.write_formula_with_format(
                            *row,
                            *col,
                            Formula::new(f.as_str()),
                            &format,
                        )?;
                    }
                    CellValue::Link { url, label } => {
                        let formula = hyperlink_formula(url, label);
                        worksheet.write_formula_with_format(
                            *row,
                            *col,
                            Formula::new(formula.as_str()),
                            &format,
                        )?;
                    }
                }
            }
            for (col, width) in &sheet.column_widths {
                worksheet.set_column_width(*col, *width)?;
            }
            for validation in &sheet.validations {
                let rule = DataValidation::new()
                    .allow_list_formula(Formula::new(validation.source_range.as_str()))
                    .set_error_title(validation.error_title.as_str())?
                    .set_error_message(validation.error_message.as_str())?;
                worksheet.add_data_validation(
                    validation.row,
                    validation.col,
                    validation.row,
                    validation.col,
                    &rule,
                )?;
            }
        }
        workbook.save_to_buffer()
    }
}

fn build_format(value: &CellValue, style: &CellStyle) -> Format {
    let mut format = Format::new();
    if let Some(color) = style.fill {
        format = format.set_background_color(Color::RGB(color));
    }
    if let Some(color) = style.font_color {
        format = format.set_font_color(Color::RGB(color));
    }
    if style.bold {
        format = format.set_bold();
    }
    if style.underline {
        format = format.set_underline(FormatUnderline::Single);
    }
    if let Some(size) = style.font_size {
        format = format.set_font_size(size);
    }
    if style.align_left {
        format = format.set_align(FormatAlign::Left);
    }
    if let CellValue::Date(_) = value {
        format = format.set_num_format("yyyy-mm-dd");
    }
    format
}

/// Serialize with a bounded retry on transient failures.
pub fn save_with_retry(document: &Document, label: &str) -> Result<Vec<u8>> {
    let mut attempt = 1;
    loop {
        match document.to_xlsx_buffer() {
            Ok(buffer) => return Ok(buffer),
            Err(e) if attempt < SAVE_ATTEMPTS => {
                println!(
                    "⚠️  Saving {} failed (attempt {}/{}): {}, retrying in {}s...",
                    label,
                    attempt,
                    SAVE_ATTEMPTS,
                    e,
                    SAVE_RETRY_DELAY.as_secs()
                );
                std::thread::sleep(SAVE_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => {
                return Err(anyhow!(
                    "saving {} failed after {} attempts: {}",
                    label,
                    SAVE_ATTEMPTS,
                    e
                ))
            }
        }
    }
}
