use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};

use crate::document::{
    CellStyle, CellValue, Document, ListValidation, SheetData, AMBER, GRAY, GREEN, HEADER_GRAY,
    RED, WHITE, YELLOW,
};
use crate::models::{
    clean_cell_text, clean_sheet_name, extract_id_from_hyperlink, extract_name_from_hyperlink,
    Config, OFFER_WORKBOOK_NAME, PROGRAM_COLUMN, SCHOOL_COLUMN, STATUS_COLUMN,
};
use crate::reader::find_id_column;

pub const VIP_SHEET: &str = "VIP情况";
pub const DDL_SHEET: &str = "押金DDL";
pub const OPTIONS_SHEET: &str = "选项列表";

const VIP_SCHOOLS: [&str; 5] = [
    "University College London",
    "The London School of Economics and Political Science",
    "King's College London",
    "University of Oxford",
    "University of Cambridge",
];

const ENROLLMENT_SCHOOL_HEADER: &str = "入学院校";
const ENROLLMENT_PROGRAM_HEADER: &str = "入学专业";
const VALIDATION_ERROR_TITLE: &str = "输入错误";
const VALIDATION_ERROR_MESSAGE: &str = "请从下拉列表中选择一个选项";

const VIP_COLUMN_WIDTH: f64 = 25.0;
const DDL_COLUMN_WIDTH: f64 = 20.0;
const ENROLLMENT_COLUMN_WIDTH: f64 = 25.0;

/// One id-column cell captured before the link rewrite.
#[derive(Debug, Clone)]
struct CrossLinkEntry {
    row: u32,
    display: String,
    client_id: Option<i64>,
}

#[derive(Debug, Clone)]
struct VipRow {
    client_id: String,
    client_name: String,
    school: String,
    program: String,
    status: String,
}

#[derive(Debug, Clone)]
struct DeadlineRow {
    client_id: String,
    client_name: String,
    school: String,
    program: String,
    days_left: f64,
}

pub struct TrackerUpdater<'a> {
    config: &'a Config,
    offer: &'a Document,
}

impl<'a> TrackerUpdater<'a> {
    pub fn new(config: &'a Config, offer: &'a Document) -> Self {
        Self { config, offer }
    }

    /// Build the updated tracking workbook: source sheets with the selected
    /// one cross-linked and constrained, rollups up front, the hidden option
    /// lookup at the back.
    pub fn build(&self, source: &Document, selected_sheet: &str) -> Result<Document> {
        let source_sheet = source
            .sheet(selected_sheet)
            .ok_or_else(|| anyhow!("sheet {} not found in tracking workbook", selected_sheet))?;
        let id_col = find_id_column(source_sheet).ok_or_else(|| {
            anyhow!("sheet {} has no 客户id column in row 1", selected_sheet)
        })?;

        let links = capture_cross_links(source_sheet, id_col);
        println!("   ✅ Captured {} client ids on {}", links.len(), selected_sheet);

        let options_by_id = self.collect_option_sets();
        let (options_sheet, validations) =
            build_option_blocks(&links, &options_by_id, source_sheet.column_count());

        let mut updated = source_sheet.clone();
        rewrite_id_links(&mut updated, id_col, &links);
        append_enrollment_columns(&mut updated);
        for validation in validations {
            updated.add_list_validation(validation);
        }

        let mut document = Document::new();
        for sheet in source.sheets() {
            if sheet.name == selected_sheet {
                document.push_sheet(updated.clone());
            } else {
                document.push_sheet(sheet.clone());
            }
        }

        document.insert_sheet(0, self.build_vip_sheet());
        document.insert_sheet(1, self.build_deadline_sheet());
        document.push_sheet(options_sheet);
        Ok(document)
    }

    /// Distinct (school, program) values per client, read back from the
    /// rendered per-client sheets.
    fn collect_option_sets(&self) -> BTreeMap<i64, (BTreeSet<String>, BTreeSet<String>)> {
        let mut options: BTreeMap<i64, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
        for sheet in self.offer.sheets() {
            if sheet.name == VIP_SHEET || sheet.name == DDL_SHEET {
                continue;
            }
            let client_id = match sheet.name.parse::<i64>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            let entry = options.entry(client_id).or_default();
            for row in 2..sheet.row_count() {
                let school = clean_cell_text(sheet.text(row, 0).trim());
                let program = clean_cell_text(sheet.text(row, 1).trim());
                if !school.is_empty() && !program.is_empty() {
                    entry.0.insert(school);
                    entry.1.insert(program);
                }
            }
        }
        options
    }

    fn build_vip_sheet(&self) -> SheetData {
        let mut rows: Vec<VipRow> = Vec::new();
        for sheet in self.offer.sheets() {
            if sheet.name == VIP_SHEET || sheet.name == DDL_SHEET {
                continue;
            }
            let client_name = client_display_name(sheet);
            for row in 2..sheet.row_count() {
                let school = sheet.text(row, 0);
                if !is_vip_school(&school) {
                    continue;
                }
                rows.push(VipRow {
                    client_id: sheet.name.clone(),
                    client_name: client_name.clone(),
                    school,
                    program: sheet.text(row, 1),
                    status: sheet.text(row, 2),
                });
            }
        }

        // Obtained offers float to the top within each school.
        rows.sort_by(|a, b| {
            let ka = (
                a.school.as_str(),
                if a.status.contains("获得") { 0 } else { 1 },
                a.client_name.as_str(),
            );
            let kb = (
                b.school.as_str(),
                if b.status.contains("获得") { 0 } else { 1 },
                b.client_name.as_str(),
            );
            ka.cmp(&kb)
        });

        let headers = ["姓名", SCHOOL_COLUMN, PROGRAM_COLUMN, STATUS_COLUMN];
        let mut sheet = SheetData::new(VIP_SHEET);
        for (col, header) in headers.iter().enumerate() {
            sheet.set_styled(
                0,
                col as u16,
                CellValue::Text(header.to_string()),
                CellStyle::filled(HEADER_GRAY),
            );
        }
        for (i, row) in rows.iter().enumerate() {
            let r = 1 + i as u32;
            sheet.set_styled(
                r,
                0,
                CellValue::Link {
                    url: format!("{}{}", self.config.crm_apply_url, row.client_id),
                    label: row.client_name.clone(),
                },
                CellStyle::link(),
            );
            sheet.set(r, 1, CellValue::Text(row.school.clone()));
            sheet.set(r, 2, CellValue::Text(row.program.clone()));
            sheet.set_styled(
                r,
                3,
                CellValue::Text(row.status.clone()),
                vip_status_style(&row.status).unwrap_or_default(),
            );
        }
        for col in 0..headers.len() as u16 {
            sheet.set_column_width(col, VIP_COLUMN_WIDTH);
        }
        sheet
    }

    fn build_deadline_sheet(&self) -> SheetData {
        let mut rows: Vec<DeadlineRow> = Vec::new();
        for sheet in self.offer.sheets() {
            if sheet.name == VIP_SHEET || sheet.name == DDL_SHEET {
                continue;
            }
            let client_name = client_display_name(sheet);
            let countdown_col = match sheet.row_width(1) {
                0 => continue,
                width => width - 1,
            };
            for row in 2..sheet.row_count() {
                let days_left = match sheet.number(row, countdown_col) {
                    Some(days) if (0.0..=30.0).contains(&days) => days,
                    _ => continue,
                };
                rows.push(DeadlineRow {
                    client_id: sheet.name.clone(),
                    client_name: client_name.clone(),
                    school: sheet.text(row, 0),
                    program: sheet.text(row, 1),
                    days_left,
                });
            }
        }

        rows.sort_by(|a, b| {
            a.days_left
                .partial_cmp(&b.days_left)
                .unwrap_or(Ordering::Equal)
        });

        let headers = ["姓名", SCHOOL_COLUMN, PROGRAM_COLUMN, "押金截止日期", "剩余天数"];
        let mut sheet = SheetData::new(DDL_SHEET);
        for (col, header) in headers.iter().enumerate() {
            sheet.set_styled(
                0,
                col as u16,
                CellValue::Text(header.to_string()),
                CellStyle::filled(HEADER_GRAY),
            );
        }
        for (i, row) in rows.iter().enumerate() {
            let r = 1 + i as u32;
            sheet.set_styled(
                r,
                0,
                CellValue::Link {
                    url: format!("{}{}", self.config.crm_apply_url, row.client_id),
                    label: row.client_name.clone(),
                },
                CellStyle::link(),
            );
            sheet.set(r, 1, CellValue::Text(row.school.clone()));
            sheet.set(r, 2, CellValue::Text(row.program.clone()));
            sheet.set(r, 3, CellValue::Number(row.days_left));
            sheet.set_styled(
                r,
                4,
                CellValue::Number(row.days_left),
                deadline_tier_style(row.days_left),
            );
        }
        for col in 0..headers.len() as u16 {
            sheet.set_column_width(col, DDL_COLUMN_WIDTH);
        }
        sheet
    }
}

/// First pass over the id column: remember every original identifier before
/// any cell is rewritten, so an already-linked cell does not compound.
fn capture_cross_links(sheet: &SheetData, id_col: u16) -> Vec<CrossLinkEntry> {
    let mut entries = Vec::new();
    for row in 1..sheet.row_count() {
        let value = match sheet.value(row, id_col) {
            Some(value) => value,
            None => continue,
        };
        let raw = match value {
            CellValue::Formula(formula) => extract_id_from_hyperlink(formula),
            other => other.as_text(),
        };
        let display = raw.trim().to_string();
        if display.is_empty() {
            continue;
        }
        let client_id = display.parse::<i64>().ok();
        entries.push(CrossLinkEntry {
            row,
            display,
            client_id,
        });
    }
    entries
}

/// Second pass: every captured cell becomes a workbook-internal link into the
/// generated per-client sheet.
fn rewrite_id_links(sheet: &mut SheetData, id_col: u16, links: &[CrossLinkEntry]) {
    for entry in links {
        let anchor = clean_sheet_name(&entry.display);
        sheet.set(
            entry.row,
            id_col,
            CellValue::Link {
                url: format!("[{}]{}!A1", OFFER_WORKBOOK_NAME, anchor),
                label: entry.display.clone(),
            },
        );
    }
}

fn append_enrollment_columns(sheet: &mut SheetData) {
    let school_col = sheet.column_count();
    let program_col = school_col + 1;
    sheet.set_styled(
        0,
        school_col,
        CellValue::Text(ENROLLMENT_SCHOOL_HEADER.to_string()),
        CellStyle::filled(HEADER_GRAY),
    );
    sheet.set_styled(
        0,
        program_col,
        CellValue::Text(ENROLLMENT_PROGRAM_HEADER.to_string()),
        CellStyle::filled(HEADER_GRAY),
    );
    sheet.set_column_width(school_col, ENROLLMENT_COLUMN_WIDTH);
    sheet.set_column_width(program_col, ENROLLMENT_COLUMN_WIDTH);
}

/// Lay out the hidden option sheet and derive the per-row constraints.
///
/// Each client with options gets a two-column block: a labeled header row,
/// one row per distinct school/program (index-aligned, blanks for the shorter
/// list), and a blank separator row. The constraints reference the block by
/// absolute range.
fn build_option_blocks(
    links: &[CrossLinkEntry],
    options_by_id: &BTreeMap<i64, (BTreeSet<String>, BTreeSet<String>)>,
    first_new_col: u16,
) -> (SheetData, Vec<ListValidation>) {
    let school_col = first_new_col;
    let program_col = first_new_col + 1;

    let mut sheet = SheetData::new(OPTIONS_SHEET);
    sheet.hidden = true;
    let mut validations = Vec::new();
    let mut current_row: u32 = 0;

    for entry in links {
        let client_id = match entry.client_id {
            Some(id) => id,
            None => continue,
        };
        let (schools, programs) = match options_by_id.get(&client_id) {
            Some(options) => options,
            None => continue,
        };
        if schools.is_empty() && programs.is_empty() {
            continue;
        }

        let header_row = current_row;
        sheet.set(
            current_row,
            0,
            CellValue::Text(format!("ID_{}_学校", client_id)),
        );
        sheet.set(
            current_row,
            1,
            CellValue::Text(format!("ID_{}_专业", client_id)),
        );
        current_row += 1;

        let schools: Vec<&String> = schools.iter().collect();
        let programs: Vec<&String> = programs.iter().collect();
        let block_len = schools.len().max(programs.len()).max(1);
        for i in 0..block_len {
            if let Some(school) = schools.get(i) {
                sheet.set(current_row, 0, CellValue::Text((*school).clone()));
            }
            if let Some(program) = programs.get(i) {
                sheet.set(current_row, 1, CellValue::Text((*program).clone()));
            }
            current_row += 1;
        }
        current_row += 1; // blank separator row

        // Option rows sit just under the block header; ranges are 1-based.
        if !schools.is_empty() {
            validations.push(ListValidation {
                row: entry.row,
                col: school_col,
                source_range: format!(
                    "{}!$A${}:$A${}",
                    OPTIONS_SHEET,
                    header_row + 2,
                    header_row + 1 + schools.len() as u32
                ),
                error_title: VALIDATION_ERROR_TITLE.to_string(),
                error_message: VALIDATION_ERROR_MESSAGE.to_string(),
            });
        }
        if !programs.is_empty() {
            validations.push(ListValidation {
                row: entry.row,
                col: program_col,
                source_range: format!(
                    "{}!$B${}:$B${}",
                    OPTIONS_SHEET,
                    header_row + 2,
                    header_row + 1 + programs.len() as u32
                ),
                error_title: VALIDATION_ERROR_TITLE.to_string(),
                error_message: VALIDATION_ERROR_MESSAGE.to_string(),
            });
        }
    }

    (sheet, validations)
}

/// The name cell of a per-client sheet is normally a link cell, but a
/// re-ingested workbook hands it back as a raw formula.
fn client_display_name(sheet: &SheetData) -> String {
    match sheet.value(0, 0) {
        Some(CellValue::Formula(formula)) => extract_name_from_hyperlink(formula),
        Some(value) => value.as_text(),
        None => String::new(),
    }
}

fn is_vip_school(school: &str) -> bool {
    let school = school.to_lowercase();
    VIP_SCHOOLS
        .iter()
        .any(|vip| school.contains(&vip.to_lowercase()))
}

/// The rollup keeps a reduced three-tier status coloring with its own gray
/// set; this intentionally differs from the per-client rules.
fn vip_status_style(status: &str) -> Option<CellStyle> {
    if status.contains("获得") {
        return Some(CellStyle {
            fill: Some(GREEN),
            font_color: Some(WHITE),
            bold: true,
            ..Default::default()
        });
    }
    match status {
        "拒信" | "大学撤销" | "未递-撤销申请需求" => Some(CellStyle {
            fill: Some(GRAY),
            bold: true,
            ..Default::default()
        }),
        "已递交" => Some(CellStyle {
            fill: Some(AMBER),
            bold: true,
            ..Default::default()
        }),
        _ => None,
    }
}

fn deadline_tier_style(days_left: f64) -> CellStyle {
    if days_left <= 7.0 {
        CellStyle {
            fill: Some(RED),
            font_color: Some(WHITE),
            ..Default::default()
        }
    } else if days_left <= 14.0 {
        CellStyle {
            fill: Some(YELLOW),
            ..Default::default()
        }
    } else {
        CellStyle {
            fill: Some(GREEN),
            font_color: Some(WHITE),
            ..Default::default()
        }
    }
}
