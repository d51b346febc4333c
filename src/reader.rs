use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};

use crate::document::{CellValue, Document, SheetData};
use crate::models::{
    parse_deadline, result_priority, ApplicationRecord, ApplicationTable, COLUMNS_TO_KEEP,
    DEADLINE_COLUMN, ID_COLUMN, NAME_COLUMN, NOT_OBTAINED, STATUS_COLUMN,
};

/// Read the flat application export, keeping only the tracked columns.
///
/// Missing tracked columns and rows without a usable client id are reported
/// and skipped, not fatal; a missing id column is fatal since nothing can be
/// grouped without it.
pub fn read_application_table(csv_bytes: &[u8]) -> Result<ApplicationTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_bytes);

    let headers: Vec<String> = reader
        .headers()
        .context("reading export header row")?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let existing: Vec<String> = COLUMNS_TO_KEEP
        .iter()
        .filter(|column| headers.iter().any(|header| header == *column))
        .map(|column| column.to_string())
        .collect();
    let missing: Vec<&str> = COLUMNS_TO_KEEP
        .iter()
        .filter(|column| !headers.iter().any(|header| header == *column))
        .copied()
        .collect();

    println!(
        "   ✅ Found {} of {} tracked columns",
        existing.len(),
        COLUMNS_TO_KEEP.len()
    );
    if !missing.is_empty() {
        println!("   ⚠️  Missing columns: {}", missing.join(", "));
    }

    let indices: Vec<usize> = existing
        .iter()
        .map(|column| headers.iter().position(|header| header == column).unwrap())
        .collect();
    let id_pos = existing
        .iter()
        .position(|column| column == ID_COLUMN)
        .ok_or_else(|| anyhow!("export has no {} column", ID_COLUMN))?;
    let name_pos = existing.iter().position(|column| column == NAME_COLUMN);
    let status_pos = existing.iter().position(|column| column == STATUS_COLUMN);
    let deadline_pos = existing.iter().position(|column| column == DEADLINE_COLUMN);

    let mut records = Vec::new();
    let mut skipped_ids = 0usize;
    let mut unmapped_statuses: BTreeSet<String> = BTreeSet::new();

    for row in reader.records() {
        let row = row.context("reading export record")?;
        let values: Vec<String> = indices
            .iter()
            .map(|idx| {
                let raw = row.get(*idx).unwrap_or("");
                if raw.trim() == NOT_OBTAINED {
                    String::new()
                } else {
                    raw.to_string()
                }
            })
            .collect();

        let client_id = match parse_client_id(values[id_pos].trim()) {
            Some(id) => id,
            None => {
                skipped_ids += 1;
                continue;
            }
        };
        let client_name = name_pos
            .map(|pos| values[pos].trim().to_string())
            .filter(|name| !name.is_empty());
        let result_status = status_pos
            .map(|pos| values[pos].trim().to_string())
            .unwrap_or_default();
        let deposit_deadline = deadline_pos.and_then(|pos| parse_deadline(&values[pos]));

        if !result_status.is_empty() && result_priority(&result_status) == 6 {
            unmapped_statuses.insert(result_status.clone());
        }

        records.push(ApplicationRecord {
            client_id,
            client_name,
            values,
            result_status,
            deposit_deadline,
        });
    }

    if skipped_ids > 0 {
        println!("   ⚠️  Skipped {} rows without a usable client id", skipped_ids);
    }
    if !unmapped_statuses.is_empty() {
        println!(
            "   ⚠️  Statuses outside the priority table (ranked last): {}",
            unmapped_statuses.into_iter().collect::<Vec<_>>().join(", ")
        );
    }

    Ok(ApplicationTable {
        columns: existing,
        records,
    })
}

/// Exports sometimes carry ids as floats ("1001.0"); accept those too.
fn parse_client_id(raw: &str) -> Option<i64> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(id) = raw.parse::<i64>() {
        return Some(id);
    }
    match raw.parse::<f64>() {
        Ok(id) if id.fract() == 0.0 => Some(id as i64),
        _ => None,
    }
}

/// Ingest every sheet of the tracking workbook into the document model.
///
/// calamine wants random access, so the workbook bytes get spooled to a
/// short-lived on-disk copy; the copy is removed when the handle drops and
/// removal failures are ignored.
pub fn read_source_workbook(bytes: &[u8]) -> Result<Document> {
    let mut spool = tempfile::NamedTempFile::new().context("creating temporary workbook copy")?;
    spool
        .write_all(bytes)
        .context("writing temporary workbook copy")?;
    let mut workbook =
        open_workbook_auto(spool.path()).context("opening tracking workbook")?;

    let mut document = Document::new();
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    for sheet_name in &sheet_names {
        let range = workbook
            .worksheet_range(sheet_name)
            .with_context(|| format!("reading sheet {}", sheet_name))?;
        let mut sheet = SheetData::new(sheet_name.clone());

        let (row_offset, col_offset) = range.start().unwrap_or((0, 0));
        for (r, row) in range.rows().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                let value = match cell {
                    Data::Empty => continue,
                    Data::String(s) => CellValue::Text(s.clone()),
                    Data::Float(f) => CellValue::Number(*f),
                    Data::Int(i) => CellValue::Number(*i as f64),
                    Data::Bool(b) => CellValue::Text(b.to_string()),
                    Data::DateTime(dt) => match dt.as_datetime() {
                        Some(datetime) => CellValue::Date(datetime.date()),
                        None => CellValue::Number(dt.as_f64()),
                    },
                    Data::DateTimeIso(s) => CellValue::Text(s.clone()),
                    Data::DurationIso(s) => CellValue::Text(s.clone()),
                    Data::Error(_) => continue,
                };
                sheet.set(row_offset + r as u32, (col_offset as u16) + c as u16, value);
            }
        }

        // Formula cells overlay their cached values. calamine hands back the
        // formula text without the leading '='.
        if let Ok(formulas) = workbook.worksheet_formula(sheet_name) {
            let (row_offset, col_offset) = formulas.start().unwrap_or((0, 0));
            for (r, row) in formulas.rows().enumerate() {
                for (c, formula) in row.iter().enumerate() {
                    if formula.is_empty() {
                        continue;
                    }
                    let text = if formula.starts_with('=') {
                        formula.clone()
                    } else {
                        format!("={}", formula)
                    };
                    sheet.set(
                        row_offset + r as u32,
                        (col_offset as u16) + c as u16,
                        CellValue::Formula(text),
                    );
                }
            }
        }

        document.push_sheet(sheet);
    }
    Ok(document)
}

/// Locate the client-id column on the header row of a sheet.
pub fn find_id_column(sheet: &SheetData) -> Option<u16> {
    (0..sheet.column_count()).find(|col| sheet.text(0, *col).trim() == ID_COLUMN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_csv() -> Vec<u8> {
        let mut csv = String::new();
        csv.push_str("客户id,姓名,申请院校英文,申请专业英文,申请结果,押金截止日期,无关列\n");
        csv.push_str("1001,张三,University of Oxford,MSc CS,获得CAS/COE,2024-06-01,x\n");
        csv.push_str("1001,张三,King's College London,LLM,未获得,未获得,x\n");
        csv.push_str("2002,李四,UCL,BSc,拒信,2024-06-01 00:00:00,x\n");
        csv.push_str(",无名,UCL,BSc,已递交,,x\n");
        csv.into_bytes()
    }

    #[test]
    fn keeps_only_tracked_columns_in_allow_list_order() {
        let table = read_application_table(&sample_csv()).unwrap();
        assert_eq!(
            table.columns,
            vec!["客户id", "姓名", "申请院校英文", "申请专业英文", "申请结果", "押金截止日期"]
        );
    }

    #[test]
    fn skips_rows_without_a_usable_client_id() {
        let table = read_application_table(&sample_csv()).unwrap();
        assert_eq!(table.records.len(), 3);
        assert!(table.records.iter().all(|r| r.client_id == 1001 || r.client_id == 2002));
    }

    #[test]
    fn normalizes_the_not_obtained_placeholder() {
        let table = read_application_table(&sample_csv()).unwrap();
        let second = &table.records[1];
        assert_eq!(second.result_status, "");
        assert_eq!(second.deposit_deadline, None);
    }

    #[test]
    fn parses_deadlines_including_datetime_forms() {
        let table = read_application_table(&sample_csv()).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(table.records[0].deposit_deadline, Some(expected));
        assert_eq!(table.records[2].deposit_deadline, Some(expected));
    }

    #[test]
    fn missing_tracked_columns_are_not_fatal() {
        let csv = "客户id,姓名\n1001,张三\n".as_bytes().to_vec();
        let table = read_application_table(&csv).unwrap();
        assert_eq!(table.columns, vec!["客户id", "姓名"]);
        assert_eq!(table.records.len(), 1);
        assert_eq!(table.records[0].client_name.as_deref(), Some("张三"));
    }

    #[test]
    fn missing_id_column_is_fatal() {
        let csv = "姓名,申请结果\n张三,拒信\n".as_bytes().to_vec();
        assert!(read_application_table(&csv).is_err());
    }

    #[test]
    fn client_ids_parse_from_integer_and_float_forms() {
        assert_eq!(parse_client_id("1001"), Some(1001));
        assert_eq!(parse_client_id("1001.0"), Some(1001));
        assert_eq!(parse_client_id("1001.5"), None);
        assert_eq!(parse_client_id("abc"), None);
        assert_eq!(parse_client_id(""), None);
    }

    #[test]
    fn find_id_column_scans_the_header_row() {
        let mut sheet = SheetData::new("跟进");
        sheet.set(0, 0, CellValue::Text("序号".to_string()));
        sheet.set(0, 2, CellValue::Text("客户id".to_string()));
        assert_eq!(find_id_column(&sheet), Some(2));
        let empty = SheetData::new("empty");
        assert_eq!(find_id_column(&empty), None);
    }
}
