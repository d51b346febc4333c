use chrono::NaiveDate;

use crate::document::{
    CellStyle, CellValue, Document, SheetData, AMBER, GRAY, GREEN, HEADER_GRAY, RED, SALMON, TEAL,
    WHITE,
};
use crate::models::{
    clean_cell_text, clean_sheet_name, ApplicationTable, ClientGroup, Config, STATUS_COLUMN,
};

pub const COUNTDOWN_HEADER: &str = "押金截止倒计时(天)";

/// Column N, where the mailbox link sits on every per-client sheet.
const EMAIL_COLUMN: u16 = 13;
const CLIENT_COLUMN_WIDTH: f64 = 15.0;

pub struct OfferWorkbookBuilder<'a> {
    config: &'a Config,
    today: NaiveDate,
}

impl<'a> OfferWorkbookBuilder<'a> {
    pub fn new(config: &'a Config, today: NaiveDate) -> Self {
        Self { config, today }
    }

    /// Render one sheet per client group into a fresh workbook.
    pub fn build(&self, table: &ApplicationTable, groups: &[ClientGroup]) -> Document {
        let mut document = Document::new();
        for group in groups {
            document.push_sheet(self.build_client_sheet(table, group));
        }
        document
    }

    fn build_client_sheet(&self, table: &ApplicationTable, group: &ClientGroup) -> SheetData {
        let display_columns = table.display_columns();
        let mut sheet = SheetData::new(clean_sheet_name(&group.client_id.to_string()));

        // Row 1: the client name linked to the CRM detail page, merged across
        // the display columns, plus the mailbox link at column N.
        if display_columns.len() > 1 {
            sheet.merge(0, 0, 0, display_columns.len() as u16 - 1);
        }
        sheet.set_styled(
            0,
            0,
            CellValue::Link {
                url: format!("{}{}", self.config.crm_apply_url, group.client_id),
                label: group.client_name.clone(),
            },
            CellStyle::header_link(),
        );
        sheet.set_styled(
            0,
            EMAIL_COLUMN,
            CellValue::Link {
                url: format!("{}{}", self.config.crm_email_url, group.client_id),
                label: "邮箱".to_string(),
            },
            CellStyle::header_link(),
        );

        // Row 2: display headers plus the computed countdown column.
        let mut headers: Vec<String> = display_columns.iter().map(|c| c.to_string()).collect();
        headers.push(COUNTDOWN_HEADER.to_string());
        for (col, header) in headers.iter().enumerate() {
            sheet.set_styled(
                1,
                col as u16,
                CellValue::Text(header.clone()),
                CellStyle::filled(HEADER_GRAY),
            );
        }

        // Rows 3..: one row per application, already in priority order.
        for (offset, record) in group.records.iter().enumerate() {
            let row = 2 + offset as u32;
            let values = table.display_values(record);
            for (col, (column, raw)) in display_columns.iter().zip(values).enumerate() {
                let value = clean_cell_text(raw);
                if value.is_empty() {
                    continue;
                }
                let style = if *column == STATUS_COLUMN {
                    status_style(&value).unwrap_or_default()
                } else {
                    CellStyle::default()
                };
                sheet.set_styled(row, col as u16, CellValue::Text(value), style);
            }

            if let Some(deadline) = record.deposit_deadline {
                let days_left = deadline.signed_duration_since(self.today).num_days();
                let style = countdown_style(days_left).unwrap_or_default();
                sheet.set_styled(
                    row,
                    headers.len() as u16 - 1,
                    CellValue::Number(days_left as f64),
                    style,
                );
            }
        }

        for col in 0..headers.len() as u16 {
            sheet.set_column_width(col, CLIENT_COLUMN_WIDTH);
        }
        sheet
    }
}

/// Fill and font rules for the application-result column.
pub fn status_style(status: &str) -> Option<CellStyle> {
    if status.contains("获得") {
        return Some(CellStyle {
            fill: Some(GREEN),
            font_color: Some(WHITE),
            bold: true,
            ..Default::default()
        });
    }
    match status {
        "拒信" | "大学撤销" | "学生放弃" => Some(CellStyle {
            fill: Some(GRAY),
            bold: true,
            ..Default::default()
        }),
        "已递交" => Some(CellStyle {
            fill: Some(AMBER),
            bold: true,
            ..Default::default()
        }),
        "未递-待交申请费" | "已递交-申请费待付" => Some(CellStyle {
            fill: Some(TEAL),
            bold: true,
            ..Default::default()
        }),
        "未递-材料缺失或需修改" => Some(CellStyle {
            fill: Some(SALMON),
            bold: true,
            ..Default::default()
        }),
        _ => None,
    }
}

/// Tier fill for the deposit countdown cell: expired gray, due within a month
/// red on white, otherwise plain.
pub fn countdown_style(days_left: i64) -> Option<CellStyle> {
    if days_left <= 0 {
        Some(CellStyle {
            fill: Some(GRAY),
            ..Default::default()
        })
    } else if days_left <= 30 {
        Some(CellStyle {
            fill: Some(RED),
            font_color: Some(WHITE),
            ..Default::default()
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouper::group_by_client;
    use crate::models::ApplicationRecord;

    fn sample_table() -> ApplicationTable {
        let columns = vec![
            "客户id".to_string(),
            "姓名".to_string(),
            "申请院校英文".to_string(),
            "申请专业英文".to_string(),
            "申请结果".to_string(),
            "押金截止日期".to_string(),
        ];
        let record = ApplicationRecord {
            client_id: 1001,
            client_name: Some("张三".to_string()),
            values: vec![
                "1001".to_string(),
                "张三".to_string(),
                "University of Oxford".to_string(),
                "MSc CS".to_string(),
                "获得CAS/COE".to_string(),
                "2024-06-01".to_string(),
            ],
            result_status: "获得CAS/COE".to_string(),
            deposit_deadline: NaiveDate::from_ymd_opt(2024, 6, 1),
        };
        ApplicationTable {
            columns,
            records: vec![record],
        }
    }

    #[test]
    fn renders_the_documented_example_sheet() {
        let config = Config::default();
        let table = sample_table();
        let groups = group_by_client(&table);
        let today = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();

        let document = OfferWorkbookBuilder::new(&config, today).build(&table, &groups);
        let sheet = document.sheet("1001").expect("sheet named from client id");

        // status column is the third display column, green on white
        assert_eq!(sheet.text(2, 2), "获得CAS/COE");
        let status = sheet.style(2, 2).unwrap();
        assert_eq!(status.fill, Some(GREEN));
        assert_eq!(status.font_color, Some(WHITE));
        assert!(status.bold);

        // countdown lands in the last column: 12 days, red on white
        let countdown_col = sheet.row_width(1) - 1;
        assert_eq!(sheet.number(2, countdown_col), Some(12.0));
        let countdown = sheet.style(2, countdown_col).unwrap();
        assert_eq!(countdown.fill, Some(RED));
        assert_eq!(countdown.font_color, Some(WHITE));
    }

    #[test]
    fn name_row_links_to_the_crm_pages() {
        let config = Config::default();
        let table = sample_table();
        let groups = group_by_client(&table);
        let today = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();

        let document = OfferWorkbookBuilder::new(&config, today).build(&table, &groups);
        let sheet = document.sheet("1001").unwrap();

        assert_eq!(sheet.text(0, 0), "张三");
        match sheet.value(0, 0).unwrap() {
            CellValue::Link { url, .. } => {
                assert_eq!(url, "http://crmuk.ukec.com/admin/school-apply/detail?id=1001")
            }
            other => panic!("expected a link cell, got {:?}", other),
        }
        assert_eq!(sheet.text(0, EMAIL_COLUMN), "邮箱");

        // header row carries the countdown column with the light fill
        assert_eq!(sheet.text(1, 4), COUNTDOWN_HEADER);
        assert_eq!(sheet.style(1, 4).unwrap().fill, Some(HEADER_GRAY));
    }

    #[test]
    fn countdown_tier_boundaries_are_exact() {
        assert_eq!(countdown_style(31), None);
        assert_eq!(countdown_style(30).unwrap().fill, Some(RED));
        assert_eq!(countdown_style(1).unwrap().fill, Some(RED));
        assert_eq!(countdown_style(0).unwrap().fill, Some(GRAY));
        assert_eq!(countdown_style(-1).unwrap().fill, Some(GRAY));
    }

    #[test]
    fn status_styles_follow_the_fixed_rules() {
        assert_eq!(status_style("获得CO").unwrap().fill, Some(GREEN));
        assert_eq!(status_style("学生放弃").unwrap().fill, Some(GRAY));
        assert_eq!(status_style("已递交").unwrap().fill, Some(AMBER));
        assert_eq!(status_style("已递交-申请费待付").unwrap().fill, Some(TEAL));
        assert_eq!(status_style("未递-材料缺失或需修改").unwrap().fill, Some(SALMON));
        assert_eq!(status_style("随便什么"), None);
    }

    #[test]
    fn missing_deadline_leaves_the_countdown_cell_empty() {
        let config = Config::default();
        let mut table = sample_table();
        table.records[0].deposit_deadline = None;
        let groups = group_by_client(&table);
        let today = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();

        let document = OfferWorkbookBuilder::new(&config, today).build(&table, &groups);
        let sheet = document.sheet("1001").unwrap();
        let countdown_col = sheet.row_width(1) - 1;
        assert_eq!(sheet.value(2, countdown_col), None);
    }
}
