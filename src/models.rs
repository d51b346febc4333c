use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The generated workbook name is baked into the cross-reference links, so it
/// is a constant rather than configuration.
pub const OFFER_WORKBOOK_NAME: &str = "Offer 跟进.xlsx";
pub const TRACKING_WORKBOOK_NAME: &str = "申请跟进.xlsx";

pub const ID_COLUMN: &str = "客户id";
pub const NAME_COLUMN: &str = "姓名";
pub const SCHOOL_COLUMN: &str = "申请院校英文";
pub const PROGRAM_COLUMN: &str = "申请专业英文";
pub const STATUS_COLUMN: &str = "申请结果";
pub const DEADLINE_COLUMN: &str = "押金截止日期";

/// Columns retained from the flat export. The first two identify the client
/// and never appear on the generated sheets.
pub const COLUMNS_TO_KEEP: [&str; 15] = [
    "客户id",
    "姓名",
    "申请院校英文",
    "申请专业英文",
    "申请结果",
    "Student-Number",
    "入学条件",
    "是否完成语言条件",
    "语言条件",
    "是否完成推荐信条件",
    "推荐信条件",
    "押金类型",
    "押金截止日期",
    "是否完成押金条件",
    "成押金条件",
];

pub const UNKNOWN_NAME: &str = "未知姓名";
pub const NOT_OBTAINED: &str = "未获得";

/// Excel's hard per-cell character limit.
const MAX_CELL_LEN: usize = 32767;
const MAX_SHEET_NAME_LEN: usize = 31;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub output_directory: String,
    pub archive_name: String,
    pub crm_apply_url: String,
    pub crm_email_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_directory: "output".to_string(),
            archive_name: "Offer跟进文件.zip".to_string(),
            crm_apply_url: "http://crmuk.ukec.com/admin/school-apply/detail?id=".to_string(),
            crm_email_url: "http://crmuk.ukec.com/admin/customer-email/detail?id=".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationRecord {
    pub client_id: i64,
    pub client_name: Option<String>,
    /// Cell values aligned with `ApplicationTable::columns`.
    pub values: Vec<String>,
    pub result_status: String,
    pub deposit_deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct ApplicationTable {
    /// Retained column names, in allow-list order.
    pub columns: Vec<String>,
    pub records: Vec<ApplicationRecord>,
}

impl ApplicationTable {
    /// Columns shown on the generated sheets (everything except the two
    /// identity columns).
    pub fn display_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.as_str())
            .filter(|c| *c != ID_COLUMN && *c != NAME_COLUMN)
            .collect()
    }

    /// A record's values for the display columns, in display order.
    pub fn display_values<'a>(&'a self, record: &'a ApplicationRecord) -> Vec<&'a str> {
        self.columns
            .iter()
            .zip(&record.values)
            .filter(|(column, _)| column.as_str() != ID_COLUMN && column.as_str() != NAME_COLUMN)
            .map(|(_, value)| value.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClientGroup {
    pub client_id: i64,
    pub client_name: String,
    /// Records in resolved priority order.
    pub records: Vec<ApplicationRecord>,
}

/// Sort rank for an application result. Statuses outside the table sink last.
pub fn result_priority(status: &str) -> u32 {
    match status {
        "获得CAS/COE" => 1,
        "获得UO" => 2,
        "获得CO" => 3,
        "拒信" => 4,
        "大学撤销" => 5,
        _ => 6,
    }
}

/// Make a string safe for a workbook cell: ASCII parens, no line breaks, no
/// control characters, bounded length.
pub fn clean_cell_text(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '（' => '(',
            '）' => ')',
            '\n' | '\r' => ' ',
            other => other,
        })
        .filter(|c| *c as u32 >= 32)
        .collect();
    if cleaned.chars().count() > MAX_CELL_LEN {
        cleaned.chars().take(MAX_CELL_LEN).collect()
    } else {
        cleaned
    }
}

/// Sheet-name variant of the sanitizer: characters Excel rejects in sheet
/// names become underscores, then the result is capped at 31 characters.
pub fn clean_sheet_name(name: &str) -> String {
    let scrubbed = Regex::new(r"[\[\]:*?/\\]")
        .unwrap()
        .replace_all(name, "_")
        .into_owned();
    let cleaned = clean_cell_text(&scrubbed);
    cleaned.chars().take(MAX_SHEET_NAME_LEN).collect()
}

/// Render a hyperlink as the formula the workbooks round-trip through.
pub fn hyperlink_formula(url: &str, label: &str) -> String {
    format!("=HYPERLINK(\"{}\", \"{}\")", url, label)
}

/// Recover a client id from a hyperlink formula cell. Returns the display
/// text when the value is `=HYPERLINK("url", "id")` and the id is an integer;
/// anything else comes back unchanged.
pub fn extract_id_from_hyperlink(value: &str) -> String {
    if value.starts_with("=HYPERLINK") {
        let parts: Vec<&str> = value.split('"').collect();
        if let Some(text) = parts.get(3) {
            if text.parse::<i64>().is_ok() {
                return (*text).to_string();
            }
        }
    }
    value.to_string()
}

/// Recover a display name from a hyperlink formula cell, or return the value
/// unchanged when it is not link-shaped.
pub fn extract_name_from_hyperlink(value: &str) -> String {
    if value.starts_with("=HYPERLINK") {
        let parts: Vec<&str> = value.split('"').collect();
        if parts.len() >= 2 {
            return parts[parts.len() - 2].to_string();
        }
    }
    value.to_string()
}

/// Parse a deposit deadline from the heterogeneous forms the export uses.
/// Date-time strings keep only their date part; unparseable input is None.
pub fn parse_deadline(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let date_part = if trimmed.contains(':') {
        trimmed.split_whitespace().next().unwrap_or(trimmed)
    } else {
        trimmed
    };
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
            return Some(date);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_cell_text_replaces_fullwidth_parens_and_breaks() {
        assert_eq!(clean_cell_text("（测试）"), "(测试)");
        assert_eq!(clean_cell_text("a\nb\rc"), "a b c");
    }

    #[test]
    fn clean_cell_text_drops_control_characters() {
        let cleaned = clean_cell_text("a\u{0}b\u{1f}c");
        assert_eq!(cleaned, "abc");
        assert!(cleaned.chars().all(|c| c as u32 >= 32));
    }

    #[test]
    fn clean_cell_text_bounds_length() {
        let long = "x".repeat(40000);
        assert_eq!(clean_cell_text(&long).chars().count(), 32767);
    }

    #[test]
    fn clean_cell_text_is_idempotent() {
        let inputs = ["（a）\nb\u{3}", "plain", "拒信"];
        for input in inputs {
            let once = clean_cell_text(input);
            assert_eq!(clean_cell_text(&once), once);
        }
    }

    #[test]
    fn clean_sheet_name_replaces_disallowed_characters() {
        assert_eq!(clean_sheet_name("A[B]:C*D?E/F\\G"), "A_B__C_D_E_F_G");
    }

    #[test]
    fn clean_sheet_name_caps_at_31_characters() {
        let long = "n".repeat(60);
        assert_eq!(clean_sheet_name(&long).chars().count(), 31);
    }

    #[test]
    fn extract_id_round_trips_the_builder_formula() {
        let formula = hyperlink_formula("[Offer 跟进.xlsx]1001!A1", "1001");
        assert_eq!(formula, "=HYPERLINK(\"[Offer 跟进.xlsx]1001!A1\", \"1001\")");
        assert_eq!(extract_id_from_hyperlink(&formula), "1001");
    }

    #[test]
    fn extract_id_leaves_non_links_and_non_numeric_ids_alone() {
        assert_eq!(extract_id_from_hyperlink("1001"), "1001");
        assert_eq!(extract_id_from_hyperlink("plain text"), "plain text");
        let named = hyperlink_formula("http://example.com", "张三");
        assert_eq!(extract_id_from_hyperlink(&named), named);
    }

    #[test]
    fn extract_name_reads_the_last_quoted_segment() {
        let formula = hyperlink_formula("http://crm/detail?id=7", "张三");
        assert_eq!(extract_name_from_hyperlink(&formula), "张三");
        assert_eq!(extract_name_from_hyperlink("张三"), "张三");
    }

    #[test]
    fn result_priority_matches_the_fixed_table() {
        assert_eq!(result_priority("获得CAS/COE"), 1);
        assert_eq!(result_priority("获得UO"), 2);
        assert_eq!(result_priority("获得CO"), 3);
        assert_eq!(result_priority("拒信"), 4);
        assert_eq!(result_priority("大学撤销"), 5);
        assert_eq!(result_priority("已递交"), 6);
        assert_eq!(result_priority(""), 6);
    }

    #[test]
    fn parse_deadline_handles_date_and_datetime_forms() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(parse_deadline("2024-06-01"), Some(expected));
        assert_eq!(parse_deadline("2024/06/01"), Some(expected));
        assert_eq!(parse_deadline("2024-06-01 00:00:00"), Some(expected));
        assert_eq!(parse_deadline("not a date"), None);
        assert_eq!(parse_deadline(""), None);
    }

    #[test]
    fn display_columns_exclude_identity_columns() {
        let table = ApplicationTable {
            columns: vec![
                "客户id".to_string(),
                "姓名".to_string(),
                "申请院校英文".to_string(),
                "申请结果".to_string(),
            ],
            records: Vec::new(),
        };
        assert_eq!(table.display_columns(), vec!["申请院校英文", "申请结果"]);
    }
}
