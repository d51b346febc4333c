use std::collections::HashMap;

use crate::models::{result_priority, ApplicationRecord, ApplicationTable, ClientGroup, UNKNOWN_NAME};

/// Partition the flat table into per-client groups, in first-appearance order
/// of the client id, each group ordered by the fixed status priority.
pub fn group_by_client(table: &ApplicationTable) -> Vec<ClientGroup> {
    let mut order: Vec<i64> = Vec::new();
    let mut grouped: HashMap<i64, Vec<ApplicationRecord>> = HashMap::new();

    for record in &table.records {
        if !grouped.contains_key(&record.client_id) {
            order.push(record.client_id);
        }
        grouped
            .entry(record.client_id)
            .or_insert_with(Vec::new)
            .push(record.clone());
    }

    let mut groups = Vec::new();
    for client_id in order {
        let mut records = grouped.remove(&client_id).unwrap_or_default();
        if records.is_empty() {
            continue;
        }

        // Stable sort: equal keys keep their source order.
        records.sort_by(|a, b| {
            (result_priority(&a.result_status), a.result_status.as_str())
                .cmp(&(result_priority(&b.result_status), b.result_status.as_str()))
        });

        let client_name = records
            .iter()
            .find_map(|record| record.client_name.clone())
            .unwrap_or_else(|| UNKNOWN_NAME.to_string());

        groups.push(ClientGroup {
            client_id,
            client_name,
            records,
        });
    }
    groups
}
