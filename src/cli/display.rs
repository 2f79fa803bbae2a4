//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::cache::CacheChange;
use crate::store::{ChangeEvent, KeyValue};
use crate::watch::ListedObject;

/// Longest value preview shown in tables and event lines
const VALUE_PREVIEW_LEN: usize = 60;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No keys found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    push_row(&mut output, headers.iter().map(|h| h.to_uppercase()), &widths);
    for row in rows {
        push_row(&mut output, row.into_iter(), &widths);
    }
    output
}

fn push_row(output: &mut String, cells: impl Iterator<Item = String>, widths: &[usize]) {
    let cells: Vec<String> = cells.collect();
    let last = cells.len().saturating_sub(1);
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        // No padding on the last column
        if i < widths.len() && i < last {
            output.push_str(&format!("{:width$}", cell, width = widths[i]));
        } else {
            output.push_str(cell);
        }
    }
    output.push('\n');
}

/// Printable preview of a stored value
pub fn preview_value(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    let text = text.trim();
    if text.chars().count() <= VALUE_PREVIEW_LEN {
        return text.to_string();
    }
    let cut: String = text.chars().take(VALUE_PREVIEW_LEN - 3).collect();
    format!("{}...", cut)
}

// ============================================================================
// Keys
// ============================================================================

/// Format key-value rows for `get`
pub fn format_key_values(items: &[KeyValue]) -> String {
    let rows = items
        .iter()
        .map(|kv| {
            vec![
                kv.key.clone(),
                kv.mod_revision.to_string(),
                kv.version.to_string(),
                preview_value(&kv.value),
            ]
        })
        .collect();
    format_table(&["key", "revision", "version", "value"], rows)
}

/// Format a watch snapshot
pub fn format_listed(items: &[ListedObject]) -> String {
    let rows = items
        .iter()
        .map(|obj| {
            vec![
                obj.key.clone(),
                obj.version.to_string(),
                preview_value(&obj.value),
            ]
        })
        .collect();
    format_table(&["key", "version", "value"], rows)
}

// ============================================================================
// Events
// ============================================================================

/// One line per relayed change event
pub fn format_event(event: &ChangeEvent) -> String {
    format!(
        "{:<6} {} @{} {}",
        event.kind.to_string(),
        event.key,
        event.revision,
        preview_value(&event.value)
    )
}

/// One line per informer cache change
pub fn format_cache_change(change: &CacheChange<serde_json::Value>) -> String {
    match change {
        CacheChange::Upserted { key, object } => format!(
            "{:<8} {} @{} {}",
            "UPSERT",
            key,
            object.version,
            preview_value(object.value.to_string().as_bytes())
        ),
        CacheChange::Removed { key, last } => match last {
            Some(object) => format!("{:<8} {} (was @{})", "REMOVE", key, object.version),
            None => format!("{:<8} {}", "REMOVE", key),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VersionedObject;

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["key"], Vec::new()), "No keys found.\n");
    }

    #[test]
    fn test_format_key_values() {
        let items = vec![KeyValue {
            key: "/registry/pod/default/web".to_string(),
            value: br#"{"image":"nginx"}"#.to_vec(),
            create_revision: 1,
            mod_revision: 4,
            version: 2,
        }];

        let output = format_key_values(&items);
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("KEY"));
        assert!(lines[1].contains("/registry/pod/default/web"));
        assert!(lines[1].ends_with(r#"{"image":"nginx"}"#));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(200);
        let preview = preview_value(long.as_bytes());
        assert_eq!(preview.chars().count(), VALUE_PREVIEW_LEN);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_format_event() {
        let event = ChangeEvent::put("/registry/pod/default/web", b"{}".to_vec(), 7);
        assert_eq!(format_event(&event), "PUT    /registry/pod/default/web @7 {}");
    }

    #[test]
    fn test_format_cache_change() {
        let upsert = CacheChange::Upserted {
            key: "/k".to_string(),
            object: VersionedObject::new(3, serde_json::json!({"a": 1})),
        };
        assert_eq!(format_cache_change(&upsert), r#"UPSERT   /k @3 {"a":1}"#);

        let removed = CacheChange::Removed {
            key: "/k".to_string(),
            last: None,
        };
        assert_eq!(format_cache_change(&removed), "REMOVE   /k");
    }
}
