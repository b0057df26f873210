//! Audit report export.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;

use crate::error::{ConfigError, SandboxError};
use crate::security::audit::SecurityEvent;

pub const CSV_HEADER: &str = "ID,Timestamp,Type,Severity,Category,SandboxID,Description,Action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
    Html,
}

impl FromStr for ReportFormat {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "html" => Ok(ReportFormat::Html),
            other => Err(ConfigError::ValidationError(format!("unknown report format '{}'", other)).into()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    generated_at: String,
    sandbox_id: Option<&'a str>,
    total_events: usize,
    by_type: BTreeMap<String, usize>,
    by_severity: BTreeMap<String, usize>,
    events: &'a [SecurityEvent],
}

/// Render `events` in `format`. `sandbox_id` only labels the report.
pub fn export(events: &[SecurityEvent], sandbox_id: Option<&str>, format: ReportFormat) -> Result<String, SandboxError> {
    match format {
        ReportFormat::Json => {
            let mut by_type = BTreeMap::new();
            let mut by_severity = BTreeMap::new();
            for event in events {
                *by_type.entry(event.event_type.to_string()).or_insert(0) += 1;
                *by_severity.entry(event.severity.to_string()).or_insert(0) += 1;
            }
            let report = JsonReport {
                generated_at: Utc::now().to_rfc3339(),
                sandbox_id,
                total_events: events.len(),
                by_type,
                by_severity,
                events,
            };
            Ok(serde_json::to_string_pretty(&report)?)
        }
        ReportFormat::Csv => Ok(to_csv(events)),
        ReportFormat::Html => Ok(to_html(events, sandbox_id)),
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn to_csv(events: &[SecurityEvent]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for e in events {
        let row = [
            e.id.clone(),
            e.timestamp.to_rfc3339(),
            e.event_type.to_string(),
            e.severity.to_string(),
            e.category.clone(),
            e.sandbox_id.clone(),
            e.description.clone(),
            e.action.to_string(),
        ];
        let row: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn to_html(events: &[SecurityEvent], sandbox_id: Option<&str>) -> String {
    let title = match sandbox_id {
        Some(id) => format!("Security Audit Report: {}", html_escape(id)),
        None => "Security Audit Report".to_string(),
    };

    let mut rows = String::new();
    for e in events {
        rows.push_str(&format!(
            "<tr class=\"{sev}\"><td>{}</td><td>{}</td><td>{}</td><td>{sev}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            html_escape(&e.id),
            e.timestamp.to_rfc3339(),
            e.event_type,
            html_escape(&e.category),
            html_escape(&e.sandbox_id),
            html_escape(&e.description),
            e.action,
            sev = e.severity,
        ));
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n<style>\n\
         table {{ border-collapse: collapse; }}\n\
         td, th {{ border: 1px solid #ccc; padding: 4px 8px; }}\n\
         tr.high td {{ background: #fde2e1; }}\n\
         tr.critical td {{ background: #f8b4b0; }}\n\
         </style>\n</head>\n<body>\n<h1>{title}</h1>\n<p>Generated {generated}. {count} events.</p>\n\
         <table>\n<tr><th>ID</th><th>Timestamp</th><th>Type</th><th>Severity</th><th>Category</th>\
         <th>Sandbox</th><th>Description</th><th>Action</th></tr>\n{rows}</table>\n</body>\n</html>\n",
        title = title,
        generated = Utc::now().to_rfc3339(),
        count = events.len(),
        rows = rows,
    )
}
