//! Markdown listing of the index.

use chrono::{DateTime, Utc};

use crate::models::SymbolSummary;
use crate::store::index::IndexStore;

pub const LISTING_TITLE: &str = "# 🧠 逻辑索引 (Logic Index)";

fn flow_suffix(summary: &SymbolSummary) -> String {
    match (&summary.source_tag, &summary.sink_tag) {
        (None, None) => String::new(),
        (Some(source), None) => format!(" (source: {source})"),
        (None, Some(sink)) => format!(" (sink: {sink})"),
        (Some(source), Some(sink)) => format!(" (source: {source}; sink: {sink})"),
    }
}

/// Render every file with at least one summary, in path order, symbols in
/// line order. Output depends only on the store contents and `updated_at`.
pub fn render_logic_tree(store: &IndexStore, updated_at: DateTime<Utc>) -> String {
    let mut lines = vec![
        LISTING_TITLE.to_string(),
        format!("> Last Updated: {}\n", updated_at.format("%Y-%m-%d %H:%M:%S")),
    ];

    for (path, record) in store.entries() {
        if record.summaries.is_empty() {
            continue;
        }
        lines.push(format!("## 📄 `{path}`"));
        for summary in record.summaries_in_order() {
            lines.push(format!(
                "- **[{}]** `{}`: {}{}",
                summary.kind.icon(),
                summary.signature,
                summary.summary,
                flow_suffix(summary)
            ));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}
