//! Template table loading.
//!
//! The file is a YAML list of entries; file order is scan order:
//!
//! ```yaml
//! - prompt: "Xin chào"
//!   response: "Xin chào! Tôi có thể giúp gì cho chuyến đi của bạn?"
//! - prompt: "opening hours"
//!   response: "Most attractions open from 8:00 to 17:00."
//! ```

use std::path::Path;

use tracing::info;

use super::{TemplateEntry, TemplateTable};
use crate::config::ConfigError;

/// Built-in `(prompt, response)` pairs, in scan order.
pub const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "Xin chào",
        "Xin chào! Tôi là trợ lý du lịch. Bạn muốn khám phá địa điểm nào hôm nay?",
    ),
    (
        "Chào bạn",
        "Chào bạn! Bạn cần gợi ý điểm đến, ẩm thực hay lịch trình?",
    ),
    (
        "Hello",
        "Hello! I'm your travel assistant. Where would you like to go today?",
    ),
    (
        "Cảm ơn",
        "Không có gì! Chúc bạn có một chuyến đi thật vui.",
    ),
    (
        "Thank you",
        "You're welcome! Have a great trip.",
    ),
    (
        "Tạm biệt",
        "Tạm biệt! Hẹn gặp lại bạn.",
    ),
    (
        "Goodbye",
        "Goodbye! Safe travels.",
    ),
];

/// Load a template table from a YAML file.
///
/// # Errors
/// - [`ConfigError::TemplateFileNotFound`] if the path does not exist
/// - [`ConfigError::EmptyTemplateFile`] if the file has no entries
/// - [`ConfigError::ParseError`] on invalid YAML
/// - [`ConfigError::EmptyTemplatePrompt`] if a prompt normalizes to nothing
pub fn load_templates(path: &Path) -> Result<TemplateTable, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::TemplateFileNotFound {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let table = parse_templates(&contents)?;

    info!(
        path = %path.display(),
        entries = table.len(),
        "Loaded template table"
    );
    Ok(table)
}

/// Parse a template table from YAML text.
pub fn parse_templates(contents: &str) -> Result<TemplateTable, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyTemplateFile);
    }

    let entries: Vec<TemplateEntry> = serde_saphyr::from_str(contents)?;
    if entries.is_empty() {
        return Err(ConfigError::EmptyTemplateFile);
    }

    TemplateTable::from_entries(entries)
}
