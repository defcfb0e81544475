//! `%(token)` substitution for presence text.
//!
//! Unknown tokens are copied through literally. Output is capped at
//! [`MAX_RENDERED_LEN`] bytes, cut on a character boundary.

use presence_protocol::clip;

pub const MAX_RENDERED_LEN: usize = presence_protocol::MAX_TEXT_LEN;

const TOKEN_OPEN: &str = "%(";

/// Values the format tokens resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatValues {
    pub file: String,
    pub extension: String,
    pub line: u64,
    pub column: u64,
    pub size_bytes: u64,
    pub line_count: u64,
    /// Display name as listed in the language table, e.g. `C++`.
    pub language: String,
    pub position: u64,
    pub workspace: String,
}

impl FormatValues {
    pub fn get(&self, token: &str) -> Option<String> {
        let value = match token {
            "file" => self.file.clone(),
            "extension" => self.extension.clone(),
            "line" => self.line.to_string(),
            "column" => self.column.to_string(),
            "size" => human_size(self.size_bytes),
            "line_count" => self.line_count.to_string(),
            "lang" => self.language.to_lowercase(),
            "Lang" => capitalize(&self.language),
            "LANG" => self.language.to_uppercase(),
            "position" => self.position.to_string(),
            "workspace" => self.workspace.clone(),
            _ => return None,
        };
        Some(value)
    }

    pub fn render(&self, format: &str) -> String {
        render(format, |token| self.get(token))
    }
}

pub fn render<F>(format: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(format.len().min(MAX_RENDERED_LEN));
    let mut rest = format;

    while let Some(start) = rest.find(TOKEN_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + TOKEN_OPEN.len()..];

        match after_open.find(')') {
            Some(end) => match lookup(&after_open[..end]) {
                Some(value) => {
                    out.push_str(&value);
                    rest = &after_open[end + 1..];
                }
                None => {
                    out.push_str(TOKEN_OPEN);
                    rest = after_open;
                }
            },
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }

        if out.len() >= MAX_RENDERED_LEN {
            return clip(&out);
        }
    }

    out.push_str(rest);
    clip(&out)
}

/// `1536` → `1.50 KB`. Three significant digits, truncated.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }

    let text = if value < 10.0 {
        format!("{:.2}", (value * 100.0).floor() / 100.0)
    } else if value < 100.0 {
        format!("{:.1}", (value * 10.0).floor() / 10.0)
    } else {
        format!("{:.0}", value.floor())
    };
    format!("{} {}", text, UNITS[unit])
}

fn capitalize(value: &str) -> String {
    let lower = value.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
