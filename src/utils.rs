use std::time::Duration;

pub struct Utils {}

impl Utils {
    /// SQL identifiers accepted by a plan: `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn is_valid_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    /// Quote an identifier that has already passed `is_valid_identifier`.
    pub fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    pub fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: f64 = 1024.0;
        const MB: f64 = KB * 1024.0;
        const GB: f64 = MB * 1024.0;

        let b = bytes as f64;
        if b >= GB {
            format!("{:.2} GB", b / GB)
        } else if b >= MB {
            format!("{:.2} MB", b / MB)
        } else {
            format!("{:.2} KB", b / KB)
        }
    }

    pub fn format_elapsed(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        if secs >= 60 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs >= 1 {
            format!("{}.{:01}s", secs, elapsed.subsec_millis() / 100)
        } else {
            format!("{}ms", elapsed.as_millis())
        }
    }
}
