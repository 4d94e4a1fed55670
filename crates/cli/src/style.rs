//! Terminal styling for command output.

use console::Style;

/// Green with a checkmark.
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Red with a cross.
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Direction label, e.g. `devel:tools → ./repo`.
pub fn direction(from: &str, to: &str) -> String {
    let style = Style::new().blue().bold();
    style.apply_to(format!("{} → {}", from, to)).to_string()
}
