//! Notification message templates
//!
//! Placeholders: `{object}`, `{confidence}` (0.82), `{confidence_pct}` (82%),
//! `{channel}`. Unknown placeholders are kept as written. A `{` followed by
//! another `{` before any `}` is literal text.

use crate::error::{Error, Result};

pub const DEFAULT_TEMPLATE: &str = "{object} detected ({confidence_pct})";

/// Values available to a template
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub object: &'a str,
    pub confidence: f64,
    pub channel: &'a str,
}

impl TemplateContext<'_> {
    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "object" => Some(self.object.to_string()),
            "confidence" => Some(format!("{:.2}", self.confidence)),
            "confidence_pct" => Some(format!("{}%", (self.confidence * 100.0).round() as i64)),
            "channel" => Some(self.channel.to_string()),
            _ => None,
        }
    }
}

/// Render a template. A blank template uses `DEFAULT_TEMPLATE`.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let template = if template.trim().is_empty() {
        DEFAULT_TEMPLATE
    } else {
        template
    };

    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let end = after.find(|c: char| c == '{' || c == '}').ok_or_else(|| {
            Error::Template(format!(
                "unclosed placeholder at byte {}",
                template.len() - rest.len() + open
            ))
        })?;

        // Another `{` before the close: this one is literal text
        if after[end..].starts_with('{') {
            out.push('{');
            out.push_str(&after[..end]);
            rest = &after[end..];
            continue;
        }

        let name = &after[..end];
        match ctx.resolve(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
