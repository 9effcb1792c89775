use crate::diagnostic::Diagnostic;

/// Render the comment text for a diagnostic.
///
/// The output is part of the dedup key, so it depends on nothing but the
/// diagnostic itself.
pub fn comment_body(d: &Diagnostic) -> String {
    let mut body = String::new();

    if let Some(tool) = d.source.as_deref().filter(|s| !s.trim().is_empty()) {
        body.push_str(&format!("**[{}]** ", tool.trim()));
    }
    let label = d.severity.label();
    if !label.is_empty() {
        body.push_str(&format!("`{}` ", label));
    }
    body.push_str(d.message.trim_end());

    if let Some(code) = &d.code {
        body.push_str("\n\n");
        match code.url.as_deref() {
            Some(url) => body.push_str(&format!("Rule: [{}]({})", code.value, url)),
            None => body.push_str(&format!("Rule: `{}`", code.value)),
        }
    }

    // A replacement that doesn't end on the anchor line would be applied to
    // the wrong lines.
    if let Some(s) = d.suggestion.as_ref().filter(|s| s.applies_at(d.line)) {
        let text = s.text.trim_end_matches('\n');
        let fence = fence_for(text);
        body.push_str("\n\n");
        body.push_str(&fence);
        body.push_str("suggestion\n");
        if !text.is_empty() {
            body.push_str(text);
            body.push('\n');
        }
        body.push_str(&fence);
    }

    body
}

/// A backtick fence longer than any run inside `text`
fn fence_for(text: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for ch in text.chars() {
        if ch == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}
