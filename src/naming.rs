use chrono::NaiveDateTime;

/// Reduces a department name to filesystem-safe characters: CJK
/// ideographs, ASCII letters and digits, parentheses, hyphen and
/// underscore survive; everything else becomes an underscore, and
/// leading/trailing underscores are trimmed. The result can be empty;
/// callers substitute their unnamed-department placeholder.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let keep = matches!(ch, '\u{4e00}'..='\u{9fa5}')
            || ch.is_ascii_alphanumeric()
            || matches!(ch, '(' | ')' | '-' | '_');
        out.push(if keep { ch } else { '_' });
    }
    out.trim_matches('_').to_string()
}

pub(crate) fn timestamp_tag(at: NaiveDateTime) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) fn output_filename(
    prefix: &str,
    department: &str,
    at: NaiveDateTime,
    extension: &str,
) -> String {
    format!("{prefix}_{department}_{}.{extension}", timestamp_tag(at))
}

pub(crate) fn archive_filename(prefix: &str, batch_tag: &str, at: NaiveDateTime) -> String {
    format!("{prefix}_{batch_tag}_{}.zip", timestamp_tag(at))
}
