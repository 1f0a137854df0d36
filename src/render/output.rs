//! Post-processing of converter output.

use url::Url;

use super::Diagnostic;

/// Token the converter is asked to emit into the document head when a base URI is known.
///
/// It is passed through `--metadata=header-includes:…`, so a converter that echoes metadata
/// verbatim gives [`transform`] a deterministic anchor for the `<base>` tag.
pub const BASE_TAG_PLACEHOLDER: &str = "{{pandoc-preview-base-tag}}";

/// Turns raw converter output into display-ready HTML.
///
/// When `base` is present, the first occurrence of [`BASE_TAG_PLACEHOLDER`] is replaced with a
/// `<base>` tag pointing at it. If the converter dropped or mangled the placeholder there is
/// nothing to replace and the output is returned as is.
pub fn transform(raw: &[u8], base: Option<&Url>) -> String {
    let html = String::from_utf8_lossy(raw);

    match base {
        Some(base) => html.replacen(
            BASE_TAG_PLACEHOLDER,
            &format!(r#"<base href="{}">"#, base),
            1,
        ),
        None => html.into_owned(),
    }
}

/// Renders a diagnostic as a small HTML error page.
pub fn render_error(diagnostic: &Diagnostic) -> String {
    format!(
        "<p>Error executing pandoc:</p>\n<pre>{}</pre>\n",
        escape_html(&diagnostic.to_string())
    )
}

/// Escapes the five HTML-significant characters.
///
/// Ampersands go first so the entities introduced for the other characters are not escaped a
/// second time.
pub fn escape_html(unsafe_text: &str) -> String {
    unsafe_text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}
