use html2text::render::text_renderer::TrivialDecorator;
use std::borrow::Cow;

/// Reading speed used for estimates.
pub const WORDS_PER_MINUTE: f64 = 200.0;

/// Estimated minutes needed to read `content`.
///
/// Markup is stripped before counting whitespace-separated words. Empty or
/// markup-only content reads in 0 minutes.
///
/// ```
/// use feedsync::util::estimate_reading_time;
///
/// assert_eq!(estimate_reading_time("<p>one two</p>"), 0.01);
/// assert_eq!(estimate_reading_time(""), 0.0);
/// ```
pub fn estimate_reading_time(content: &str) -> f64 {
    let words = strip_html(content).split_whitespace().count();
    words as f64 / WORDS_PER_MINUTE
}

/// Line width handed to the renderer; wide enough that wrapping never
/// splits a word.
const RENDER_WIDTH: usize = 1000;

/// Render `html` as plain text with `html2text`, dropping markup, link
/// footnotes and emphasis markers. Text without markup is returned as is.
pub fn strip_html(html: &str) -> Cow<'_, str> {
    if !html.contains('<') && !html.contains('&') {
        return Cow::Borrowed(html);
    }
    Cow::Owned(html2text::from_read_with_decorator(
        html.as_bytes(),
        RENDER_WIDTH,
        TrivialDecorator::new(),
    ))
}

/// Strip C0 control characters (except tab/newline) and DEL, so stored text
/// can be printed to a terminal safely.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let needs_strip = s
        .chars()
        .any(|c| c == '\u{7f}' || (c.is_control() && c != '\t' && c != '\n' && c.is_ascii()));
    if !needs_strip {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.chars()
            .filter(|&c| !(c == '\u{7f}' || (c.is_control() && c != '\t' && c != '\n' && c.is_ascii())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_borrowed() {
        assert!(matches!(strip_html("no markup here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_tags_split_words() {
        assert_eq!(
            strip_html("<p>Hello<br>world</p>").split_whitespace().collect::<Vec<_>>(),
            vec!["Hello", "world"]
        );
    }

    #[test]
    fn test_links_and_emphasis_add_no_words() {
        let html = r#"<p>Read <a href="https://example.com/more">the <em>full</em> story</a></p>"#;
        assert_eq!(
            strip_html(html).split_whitespace().collect::<Vec<_>>(),
            vec!["Read", "the", "full", "story"]
        );
    }

    #[test]
    fn test_comments_and_entities() {
        let html = "<p>a<!-- hidden words --> b &amp; c</p>";
        assert_eq!(
            strip_html(html).split_whitespace().collect::<Vec<_>>(),
            vec!["a", "b", "&", "c"]
        );
    }

    #[test]
    fn test_reading_time() {
        let body = "word ".repeat(400);
        assert_eq!(estimate_reading_time(&body), 2.0);
        assert_eq!(estimate_reading_time(&format!("<div>{body}</div>")), 2.0);
        assert_eq!(estimate_reading_time("<img src=x>"), 0.0);
    }

    #[test]
    fn test_strip_control_chars() {
        assert_eq!(strip_control_chars("tab\tok"), "tab\tok");
        assert_eq!(strip_control_chars("bell\x07\x1b[31mred\x7f"), "bell[31mred");
        assert!(matches!(strip_control_chars("clean"), Cow::Borrowed(_)));
    }
}
