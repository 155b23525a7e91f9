const MARKDOWN_BULLET: &str = "* ";
const DISPLAY_BULLET: &str = "• ";

/// Rewrites markdown `* ` list markers at line starts into `• `.
///
/// Only a marker at the very start of the text or right after a newline is
/// touched; indented markers and inline asterisks are left alone.
pub fn normalize_bullets(text: &str) -> String {
    let body = match text.strip_prefix(MARKDOWN_BULLET) {
        Some(rest) => format!("{DISPLAY_BULLET}{rest}"),
        None => text.to_string(),
    };
    body.replace("\n* ", "\n• ")
}

#[cfg(test)]
mod tests {
    use super::normalize_bullets;

    #[test]
    fn leading_marker_is_rewritten() {
        assert_eq!(normalize_bullets("* one"), "• one");
    }

    #[test]
    fn markers_after_newlines_are_rewritten() {
        assert_eq!(
            normalize_bullets("Lists:\n* one\n* two"),
            "Lists:\n• one\n• two"
        );
    }

    #[test]
    fn other_asterisks_are_untouched() {
        assert_eq!(normalize_bullets("a * b"), "a * b");
        assert_eq!(normalize_bullets("  * indented"), "  * indented");
        assert_eq!(normalize_bullets("*bold*"), "*bold*");
        assert_eq!(normalize_bullets("\n*x"), "\n*x");
    }

    #[test]
    fn empty_text_stays_empty() {
        assert_eq!(normalize_bullets(""), "");
    }
}
