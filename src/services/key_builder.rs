//! Keys for cached conversions, stored beside the original object.

use crate::services::file_converter::Style;

pub fn converted_folder_key(key: &str) -> String {
    format!("{key}-converted-cache/")
}

/// Key of the cached conversion for `key`, or `None` when no conversion is requested.
pub fn cached_key(key: &str, format: Option<&str>, style: Option<Style>) -> Option<String> {
    let suffix = match (format, style) {
        (None, None) => return None,
        (Some(format), None) => format!("format-{format}"),
        (None, Some(style)) => format!("style-{style}"),
        (Some(format), Some(style)) => format!("format-{format}-style-{style}"),
    };
    Some(format!("{}{suffix}", converted_folder_key(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_key() {
        assert_eq!(converted_folder_key("proj1/file1"), "proj1/file1-converted-cache/");
    }

    #[test]
    fn cached_keys() {
        assert_eq!(cached_key("p/f", None, None), None);
        assert_eq!(
            cached_key("p/f", Some("png"), None).as_deref(),
            Some("p/f-converted-cache/format-png")
        );
        assert_eq!(
            cached_key("p/f", None, Some(Style::Thumbnail)).as_deref(),
            Some("p/f-converted-cache/style-thumbnail")
        );
        assert_eq!(
            cached_key("p/f", Some("png"), Some(Style::Preview)).as_deref(),
            Some("p/f-converted-cache/format-png-style-preview")
        );
    }
}
