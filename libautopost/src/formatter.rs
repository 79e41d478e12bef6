//! Turning stored items into post text

use crate::queue::priority_for_content_type;
use crate::types::RawItem;

/// Maximum post length in characters
pub const MAX_POST_LENGTH: usize = 280;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPost {
    pub text: String,
    /// Local media file to attach. Remote image URLs are not downloaded, so
    /// the plain formatter never sets one.
    pub media_ref: Option<String>,
    pub content_type: String,
}

impl FormattedPost {
    pub fn priority(&self) -> i64 {
        priority_for_content_type(&self.content_type)
    }
}

/// Renders a raw item as post text.
///
/// Implementations return `None` instead of producing malformed text.
pub trait Formatter: Send + Sync {
    fn format(&self, item: &RawItem) -> Option<FormattedPost>;
}

/// `title`, a blank line, then `url`, trimmed to fit
#[derive(Debug, Clone)]
pub struct PlainFormatter {
    max_len: usize,
}

impl PlainFormatter {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new(MAX_POST_LENGTH)
    }
}

impl Formatter for PlainFormatter {
    fn format(&self, item: &RawItem) -> Option<FormattedPost> {
        let title = item.title.trim();
        if title.is_empty() {
            return None;
        }

        let url = item.url.trim();
        let text = if url.is_empty() {
            truncate_words(title, self.max_len)?
        } else {
            // the url is never cut; the title gives way
            let reserved = url.chars().count() + 2;
            let room = self.max_len.checked_sub(reserved)?;
            format!("{}\n\n{}", truncate_words(title, room)?, url)
        };

        Some(FormattedPost {
            text,
            media_ref: None,
            content_type: item.content_type.clone(),
        })
    }
}

/// Cut at the last word boundary that fits, adding an ellipsis
fn truncate_words(text: &str, max_len: usize) -> Option<String> {
    if text.chars().count() <= max_len {
        return Some(text.to_string());
    }

    let budget = max_len.checked_sub(1)?;
    let mut out = String::new();
    for word in text.split_whitespace() {
        let needed = if out.is_empty() { 0 } else { 1 } + word.chars().count();
        if out.chars().count() + needed > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }

    if out.is_empty() {
        return None;
    }
    out.push('…');
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewRawItem;

    fn item(title: &str, url: &str) -> RawItem {
        NewRawItem::new(1, "x", "rl", "patch_notes", 0)
            .with_title(title)
            .with_url(url)
            .into_stored(1)
    }

    #[test]
    fn test_title_and_url() {
        let post = PlainFormatter::default()
            .format(&item("Patch v2.41 is live", "https://rl.example/p"))
            .unwrap();
        assert_eq!(post.text, "Patch v2.41 is live\n\nhttps://rl.example/p");
        assert_eq!(post.content_type, "patch_notes");
        assert_eq!(post.priority(), 2);
        assert_eq!(post.media_ref, None);
    }

    #[test]
    fn test_empty_title_fails_closed() {
        assert!(PlainFormatter::default().format(&item("   ", "https://x.example")).is_none());
    }

    #[test]
    fn test_long_title_truncated_on_word_boundary() {
        let title = "word ".repeat(100);
        let post = PlainFormatter::default().format(&item(&title, "https://x.example/a")).unwrap();

        assert!(post.text.chars().count() <= MAX_POST_LENGTH);
        assert!(post.text.ends_with("…\n\nhttps://x.example/a"));
        assert!(!post.text.contains("wor…"));
    }

    #[test]
    fn test_url_longer_than_limit_fails_closed() {
        let url = format!("https://x.example/{}", "a".repeat(300));
        assert!(PlainFormatter::default().format(&item("Title", &url)).is_none());
    }

    #[test]
    fn test_remote_image_is_not_a_media_ref() {
        let mut raw = item("Shop", "");
        raw.image_url = "https://cdn.example/shop.png".to_string();
        let post = PlainFormatter::default().format(&raw).unwrap();
        assert_eq!(post.text, "Shop");
        assert_eq!(post.media_ref, None);
    }
}
