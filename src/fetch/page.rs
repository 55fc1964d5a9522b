//! Fetched pages

use scraper::Html;
use url::Url;

/// A successfully fetched page, tagged with the URL it came from
///
/// The body is kept as text so pages can cross task boundaries; call
/// [`Page::html`] in the consuming task to get the parsed document.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: Url,
    pub status: u16,
    pub body: String,
}

impl Page {
    /// Wraps a response body
    ///
    /// # Arguments
    ///
    /// * `url` - The URL that was requested
    /// * `status` - HTTP status code of the response
    /// * `body` - Decoded response text
    pub fn new(url: Url, status: u16, body: impl Into<String>) -> Self {
        Self {
            url,
            status,
            body: body.into(),
        }
    }

    /// Parses the body as an HTML (or XML-ish) document
    pub fn html(&self) -> Html {
        Html::parse_document(&self.body)
    }

    /// Resolves a possibly relative link against this page's URL
    pub fn resolve(&self, href: &str) -> Option<Url> {
        self.url.join(href).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Selector;

    #[test]
    fn test_page_html() {
        let page = Page::new(
            Url::parse("https://example.com/a/b").unwrap(),
            200,
            "<html><head><title>Hi</title></head></html>",
        );
        let document = page.html();
        let title = Selector::parse("title").unwrap();
        let text: String = document.select(&title).next().unwrap().text().collect();
        assert_eq!(text, "Hi");
    }

    #[test]
    fn test_page_resolve() {
        let page = Page::new(Url::parse("https://example.com/a/b").unwrap(), 200, "");
        assert_eq!(
            page.resolve("/users/foo").unwrap().as_str(),
            "https://example.com/users/foo"
        );
        assert_eq!(page.resolve("c").unwrap().as_str(), "https://example.com/a/c");
    }
}
