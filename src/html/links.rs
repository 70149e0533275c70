use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

use super::is_archive_href;
use crate::error::{Error, Result};

/// Opening `<a ...>` tags only. Quoted attribute values may contain `>`.
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s(?:[^>"']|"[^"]*"|'[^']*')*>"#).expect("valid regex")
});

/// One attribute: name, then an optional double-quoted, single-quoted or bare value.
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([^\s=/>"']+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("valid regex")
});

/// Rewrite relative archive hrefs to absolute URLs against `base_url`.
///
/// Only the href value of matching anchors changes; every other byte of the
/// document is returned as-is, so running it twice gives the same output.
pub fn resolve(base_url: &str, html: &str) -> Result<String> {
    if html.trim().is_empty() {
        return Err(Error::Parse("html is empty".into()));
    }
    if base_url.trim().is_empty() {
        return Err(Error::Parse("base url is empty".into()));
    }
    let base = Url::parse(base_url.trim())
        .map_err(|e| Error::Parse(format!("parse base url {}: {}", base_url, e)))?;

    let rewritten = ANCHOR_RE.replace_all(html, |tag: &Captures| rewrite_anchor(&tag[0], &base));
    Ok(rewritten.into_owned())
}

fn rewrite_anchor(tag: &str, base: &Url) -> String {
    // Skip "<a". The first href attribute wins, as in browsers.
    const NAME_LEN: usize = 2;
    let value = ATTR_RE
        .captures_iter(&tag[NAME_LEN..])
        .find(|caps| caps[1].eq_ignore_ascii_case("href"))
        .and_then(|caps| caps.get(2).or(caps.get(3)).or(caps.get(4)));

    let Some(value) = value else {
        return tag.to_string();
    };
    match absolutize(value.as_str(), base) {
        Some(abs) => format!(
            "{}{}{}",
            &tag[..value.start() + NAME_LEN],
            abs,
            &tag[value.end() + NAME_LEN..]
        ),
        None => tag.to_string(),
    }
}

fn absolutize(href: &str, base: &Url) -> Option<String> {
    if !is_archive_href(href) {
        return None;
    }
    let href = href.trim();
    match Url::parse(href) {
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => base.join(href).ok().map(String::from),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.example.eu/market/auctions/";

    #[test]
    fn relative_zip_link_becomes_absolute() {
        let html = r#"<p><a class="dl" href="files/GO_2024-2025.zip">Results</a></p>"#;
        let out = resolve(BASE, html).unwrap();
        assert_eq!(
            out,
            r#"<p><a class="dl" href="https://www.example.eu/market/auctions/files/GO_2024-2025.zip">Results</a></p>"#
        );
    }

    #[test]
    fn root_relative_and_single_quoted() {
        let html = "<a href='/media/Results.ZIP'>x</a>";
        let out = resolve(BASE, html).unwrap();
        assert_eq!(out, "<a href='https://www.example.eu/media/Results.ZIP'>x</a>");
    }

    #[test]
    fn non_archive_and_absolute_links_untouched() {
        let html = r#"<a href="/about">About</a><a href="https://cdn.example.eu/a.zip">A</a>"#;
        assert_eq!(resolve(BASE, html).unwrap(), html);
    }

    #[test]
    fn resolving_twice_is_stable() {
        let html = r#"<table><tr><td><a href="../r/2025.zip">2025</a></td></tr></table>"#;
        let once = resolve(BASE, html).unwrap();
        let twice = resolve(BASE, &once).unwrap();
        assert_eq!(once, twice);
        assert!(once.contains("https://www.example.eu/market/r/2025.zip"));
    }

    #[test]
    fn other_tags_with_href_are_left_alone() {
        let html = r#"<link href="style.zip.css"><abbr title="x">y</abbr>"#;
        assert_eq!(resolve(BASE, html).unwrap(), html);
    }

    #[test]
    fn data_attributes_do_not_shadow_href() {
        let html = r#"<a data-href="files/a.zip" href="files/a.zip">A</a>"#;
        assert_eq!(
            resolve("https://x.eu/p/", html).unwrap(),
            r#"<a data-href="files/a.zip" href="https://x.eu/p/files/a.zip">A</a>"#
        );
    }

    #[test]
    fn quoted_angle_bracket_inside_the_tag() {
        let html = r#"<a title="2024 > 2023" href="files/a.zip">A</a>"#;
        assert_eq!(
            resolve("https://x.eu/p/", html).unwrap(),
            r#"<a title="2024 > 2023" href="https://x.eu/p/files/a.zip">A</a>"#
        );
    }

    #[test]
    fn href_inside_another_attribute_value_is_ignored() {
        let html = r#"<a title='see href=old.zip' HREF=files/a.zip>A</a>"#;
        assert_eq!(
            resolve("https://x.eu/p/", html).unwrap(),
            r#"<a title='see href=old.zip' HREF=https://x.eu/p/files/a.zip>A</a>"#
        );
    }

    #[test]
    fn empty_inputs_fail() {
        assert!(matches!(resolve(BASE, "   "), Err(Error::Parse(_))));
        assert!(matches!(resolve("", "<a href='a.zip'>a</a>"), Err(Error::Parse(_))));
        assert!(matches!(resolve("not a url", "<a href='a.zip'>a</a>"), Err(Error::Parse(_))));
    }
}
