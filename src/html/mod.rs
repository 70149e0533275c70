pub mod links;
pub mod prefilter;

/// True when an href points at something that looks like a zip archive.
pub(crate) fn is_archive_href(href: &str) -> bool {
    href.to_lowercase().contains(".zip")
}
