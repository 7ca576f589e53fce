//! Sitemap XML parser.
//!
//! Handles both `<urlset>` documents (leaf `<url>` entries) and
//! `<sitemapindex>` documents (nested `<sitemap>` entries). A document may
//! mix both; each `<loc>` is attributed to its nearest enclosing entry.

use catalogsync_shared::{CatalogError, Result, SitemapEntry};
use quick_xml::Reader;
use quick_xml::events::Event;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Entries of one parsed sitemap document, in document order.
#[derive(Debug, Clone, Default)]
pub struct ParsedSitemap {
    /// Leaf `<url>` entries.
    pub urls: Vec<SitemapEntry>,
    /// Nested `<sitemap>` entries.
    pub sitemaps: Vec<SitemapEntry>,
}

#[derive(Clone, Copy, PartialEq)]
enum EntryKind {
    Url,
    Sitemap,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Loc,
    LastMod,
}

/// Accumulates the `<loc>` / `<lastmod>` text of the entry being parsed.
struct PendingEntry {
    kind: EntryKind,
    loc: String,
    lastmod: String,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Strip newlines and surrounding whitespace from a `<loc>`/`<lastmod>` value.
pub fn cleanup(raw: &str) -> String {
    raw.replace(['\n', '\r'], "").trim().to_string()
}

/// Parse a sitemap document.
pub fn parse_sitemap(xml: &str) -> Result<ParsedSitemap> {
    let mut reader = Reader::from_str(xml);
    let mut parsed = ParsedSitemap::default();
    let mut pending: Option<PendingEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => {
                    pending = Some(PendingEntry::new(EntryKind::Url));
                }
                b"sitemap" => {
                    pending = Some(PendingEntry::new(EntryKind::Sitemap));
                }
                b"loc" if pending.is_some() => field = Some(Field::Loc),
                b"lastmod" if pending.is_some() => field = Some(Field::LastMod),
                _ => field = None,
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"url" | b"sitemap" => {
                    if let Some(entry) = pending.take() {
                        entry.finish(&mut parsed);
                    }
                    field = None;
                }
                _ => field = None,
            },
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some(f)) = (pending.as_mut(), field) {
                    let text = t
                        .unescape()
                        .map_err(|e| CatalogError::parse(format!("invalid XML text: {e}")))?;
                    entry.push(f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some(f)) = (pending.as_mut(), field) {
                    entry.push(f, &String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CatalogError::parse(format!(
                    "XML parse error at position {}: {e}",
                    reader.error_position()
                )));
            }
            _ => {}
        }
    }

    Ok(parsed)
}

impl PendingEntry {
    fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            loc: String::new(),
            lastmod: String::new(),
        }
    }

    fn push(&mut self, field: Field, text: &str) {
        match field {
            Field::Loc => self.loc.push_str(text),
            Field::LastMod => self.lastmod.push_str(text),
        }
    }

    fn finish(self, parsed: &mut ParsedSitemap) {
        let url = cleanup(&self.loc);
        if url.is_empty() {
            return;
        }
        let lastmod = cleanup(&self.lastmod);
        let entry = SitemapEntry {
            url,
            last_modified: (!lastmod.is_empty()).then_some(lastmod),
            is_sitemap_index: self.kind == EntryKind::Sitemap,
        };
        match self.kind {
            EntryKind::Url => parsed.urls.push(entry),
            EntryKind::Sitemap => parsed.sitemaps.push(entry),
        }
    }
}
