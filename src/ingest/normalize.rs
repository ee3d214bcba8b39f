// src/ingest/normalize.rs
//! Raw feed entry → [`ArticleDraft`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc2822, OffsetDateTime};
use url::Url;

use crate::ingest::dedup::title_key;
use crate::ingest::types::{ArticleDraft, RawEntry, SourceSpec};

pub const MAX_TITLE_CHARS: usize = 500;
pub const MAX_SUMMARY_CHARS: usize = 1500;

const TRACKING_PREFIXES: &[&str] = &["utm", "ga_"];
const TRACKING_EXACT: &[&str] = &[
    "tsrc", ".tsrc", "cmpid", "ncid", "ocid", "fbclid", "gclid", "mc_cid", "mc_eid",
];

static RE_BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)</?(?:p|br|div|li|ul|ol|tr|td|table|blockquote|h[1-6])\b[^>]*>")
        .expect("block tag regex")
});
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("entry has neither a usable link nor a title")]
    Unusable,
}

/// Clean feed text: entity decode, tag strip, quote folding, whitespace
/// collapse, length cap.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // entities may hide markup (`&lt;p&gt;`), so decode before stripping tags
    let decoded = html_escape::decode_html_entities(s);
    let spaced = RE_BLOCK_TAGS.replace_all(&decoded, " ");
    let stripped = RE_TAGS
        .replace_all(&spaced, "")
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");
    let out = RE_WS.replace_all(&stripped, " ");
    let out = out.trim();
    if out.chars().count() > max_chars {
        out.chars().take(max_chars).collect::<String>().trim_end().to_string()
    } else {
        out.to_string()
    }
}

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    TRACKING_EXACT.contains(&k.as_str()) || TRACKING_PREFIXES.iter().any(|p| k.starts_with(p))
}

/// Canonical form of a link, used as the exact-duplicate key.
///
/// Scheme and host are lower-cased and default ports dropped by the URL
/// parser; fragments, tracking parameters and non-root trailing slashes are
/// removed and the remaining query parameters sorted.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut u = match Url::parse(trimmed) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        _ => return trimmed.to_lowercase(),
    };
    u.set_fragment(None);

    let mut params: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, v)| !v.is_empty() && !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();
    if params.is_empty() {
        u.set_query(None);
    } else {
        u.query_pairs_mut().clear().extend_pairs(params.iter());
    }

    let path = u.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let t = path.trim_end_matches('/');
        u.set_path(if t.is_empty() { "/" } else { t });
    }
    u.to_string()
}

/// Parse a feed date. Offsets are honored; zone-less values are taken as UTC.
pub fn parse_published(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(s, &Rfc2822) {
        return DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond());
    }
    // chrono also accepts obsolete zone names (GMT, EST, ...) and missing seconds
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(n) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(n.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

fn is_http_url(s: &str) -> bool {
    Url::parse(s.trim())
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Stable key for entries that carry no usable link.
fn synthetic_key(source: &str, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let hex: String = digest.iter().take(12).map(|b| format!("{b:02x}")).collect();
    format!("urn:cef-newswire:{}:{}", source.to_ascii_lowercase(), hex)
}

/// Normalize one entry fetched from `spec` at `fetched_at`.
pub fn normalize_entry(
    entry: RawEntry,
    spec: &SourceSpec,
    fetched_at: DateTime<Utc>,
) -> Result<ArticleDraft, NormalizeError> {
    let title = entry
        .title
        .as_deref()
        .map(|t| normalize_text(t, MAX_TITLE_CHARS))
        .filter(|t| !t.is_empty());

    let link = entry
        .link
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .or_else(|| entry.guid.clone().filter(|g| is_http_url(g)));

    let (raw_url, canonical) = match (&link, &title) {
        (Some(l), _) => (l.clone(), canonical_url(l)),
        (None, Some(t)) => {
            let seed = entry.guid.as_deref().unwrap_or(t.as_str());
            let key = synthetic_key(&spec.id, seed);
            (key.clone(), key)
        }
        (None, None) => return Err(NormalizeError::Unusable),
    };
    let title = title.unwrap_or_else(|| normalize_text(&raw_url, MAX_TITLE_CHARS));

    let summary = entry
        .summary
        .as_deref()
        .map(|s| normalize_text(s, MAX_SUMMARY_CHARS))
        .filter(|s| !s.is_empty());

    let (published_at, published_at_estimated) =
        match entry.published.as_deref().and_then(parse_published) {
            Some(ts) => (ts, false),
            None => (fetched_at, true),
        };

    let provider = entry
        .origin
        .as_deref()
        .map(|o| normalize_text(o, 120))
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| spec.provider.clone());

    Ok(ArticleDraft {
        title_key: title_key(&title),
        title,
        canonical_url: canonical,
        raw_url,
        provider,
        source: spec.id.clone(),
        guid: entry
            .guid
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string),
        summary,
        published_at,
        published_at_estimated,
        fetched_at,
        context_symbols: spec.context_symbols.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::FeedFormat;
    use chrono::TimeZone;

    fn spec() -> SourceSpec {
        SourceSpec {
            id: "prn".into(),
            provider: "PR Newswire".into(),
            url: "https://example.com/rss".into(),
            format: FeedFormat::Rss,
            enabled: true,
            timeout_secs: None,
            context_symbols: vec![],
        }
    }

    #[test]
    fn normalize_text_strips_markup_and_collapses_ws() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b>&#8217;s “best”</p>  ";
        assert_eq!(normalize_text(s, 100), "Hello, world's \"best\"");
        assert_eq!(normalize_text("&lt;p&gt;escaped&lt;/p&gt;", 100), "escaped");
        assert_eq!(normalize_text("abcdef", 3), "abc");
    }

    #[test]
    fn tracking_params_and_formatting_collapse() {
        let a = canonical_url("http://a.com/n/123?utm=x");
        let b = canonical_url("http://a.com/n/123");
        assert_eq!(a, b);
        assert_eq!(
            canonical_url("HTTPS://WWW.Example.COM:443/News/1/?b=2&utm_source=rss&a=1&fbclid=z#top"),
            "https://www.example.com/News/1?a=1&b=2"
        );
        assert_eq!(canonical_url("https://example.com/"), "https://example.com/");
        assert_eq!(canonical_url("  Not A URL "), "not a url");
    }

    #[test]
    fn date_formats() {
        let want = Utc.with_ymd_and_hms(2026, 2, 27, 21, 30, 0).unwrap();
        assert_eq!(parse_published("Fri, 27 Feb 2026 21:30:00 +0000"), Some(want));
        assert_eq!(parse_published("Fri, 27 Feb 2026 21:30:00 GMT"), Some(want));
        assert_eq!(parse_published("Fri, 27 Feb 2026 16:30:00 EST"), Some(want));
        assert_eq!(parse_published("2026-02-27T21:30:00Z"), Some(want));
        assert_eq!(parse_published("2026-02-27T16:30:00-05:00"), Some(want));
        assert_eq!(parse_published("2026-02-27 21:30:00"), Some(want));
        assert_eq!(
            parse_published("2026-02-27"),
            Some(Utc.with_ymd_and_hms(2026, 2, 27, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_published("yesterday-ish"), None);
    }

    #[test]
    fn unparseable_date_is_estimated() {
        let fetched = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let d = normalize_entry(
            RawEntry {
                title: Some("GOF declares monthly distribution".into()),
                link: Some("https://a.com/n/1?utm_medium=x".into()),
                published: Some("not a date".into()),
                ..Default::default()
            },
            &spec(),
            fetched,
        )
        .unwrap();
        assert!(d.published_at_estimated);
        assert_eq!(d.published_at, fetched);
        assert_eq!(d.canonical_url, "https://a.com/n/1");
        assert_eq!(d.raw_url, "https://a.com/n/1?utm_medium=x");
        assert_eq!(d.provider, "PR Newswire");
    }

    #[test]
    fn missing_link_or_title_fallbacks() {
        let now = Utc::now();
        let by_guid = normalize_entry(
            RawEntry {
                title: Some("Title".into()),
                guid: Some("https://a.com/story/9".into()),
                ..Default::default()
            },
            &spec(),
            now,
        )
        .unwrap();
        assert_eq!(by_guid.canonical_url, "https://a.com/story/9");

        let synthetic = normalize_entry(
            RawEntry {
                title: Some("Title only".into()),
                guid: Some("opaque-42".into()),
                ..Default::default()
            },
            &spec(),
            now,
        )
        .unwrap();
        assert!(synthetic.canonical_url.starts_with("urn:cef-newswire:prn:"));

        let link_only = normalize_entry(
            RawEntry {
                link: Some("https://a.com/x".into()),
                origin: Some("Business Wire".into()),
                ..Default::default()
            },
            &spec(),
            now,
        )
        .unwrap();
        assert_eq!(link_only.title, "https://a.com/x");
        assert_eq!(link_only.provider, "Business Wire");

        let neither = normalize_entry(RawEntry::default(), &spec(), now);
        assert_eq!(neither, Err(NormalizeError::Unusable));
    }
}
