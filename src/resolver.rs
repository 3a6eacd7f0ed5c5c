use std::collections::HashMap;

use once_cell::sync::Lazy;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use regex::Regex;
use serde::{Serialize, Serializer, ser::SerializeMap};
use tracing::debug;
use url::Url;

use crate::{
    identifier::Ark,
    registry::{NaanRecord, Target},
};

/// Placeholder that registry targets end with; the ARK content replaces it.
pub const CONTENT_PLACEHOLDER: &str = "${content}";

/// Characters that would end or restructure a path segment if left as is.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// `what` keys: a NAAN with an optional shoulder. Some registry copies spell them as ARKs.
static WHAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:ark:/?)?(?P<naan>\d+)(?:/(?P<shoulder>.*))?$").unwrap());

#[derive(Clone, Debug)]
struct Entry {
    /// Normalised key, `NAAN[/shoulder]`.
    what: String,
    naan: String,
    shoulder: String,
    target: Target,
}

/// Maps NAANs and shoulders to their resolution targets.
///
/// Entries are kept longest-`what` first so the first hit is always the most specific one.
#[derive(Clone, Debug, Default)]
pub struct ResolverMap {
    entries: Vec<Entry>,
}

/// A successful lookup and the redirect it produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub what: String,
    pub target: Target,
    pub location: Url,
    /// Redirect status to answer with.
    pub status: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no NAAN registry entry matches {0}")]
    NoMatch(String),
    #[error("ARK {0} contains a `.` or `..` segment")]
    DotSegment(String),
    #[error("registry target {url:?} for {what} does not form a valid URL: {source}")]
    InvalidTarget {
        what: String,
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::NoMatch(_) => "no_match",
            ResolveError::DotSegment(_) => "dot_segment",
            ResolveError::InvalidTarget { .. } => "invalid_target",
        }
    }
}

impl ResolverMap {
    pub fn from_records(records: &[NaanRecord]) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(records.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in records {
            let Some(caps) = WHAT_RE.captures(record.what.trim()) else {
                debug!(what = %record.what, "Ignoring registry record with unusable `what`");
                continue;
            };
            let naan = caps["naan"].to_string();
            let shoulder = caps
                .name("shoulder")
                .map(|m| m.as_str().trim_end_matches('/'))
                .unwrap_or_default()
                .to_string();
            let what = if shoulder.is_empty() {
                naan.clone()
            } else {
                format!("{naan}/{shoulder}")
            };

            // Later records for the same key override earlier ones.
            if let Some(&i) = index.get(&what) {
                entries[i].target = record.target.clone();
                continue;
            }
            index.insert(what.clone(), entries.len());
            entries.push(Entry {
                what,
                naan,
                shoulder,
                target: record.target.clone(),
            });
        }

        // Stable, so equally long keys keep registry order.
        entries.sort_by(|a, b| b.what.len().cmp(&a.what.len()));
        ResolverMap { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most specific `(what, target)` for `ark`.
    ///
    /// The NAAN has to match exactly; a shoulder only has to prefix the name.
    pub fn lookup(&self, ark: &Ark<'_>) -> Option<(&str, &Target)> {
        let path = ark.path();
        self.entries
            .iter()
            .find(|e| e.naan == ark.naan() && path.starts_with(&e.shoulder))
            .map(|e| (e.what.as_str(), &e.target))
    }

    pub fn resolve(&self, ark: &Ark<'_>) -> Result<Resolution, ResolveError> {
        // `Url` would collapse these and walk out of the target's path.
        if ark.segments().any(|seg| seg == "." || seg == "..") {
            return Err(ResolveError::DotSegment(ark.to_string()));
        }
        let (what, target) = self
            .lookup(ark)
            .ok_or_else(|| ResolveError::NoMatch(ark.to_string()))?;
        let location = redirect_url(&target.url, ark.segments()).map_err(|source| {
            ResolveError::InvalidTarget {
                what: what.to_string(),
                url: target.url.clone(),
                source,
            }
        })?;
        let status = if (300..400).contains(&target.http_code) {
            target.http_code
        } else {
            302
        };
        Ok(Resolution {
            what: what.to_string(),
            target: target.clone(),
            location,
            status,
        })
    }
}

/// Ordered `what -> target` object, most specific key first.
impl Serialize for ResolverMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for e in &self.entries {
            map.serialize_entry(&e.what, &e.target)?;
        }
        map.end()
    }
}

/// Join a registry target with the ARK content, dropping the trailing placeholder if present.
///
/// Each segment is percent-encoded, so a decoded `#`, `?` or `/` inside a name stays part of it.
pub fn redirect_url<'s>(
    target_url: &str,
    segments: impl IntoIterator<Item = &'s str>,
) -> Result<Url, url::ParseError> {
    let base = target_url
        .strip_suffix(CONTENT_PLACEHOLDER)
        .unwrap_or(target_url);
    let content = segments
        .into_iter()
        .map(|seg| utf8_percent_encode(seg, PATH_SEGMENT_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/");
    Url::parse(&format!("{base}{content}"))
}
