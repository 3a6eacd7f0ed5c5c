use std::fmt;

use serde::Serialize;

const SCHEME: &str = "ark:";

/// An ARK identifier split into its authority number, name and qualifier path.
///
/// `ark:/12148/btv1b8449691v/f29` (legacy) and `ark:12148/btv1b8449691v/f29` (modern) parse to
/// the same segments; only `legacy` tells them apart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ark<'a> {
    /// Name Assigning Authority Number, decimal digits only (e.g. "12148").
    naan: &'a str,
    /// Object name following the NAAN (e.g. "btv1b8449691v").
    name: &'a str,
    /// Remaining path segments, in order (e.g. ["f29"]).
    qualifier: Vec<&'a str>,
    /// Whether the input had a `/` right after the `ark:` marker.
    legacy: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not an ARK, expected `ark:` scheme marker: {0:?}")]
    InvalidScheme(String),
    #[error("invalid Name Assigning Authority Number {0:?}, expected decimal digits")]
    InvalidAuthority(String),
    #[error("ARK has no name after the authority number: {0:?}")]
    MissingName(String),
}

impl ParseError {
    /// Stable, machine-readable tag for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::InvalidScheme(_) => "invalid_scheme",
            ParseError::InvalidAuthority(_) => "invalid_authority",
            ParseError::MissingName(_) => "missing_name",
        }
    }
}

impl<'a> Ark<'a> {
    /// Parse a request path such as `/ark:/12148/btv1b8449691v/f29`.
    ///
    /// A single leading `/` (the HTTP path root) is ignored. Empty segments are skipped, so
    /// `ark:12148//name` is accepted.
    pub fn parse(input: &'a str) -> Result<Self, ParseError> {
        let s = input.strip_prefix('/').unwrap_or(input);
        let Some(rest) = s.strip_prefix(SCHEME) else {
            return Err(ParseError::InvalidScheme(input.to_string()));
        };

        // At most one separator belongs to the marker; anything further is collapsed below.
        let (rest, legacy) = match rest.strip_prefix('/') {
            Some(rest) => (rest, true),
            None => (rest, false),
        };

        let mut segments = rest.split('/').filter(|seg| !seg.is_empty());

        let naan = segments
            .next()
            .ok_or_else(|| ParseError::MissingName(input.to_string()))?;
        if !naan.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidAuthority(naan.to_string()));
        }

        let name = segments
            .next()
            .ok_or_else(|| ParseError::MissingName(input.to_string()))?;

        Ok(Ark {
            naan,
            name,
            qualifier: segments.collect(),
            legacy,
        })
    }

    pub fn naan(&self) -> &'a str {
        self.naan
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn qualifier(&self) -> &[&'a str] {
        &self.qualifier
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// NAAN, name and qualifier segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &'a str> + '_ {
        [self.naan, self.name]
            .into_iter()
            .chain(self.qualifier.iter().copied())
    }

    /// `name[/qualifier...]`, i.e. everything after the NAAN.
    pub fn path(&self) -> String {
        let mut path = self.name.to_string();
        for q in &self.qualifier {
            path.push('/');
            path.push_str(q);
        }
        path
    }

    /// `NAAN/name[/qualifier...]`, the part substituted into resolver targets.
    pub fn content(&self) -> String {
        format!("{}/{}", self.naan, self.path())
    }
}

impl<'a> TryFrom<&'a str> for Ark<'a> {
    type Error = ParseError;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        Ark::parse(value)
    }
}

/// Always the modern form, whatever the input looked like.
impl fmt::Display for Ark<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}", self.content())
    }
}
