//! Endpoint template and entity pattern matching.
//!
//! Two small closed grammars live here:
//!
//! - **Endpoint templates**: `/`-separated segments, each either a literal or a
//!   `{name}` placeholder that binds exactly one path segment.
//! - **Entity patterns**: either an exact identifier or a prefix wildcard
//!   written as `<prefix>*` (e.g. `light.*`).
//!
//! Everything in this module is pure; the whitelist store owns the sets these
//! functions are applied to.
//!
//! ## Canonical paths
//!
//! Before splitting, exactly one trailing `/` is removed (the root path `/` is
//! left alone). The same rule is applied to request paths, to templates loaded
//! from disk and to literals recorded in learn mode, so `/api/config/` and
//! `/api/config` always land on the same template. Empty segments produced by
//! `//` are kept as empty literals.
//!
//! A placeholder binds a segment of any value except the empty one, so
//! `/api/states/{entity_id}` does not match `/api/states//`.
//!
//! Stripping is applied once per read, so a template whose canonical string
//! still ends in `/` (written as `/a//`) is stored with the extra slash put
//! back; see [`EndpointTemplate::to_source`].

use std::collections::BTreeMap;
use std::fmt;

/// Placeholder bindings produced by a successful template match.
pub type Params = BTreeMap<String, String>;

/// Strip exactly one trailing `/` from `path`, leaving the root path intact.
#[must_use]
pub fn canonicalize_path(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

// ============================================================================
// Endpoint Templates
// ============================================================================

/// One segment of an endpoint template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Must equal the request segment exactly.
    Literal(String),
    /// Binds one non-empty request segment under the given name.
    Placeholder(String),
}

impl Segment {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) if !name.is_empty() => Segment::Placeholder(name.to_string()),
            _ => Segment::Literal(raw.to_string()),
        }
    }
}

/// A parsed endpoint template such as `/api/states/{entity_id}`.
///
/// Equality and hashing use the canonical template string, so two templates
/// that differ only by a trailing slash are the same entry.
#[derive(Debug, Clone)]
pub struct EndpointTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl EndpointTemplate {
    /// Parse a template string. Parsing never fails: anything that is not a
    /// well-formed `{name}` segment is a literal.
    #[must_use]
    pub fn parse(template: &str) -> Self {
        let raw = canonicalize_path(template).to_string();
        let segments = raw.split('/').map(Segment::parse).collect();
        Self { raw, segments }
    }

    /// Build a template from an observed path with every segment literal.
    ///
    /// Returns `None` if a segment is shaped like `{name}`: the whitelist file
    /// has no escape for braces, so such an entry would come back from disk as
    /// a placeholder matching a whole family of paths.
    #[must_use]
    pub fn literal(path: &str) -> Option<Self> {
        let raw = canonicalize_path(path).to_string();
        let mut segments = Vec::new();
        for part in raw.split('/') {
            match Segment::parse(part) {
                Segment::Literal(lit) => segments.push(Segment::Literal(lit)),
                Segment::Placeholder(_) => return None,
            }
        }
        Some(Self { raw, segments })
    }

    /// The canonical template string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The string that [`parse`](Self::parse) turns back into this template.
    ///
    /// Equal to [`as_str`](Self::as_str) unless the canonical string itself
    /// ends in `/`, in which case the slash removed by canonicalization is
    /// restored.
    #[must_use]
    pub fn to_source(&self) -> String {
        if self.raw.len() > 1 && self.raw.ends_with('/') {
            format!("{}/", self.raw)
        } else {
            self.raw.clone()
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true if the template has at least one placeholder.
    #[must_use]
    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }

    /// Match `path` against this template, returning the placeholder bindings.
    ///
    /// The segment counts must be equal. Literal segments compare by exact
    /// string equality; placeholders bind any non-empty segment.
    #[must_use]
    pub fn bind(&self, path: &str) -> Option<Params> {
        let mut parts = canonicalize_path(path).split('/');
        let mut params = Params::new();

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Placeholder(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), part.to_string());
                }
            }
        }

        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }

    /// Returns true if `path` matches this template.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.bind(path).is_some()
    }
}

impl PartialEq for EndpointTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for EndpointTemplate {}

impl std::hash::Hash for EndpointTemplate {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for EndpointTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for EndpointTemplate {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// The result of a successful [`match_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMatch {
    /// Canonical string of the template that matched.
    pub template: String,
    /// Placeholder bindings.
    pub params: Params,
}

impl EndpointMatch {
    /// Look up a bound placeholder by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Match `path` against `templates`, returning the first template that fits.
///
/// Templates are treated as a set: when several could match, any one is enough
/// to admit the path and the first one found supplies the bindings.
pub fn match_endpoint<'a, I>(path: &str, templates: I) -> Option<EndpointMatch>
where
    I: IntoIterator<Item = &'a EndpointTemplate>,
{
    templates.into_iter().find_map(|t| {
        t.bind(path).map(|params| EndpointMatch {
            template: t.raw.clone(),
            params,
        })
    })
}

// ============================================================================
// Entity Patterns
// ============================================================================

/// An entity allow-entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityPattern {
    /// Matches exactly this identifier.
    Exact(String),
    /// Matches any non-empty identifier starting with this prefix.
    Prefix(String),
}

impl EntityPattern {
    /// Parse an entry. A single trailing `*` makes it a prefix wildcard; a `*`
    /// anywhere else is an ordinary character.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => EntityPattern::Prefix(prefix.to_string()),
            None => EntityPattern::Exact(raw.to_string()),
        }
    }

    /// An exact entry for an observed identifier.
    ///
    /// Returns `None` for identifiers ending in `*`, which would be written
    /// out verbatim and read back as a prefix wildcard.
    #[must_use]
    pub fn exact(id: &str) -> Option<Self> {
        if id.ends_with('*') {
            return None;
        }
        Some(EntityPattern::Exact(id.to_string()))
    }

    /// Case-sensitive match with no normalization.
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        match self {
            EntityPattern::Exact(exact) => exact == id,
            EntityPattern::Prefix(prefix) => !id.is_empty() && id.starts_with(prefix.as_str()),
        }
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, EntityPattern::Prefix(_))
    }
}

impl fmt::Display for EntityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityPattern::Exact(exact) => f.write_str(exact),
            EntityPattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

impl From<&str> for EntityPattern {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

/// Returns true if `id` matches at least one of `patterns`.
pub fn match_entity<'a, I>(id: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = &'a EntityPattern>,
{
    patterns.into_iter().any(|p| p.matches(id))
}

// ============================================================================
// Tests
// ============================================================================
