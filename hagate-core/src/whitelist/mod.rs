//! The whitelist aggregate and its owner.
//!
//! - [`Whitelist`]: plain data, the allowed endpoint templates and entity
//!   patterns. Unique by canonical string; order is not significant.
//! - [`WhitelistStore`]: the single writer. Wraps a `Whitelist` behind a lock,
//!   counts mutations and persists on request.
//! - [`WhitelistPersister`]: background task that flushes the store on a
//!   cadence and performs the final save on shutdown.
//! - [`file`]: YAML encoding and atomic file writes.

pub mod error;
pub mod file;
pub mod persister;
pub mod store;

pub use error::WhitelistError;
pub use file::WhitelistFile;
pub use persister::{PersistConfig, WhitelistPersister};
pub use store::WhitelistStore;

use tracing::warn;

use crate::pattern::{EndpointMatch, EndpointTemplate, EntityPattern, match_endpoint, match_entity};

/// Allowed endpoint templates and entity patterns.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    endpoints: Vec<EndpointTemplate>,
    entities: Vec<EntityPattern>,
}

impl Whitelist {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn endpoints(&self) -> &[EndpointTemplate] {
        &self.endpoints
    }

    #[must_use]
    pub fn entities(&self) -> &[EntityPattern] {
        &self.entities
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty() && self.entities.is_empty()
    }

    /// Match a request path against the endpoint templates.
    #[must_use]
    pub fn match_endpoint(&self, path: &str) -> Option<EndpointMatch> {
        match_endpoint(path, &self.endpoints)
    }

    #[must_use]
    pub fn contains_endpoint(&self, path: &str) -> bool {
        self.endpoints.iter().any(|t| t.matches(path))
    }

    #[must_use]
    pub fn contains_entity(&self, id: &str) -> bool {
        match_entity(id, &self.entities)
    }

    /// True iff every identifier matches some pattern. Vacuously true for an
    /// empty set.
    pub fn contains_entities<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.first_unmatched_entity(ids).is_none()
    }

    /// The first identifier with no matching pattern, if any.
    pub fn first_unmatched_entity<'a, I>(&self, ids: I) -> Option<&'a String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter().find(|id| !self.contains_entity(id))
    }

    /// Insert a template unless one with the same canonical string exists.
    /// Returns true if it was added.
    pub fn insert_endpoint(&mut self, template: EndpointTemplate) -> bool {
        if self.endpoints.contains(&template) {
            return false;
        }
        self.endpoints.push(template);
        true
    }

    /// Insert a pattern unless an identical one exists. Returns true if added.
    pub fn insert_entity(&mut self, pattern: EntityPattern) -> bool {
        if self.entities.contains(&pattern) {
            return false;
        }
        self.entities.push(pattern);
        true
    }

    /// Record an observed path: if no template matches, add the path itself as
    /// a new all-literal template. Placeholders are never inferred, and a
    /// path with a `{name}` segment is skipped because it could not be saved
    /// as a literal.
    ///
    /// Returns the template string added, if any.
    pub fn record_endpoint(&mut self, path: &str) -> Option<String> {
        if self.contains_endpoint(path) {
            return None;
        }
        let Some(template) = EndpointTemplate::literal(path) else {
            warn!(path = %path, "Not learning path with a placeholder-shaped segment");
            return None;
        };
        let added = template.as_str().to_string();
        self.insert_endpoint(template).then_some(added)
    }

    /// Record an observed identifier as an exact entry unless a pattern
    /// already covers it. Identifiers ending in `*` are skipped since they
    /// would be saved as wildcards. Returns true if it was added.
    pub fn record_entity(&mut self, id: &str) -> bool {
        if self.contains_entity(id) {
            return false;
        }
        let Some(pattern) = EntityPattern::exact(id) else {
            warn!(entity = %id, "Not learning identifier ending in '*'");
            return false;
        };
        self.insert_entity(pattern)
    }

    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

/// Set equality on both collections.
impl PartialEq for Whitelist {
    fn eq(&self, other: &Self) -> bool {
        self.endpoints.len() == other.endpoints.len()
            && self.entities.len() == other.entities.len()
            && self.endpoints.iter().all(|t| other.endpoints.contains(t))
            && self.entities.iter().all(|e| other.entities.contains(e))
    }
}

impl Eq for Whitelist {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_contains_entities_vacuous() {
        let w = Whitelist::new();
        assert!(w.contains_entities(&Vec::<String>::new()));
        assert!(!w.contains_entities(&ids(&["light.a"])));
    }

    #[test]
    fn test_first_unmatched_entity() {
        let mut w = Whitelist::new();
        w.insert_entity(EntityPattern::parse("light.*"));
        let requested = ids(&["light.a", "switch.b", "switch.c"]);
        assert_eq!(w.first_unmatched_entity(&requested).map(String::as_str), Some("switch.b"));
    }

    #[test]
    fn test_record_endpoint_is_idempotent() {
        let mut w = Whitelist::new();
        assert_eq!(w.record_endpoint("/api/config"), Some("/api/config".to_string()));
        assert_eq!(w.record_endpoint("/api/config"), None);
        assert_eq!(w.record_endpoint("/api/config/"), None);
        assert_eq!(w.endpoint_count(), 1);
    }

    #[test]
    fn test_record_endpoint_respects_existing_template() {
        let mut w = Whitelist::new();
        w.insert_endpoint(EndpointTemplate::parse("/api/states/{entity_id}"));
        assert_eq!(w.record_endpoint("/api/states/light.a"), None);
        assert_eq!(w.endpoint_count(), 1);
    }

    #[test]
    fn test_record_endpoint_never_infers_placeholders() {
        let mut w = Whitelist::new();
        w.record_endpoint("/api/states/light.a");
        w.record_endpoint("/api/states/light.b");
        assert_eq!(w.endpoint_count(), 2);
        assert!(!w.contains_endpoint("/api/states/light.c"));
    }

    #[test]
    fn test_record_endpoint_skips_placeholder_shaped_path() {
        let mut w = Whitelist::new();
        assert_eq!(w.record_endpoint("/api/states/{x}"), None);
        assert_eq!(w.endpoint_count(), 0);
        assert!(!w.contains_endpoint("/api/states/lock.front_door"));

        assert_eq!(w.record_endpoint("/api/x{y}"), Some("/api/x{y}".to_string()));
    }

    #[test]
    fn test_record_entity_skips_trailing_star() {
        let mut w = Whitelist::new();
        assert!(!w.record_entity("*"));
        assert!(!w.record_entity("light*"));
        assert_eq!(w.entity_count(), 0);
        assert!(!w.contains_entity("lock.front_door"));

        assert!(w.record_entity("light.*_lamp"));
        assert!(!w.contains_entity("light.desk_lamp"));
    }

    #[test]
    fn test_record_entity_respects_wildcard() {
        let mut w = Whitelist::new();
        w.insert_entity(EntityPattern::parse("light.*"));
        assert!(!w.record_entity("light.kitchen"));
        assert!(w.record_entity("switch.kitchen"));
        assert!(!w.record_entity("switch.kitchen"));
        assert_eq!(w.entity_count(), 2);
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let mut a = Whitelist::new();
        a.insert_endpoint("/a".into());
        a.insert_endpoint("/b".into());
        a.insert_entity("x.y".into());
        let mut b = Whitelist::new();
        b.insert_endpoint("/b".into());
        b.insert_endpoint("/a".into());
        b.insert_entity("x.y".into());
        assert_eq!(a, b);

        b.insert_entity("x.*".into());
        assert_ne!(a, b);
    }
}
