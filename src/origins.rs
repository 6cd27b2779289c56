use std::collections::HashSet;

/// Allow-list of WebSocket origins accepted at handshake.
///
/// Matching is exact-string. An empty registry allows every origin, which
/// makes origin checking opt-in.
#[derive(Debug, Clone, Default)]
pub struct OriginRegistry {
    origins: HashSet<String>,
}

impl OriginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an origin to the allow-list.
    pub fn add_origin(&mut self, origin: impl Into<String>) {
        self.origins.insert(origin.into());
    }

    /// Check whether a handshake presenting `origin` may proceed. A missing
    /// header is only acceptable when the registry is empty.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.origins.is_empty() {
            return true;
        }
        origin.is_some_and(|origin| self.origins.contains(origin))
    }

    /// Number of registered origins.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// True if no origins are registered.
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for OriginRegistry {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            origins: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_registry_allows_everything() {
        let registry = OriginRegistry::new();
        assert!(registry.is_allowed(Some("https://evil.example")));
        assert!(registry.is_allowed(None));
    }

    #[test]
    fn exact_match_only() {
        let mut registry = OriginRegistry::new();
        registry.add_origin("https://app.example");

        assert!(registry.is_allowed(Some("https://app.example")));
        assert!(!registry.is_allowed(Some("https://app.example/")));
        assert!(!registry.is_allowed(Some("http://app.example")));
        assert!(!registry.is_allowed(None));
    }
}
