use crate::{
    error::RegistrationError,
    topic::{TopicHandler, TopicParams, TopicPattern},
};
use std::{fmt, sync::Arc};

/// A pattern bound to its handler.
#[derive(Clone)]
pub(crate) struct TopicRoute {
    pub(crate) pattern: TopicPattern,
    pub(crate) handler: Arc<dyn TopicHandler>,
}

impl fmt::Debug for TopicRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRoute")
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

/// Ordered list of topic patterns. Resolution is first match wins, in
/// registration order.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    routes: Vec<TopicRoute>,
}

impl TopicRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: impl TopicHandler,
    ) -> Result<(), RegistrationError> {
        self.register_arc(pattern, Arc::new(handler))
    }

    /// Register a shared handler for a pattern.
    pub fn register_arc(
        &mut self,
        pattern: &str,
        handler: Arc<dyn TopicHandler>,
    ) -> Result<(), RegistrationError> {
        let pattern = TopicPattern::parse(pattern)?;
        self.routes.push(TopicRoute { pattern, handler });
        Ok(())
    }

    /// Resolve a URI to the index of the first matching route.
    pub(crate) fn resolve(&self, uri: &str) -> Option<(usize, TopicParams)> {
        self.routes
            .iter()
            .enumerate()
            .find_map(|(idx, route)| route.pattern.matches(uri).map(|params| (idx, params)))
    }

    pub(crate) fn route(&self, idx: usize) -> &TopicRoute {
        &self.routes[idx]
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if no pattern is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topic::PassThrough;

    #[test]
    fn first_match_wins() {
        let mut registry = TopicRegistry::new();
        registry.register("/room/lobby", PassThrough).unwrap();
        registry.register("/room/{id}", PassThrough).unwrap();
        registry.register("/room/{other}", PassThrough).unwrap();

        let (idx, params) = registry.resolve("/room/lobby").unwrap();
        assert_eq!(idx, 0);
        assert!(params.is_empty());

        let (idx, params) = registry.resolve("/room/5").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(params.get("id"), Some("5"));

        assert!(registry.resolve("/hall/5").is_none());
    }

    #[test]
    fn invalid_patterns_are_not_registered() {
        let mut registry = TopicRegistry::new();
        assert!(registry.register("/room/{", PassThrough).is_err());
        assert!(registry.is_empty());
    }
}
