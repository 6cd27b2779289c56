use crate::error::RegistrationError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A registered topic address, possibly parameterized.
///
/// Patterns are `/`-separated segments. A segment is either a literal, which
/// must match exactly, or a `{name}` placeholder, which matches any single
/// non-empty segment. `/room/{id}` matches `/room/5` but neither `/room/` nor
/// `/room/5/history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern string.
    pub fn parse(pattern: &str) -> Result<Self, RegistrationError> {
        let invalid = |reason| RegistrationError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let mut segments = Vec::new();
        for segment in pattern.split('/') {
            let open = segment.contains('{');
            let close = segment.contains('}');
            if !open && !close {
                segments.push(Segment::Literal(segment.to_owned()));
                continue;
            }

            let name = segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| invalid("placeholders must span a whole segment"))?;
            if name.is_empty() || name.contains(['{', '}']) {
                return Err(invalid("placeholder name is invalid"));
            }
            let duplicate = segments
                .iter()
                .any(|s| matches!(s, Segment::Param(existing) if existing == name));
            if duplicate {
                return Err(invalid("placeholder name is used twice"));
            }
            segments.push(Segment::Param(name.to_owned()));
        }

        Ok(Self {
            raw: pattern.to_owned(),
            segments,
        })
    }

    /// The pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the placeholders, in order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match a concrete URI, extracting placeholder values.
    pub fn matches(&self, uri: &str) -> Option<TopicParams> {
        let mut parts = uri.split('/');
        let mut params = Vec::new();

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => params.push((name.clone(), part.to_owned())),
            }
        }

        // the URI must not have more segments than the pattern
        if parts.next().is_some() {
            return None;
        }
        Some(TopicParams(params))
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Placeholder values extracted from a topic URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicParams(Vec<(String, String)>);

impl TopicParams {
    /// Get a placeholder value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if the pattern had no placeholders.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        let pattern = TopicPattern::parse("acme/lobby").unwrap();
        assert!(pattern.matches("acme/lobby").unwrap().is_empty());
        assert!(pattern.matches("acme/lobby/").is_none());
        assert!(pattern.matches("acme").is_none());
        assert!(pattern.matches("acme/Lobby").is_none());
    }

    #[test]
    fn placeholders_capture_single_segments() {
        let pattern = TopicPattern::parse("/room/{id}/user/{user}").unwrap();
        assert_eq!(pattern.param_names().collect::<Vec<_>>(), ["id", "user"]);

        let params = pattern.matches("/room/5/user/alice").unwrap();
        assert_eq!(params.get("id"), Some("5"));
        assert_eq!(params.get("user"), Some("alice"));
        assert_eq!(params.get("missing"), None);

        assert!(pattern.matches("/room//user/alice").is_none());
        assert!(pattern.matches("/room/5/user").is_none());
        assert!(pattern.matches("/room/5/user/alice/x").is_none());
    }

    #[test]
    fn rejects_invalid_patterns() {
        for bad in ["", "/room/{}", "/room/x{id}", "/room/{id", "/{a}/{a}", "/{a{b}}"] {
            assert!(
                matches!(
                    TopicPattern::parse(bad),
                    Err(RegistrationError::InvalidPattern { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }
}
