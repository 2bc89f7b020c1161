//! Subject naming scheme.
//!
//! Pure constructors mapping `(session, request?, direction)` tuples onto
//! broker subjects. Three families:
//!
//! - `mcp.{session}.{request}.inbound` / `...outbound`: request-scoped
//! - `mcp.{session}.bg.outbound`: server-initiated messages to the client
//! - `mcp.{session}.bg.inbound`: server-initiated requests addressed to
//!   the client
//!
//! The `bg` infix keeps the session-scoped family disjoint from the
//! request-scoped one, so subjects never collide across families. Session
//! and request ids are escaped so that subject-syntax characters inside an
//! id cannot break injectivity.

use std::fmt;

/// A concrete subject (no wildcards).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

/// A subject pattern, possibly containing `*` (exactly one segment) or a
/// trailing `>` (one or more remaining segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern(String);

/// Escape subject-syntax characters inside an id segment.
///
/// `%` must be escaped first so the mapping stays injective.
fn escape_segment(raw: &str) -> String {
    raw.replace('%', "%25")
        .replace('.', "%2E")
        .replace('*', "%2A")
        .replace('>', "%3E")
}

/// Escape a request-id segment.
///
/// On top of [`escape_segment`], the literal `bg` is rewritten: that
/// segment value is reserved for the session-scoped family, and a request
/// id spelled exactly "bg" would otherwise collide with it. The rewrite
/// stays injective because plain escaping can never produce `%62g` (every
/// `%` in an input is itself escaped to `%25`).
fn escape_request_segment(raw: &str) -> String {
    if raw == "bg" {
        "%62g".to_string()
    } else {
        escape_segment(raw)
    }
}

impl Topic {
    /// Request-scoped subject for messages travelling client → server.
    pub fn request_inbound(session: &str, request: &str) -> Self {
        Self(format!(
            "mcp.{}.{}.inbound",
            escape_segment(session),
            escape_request_segment(request)
        ))
    }

    /// Request-scoped subject for messages travelling server → client.
    pub fn request_outbound(session: &str, request: &str) -> Self {
        Self(format!(
            "mcp.{}.{}.outbound",
            escape_segment(session),
            escape_request_segment(request)
        ))
    }

    /// Session-scoped subject for server-initiated notifications and
    /// responses addressed to the client.
    pub fn background_outbound(session: &str) -> Self {
        Self(format!("mcp.{}.bg.outbound", escape_segment(session)))
    }

    /// Session-scoped subject for server-initiated requests addressed to
    /// the client.
    pub fn background_inbound(session: &str) -> Self {
        Self(format!("mcp.{}.bg.inbound", escape_segment(session)))
    }

    /// The subject string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TopicPattern {
    /// Everything under a session, for debugging only.
    pub fn session_wildcard(session: &str) -> Self {
        Self(format!("mcp.{}.>", escape_segment(session)))
    }

    /// Build a pattern from a raw string. No validation beyond non-empty;
    /// backends may refuse wildcards they cannot implement.
    pub fn from_raw(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// The pattern string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the pattern contains wildcard tokens.
    pub fn has_wildcards(&self) -> bool {
        self.0.split('.').any(|seg| seg == "*" || seg == ">")
    }

    /// Match a concrete subject against this pattern.
    ///
    /// `*` matches exactly one segment; a trailing `>` matches one or more
    /// remaining segments. `>` anywhere else never matches.
    pub fn matches(&self, subject: &str) -> bool {
        let mut pattern_segs = self.0.split('.').peekable();
        let mut subject_segs = subject.split('.');

        loop {
            match (pattern_segs.next(), subject_segs.next()) {
                (Some(">"), Some(_)) => {
                    // Trailing rest-match; reject a non-final `>`
                    return pattern_segs.peek().is_none();
                }
                (Some("*"), Some(_)) => {}
                (Some(p), Some(s)) if p == s => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Topic> for TopicPattern {
    fn from(topic: Topic) -> Self {
        Self(topic.0)
    }
}

impl From<&Topic> for TopicPattern {
    fn from(topic: &Topic) -> Self {
        Self(topic.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_scoped_subjects() {
        assert_eq!(
            Topic::request_inbound("s1", "42").as_str(),
            "mcp.s1.42.inbound"
        );
        assert_eq!(
            Topic::request_outbound("s1", "42").as_str(),
            "mcp.s1.42.outbound"
        );
    }

    #[test]
    fn test_background_subjects() {
        assert_eq!(
            Topic::background_outbound("s1").as_str(),
            "mcp.s1.bg.outbound"
        );
        assert_eq!(Topic::background_inbound("s1").as_str(), "mcp.s1.bg.inbound");
    }

    #[test]
    fn test_families_never_collide() {
        // A request id spelled "bg" must not land in the background family
        let req = Topic::request_outbound("s1", "bg");
        let bg = Topic::background_outbound("s1");
        assert_ne!(req.as_str(), bg.as_str());
        assert_eq!(req.as_str(), "mcp.s1.%62g.outbound");
    }

    #[test]
    fn test_escaping_keeps_segment_count() {
        let topic = Topic::request_inbound("a.b", "x*y");
        assert_eq!(topic.as_str(), "mcp.a%2Eb.x%2Ay.inbound");
        assert_eq!(topic.as_str().split('.').count(), 4);
    }

    #[test]
    fn test_wildcard_matching() {
        let star = TopicPattern::from_raw("mcp.s1.*.outbound");
        assert!(star.matches("mcp.s1.42.outbound"));
        assert!(!star.matches("mcp.s1.outbound"));
        assert!(!star.matches("mcp.s2.42.outbound"));

        let rest = TopicPattern::session_wildcard("s1");
        assert!(rest.matches("mcp.s1.bg.outbound"));
        assert!(rest.matches("mcp.s1.42.inbound"));
        assert!(!rest.matches("mcp.s1"));
        assert!(!rest.matches("mcp.s2.bg.outbound"));
    }

    #[test]
    fn test_exact_pattern_from_topic() {
        let topic = Topic::request_outbound("s1", "1");
        let pattern = TopicPattern::from(&topic);
        assert!(!pattern.has_wildcards());
        assert!(pattern.matches(topic.as_str()));
        assert!(!pattern.matches("mcp.s1.2.outbound"));
    }

    proptest! {
        #[test]
        fn prop_subjects_injective(
            s1 in "[a-zA-Z0-9.*>%-]{1,16}",
            s2 in "[a-zA-Z0-9.*>%-]{1,16}",
            r1 in "[a-zA-Z0-9.*>%-]{1,16}",
            r2 in "[a-zA-Z0-9.*>%-]{1,16}",
        ) {
            let t1 = Topic::request_outbound(&s1, &r1);
            let t2 = Topic::request_outbound(&s2, &r2);
            if (s1.as_str(), r1.as_str()) != (s2.as_str(), r2.as_str()) {
                prop_assert_ne!(t1.as_str(), t2.as_str());
            } else {
                prop_assert_eq!(t1.as_str(), t2.as_str());
            }
        }

        #[test]
        fn prop_escaped_ids_always_four_segments(
            s in "[a-zA-Z0-9.*>%-]{1,16}",
            r in "[a-zA-Z0-9.*>%-]{1,16}",
        ) {
            let t = Topic::request_inbound(&s, &r);
            prop_assert_eq!(t.as_str().split('.').count(), 4);
        }
    }
}
