use crate::interface::Mapping;
use uuid::Uuid;

/// One segment of a compiled endpoint template.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `%{param}` placeholder, matches any single path segment.
    Param,
}

/// Compiled matcher from concrete paths to endpoint ids.
///
/// Endpoint templates like `/rooms/%{room}/temp` are compiled to segment
/// sequences once, when the interface is loaded. Resolution is a linear walk
/// over the compiled endpoints; interfaces are small (tens of endpoints) so
/// there is no need for a real automaton state table.
#[derive(Clone, Debug, Default)]
pub struct EndpointsAutomaton {
    endpoints: Vec<(Vec<Segment>, Uuid)>,
}

/// Outcome of resolving a published path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedPath {
    /// The path matches exactly one full endpoint.
    Exact(Uuid),
    /// The path is a strict prefix of these endpoints (object aggregation
    /// publishes on the prefix one level above its leaves).
    Guessed(Vec<Uuid>),
    NotFound,
}

impl EndpointsAutomaton {
    pub fn from_mappings(mappings: &[Mapping]) -> Self {
        let endpoints = mappings
            .iter()
            .map(|m| (compile(&m.endpoint), m.endpoint_id))
            .collect();
        EndpointsAutomaton { endpoints }
    }

    /// Resolve a concrete path such as `/rooms/kitchen/temp`.
    pub fn resolve(&self, path: &str) -> ResolvedPath {
        let tokens: Vec<&str> = split_path(path);

        for (segments, endpoint_id) in &self.endpoints {
            if segments.len() == tokens.len() && matches_all(segments, &tokens) {
                return ResolvedPath::Exact(*endpoint_id);
            }
        }

        let guessed: Vec<Uuid> = self
            .endpoints
            .iter()
            .filter(|(segments, _)| {
                segments.len() > tokens.len() && matches_all(&segments[..tokens.len()], &tokens)
            })
            .map(|(_, endpoint_id)| *endpoint_id)
            .collect();

        if guessed.is_empty() {
            ResolvedPath::NotFound
        } else {
            ResolvedPath::Guessed(guessed)
        }
    }

    /// Match a compiled trigger path (where `""` is a single-segment
    /// wildcard) against the endpoint templates, returning the endpoint it
    /// designates.
    pub fn match_endpoint(&self, tokens: &[String]) -> Option<Uuid> {
        self.endpoints
            .iter()
            .find(|(segments, _)| {
                segments.len() == tokens.len()
                    && segments.iter().zip(tokens).all(|(segment, token)| {
                        token.is_empty()
                            || match segment {
                                Segment::Literal(lit) => lit == token,
                                Segment::Param => true,
                            }
                    })
            })
            .map(|(_, endpoint_id)| *endpoint_id)
    }

    /// Number of segments of the endpoint behind `endpoint_id`, if known.
    pub fn endpoint_depth(&self, endpoint_id: Uuid) -> Option<usize> {
        self.endpoints
            .iter()
            .find(|(_, id)| *id == endpoint_id)
            .map(|(segments, _)| segments.len())
    }
}

fn compile(endpoint: &str) -> Vec<Segment> {
    split_path(endpoint)
        .into_iter()
        .map(|segment| {
            if segment.starts_with("%{") && segment.ends_with('}') {
                Segment::Param
            } else {
                Segment::Literal(segment.to_string())
            }
        })
        .collect()
}

fn split_path(path: &str) -> Vec<&str> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn matches_all(segments: &[Segment], tokens: &[&str]) -> bool {
    segments.iter().zip(tokens).all(|(segment, token)| match segment {
        Segment::Literal(lit) => lit == token,
        Segment::Param => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use crate::interface::{MappingValueType, Reliability, Retention};

    fn mapping(endpoint: &str) -> Mapping {
        Mapping {
            endpoint_id: ids::endpoint_id("org.test.Iface", 1, endpoint),
            interface_id: ids::interface_id("org.test.Iface", 1),
            endpoint: endpoint.to_string(),
            value_type: MappingValueType::Double,
            reliability: Reliability::Unreliable,
            retention: Retention::Discard,
            allow_unset: false,
            explicit_timestamp: false,
        }
    }

    #[test]
    fn exact_match_with_params() {
        let mappings = vec![mapping("/rooms/%{room}/temp"), mapping("/rooms/%{room}/hum")];
        let automaton = EndpointsAutomaton::from_mappings(&mappings);
        assert_eq!(
            automaton.resolve("/rooms/kitchen/temp"),
            ResolvedPath::Exact(mappings[0].endpoint_id)
        );
    }

    #[test]
    fn prefix_resolves_to_guessed_endpoints() {
        let mappings = vec![mapping("/sensors/%{id}/temp"), mapping("/sensors/%{id}/hum")];
        let automaton = EndpointsAutomaton::from_mappings(&mappings);
        match automaton.resolve("/sensors/42") {
            ResolvedPath::Guessed(ids) => assert_eq!(ids.len(), 2),
            other => panic!("expected guessed endpoints, got {other:?}"),
        }
    }

    #[test]
    fn unknown_path_is_not_found() {
        let automaton = EndpointsAutomaton::from_mappings(&[mapping("/a/b")]);
        assert_eq!(automaton.resolve("/c/d"), ResolvedPath::NotFound);
    }

    #[test]
    fn endpoint_depth_reports_segment_count() {
        let m = mapping("/sensors/%{id}/temp");
        let automaton = EndpointsAutomaton::from_mappings(&[m.clone()]);
        assert_eq!(automaton.endpoint_depth(m.endpoint_id), Some(3));
    }
}
