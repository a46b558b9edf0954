//! Route Matcher - decides which routes an event fans out to.
//!
//! A route applies to an event iff all three hold:
//!
//! 1. `route.when.source == event.source`
//! 2. `event.type ∈ route.when.events`
//! 3. every `route.when.filter` criterion holds against the event
//!
//! Matching is a pure set computation: every matching route fires, each as an
//! independent pipeline execution, with no priority or tie-break between them.
//!
//! # Filter criteria
//!
//! Filters are keyed by dot-path into the event's wire shape
//! (`payload.repo`, `provenance.author.kind`, ...).
//!
//! ```text
//! Criterion                     | Holds when
//! ------------------------------|------------------------------------------
//! "human"                       | value == "human", or array value contains it
//! "release-*"                   | string value matches the wildcard
//! { any = ["a", "b"] }          | value is one of the list (or array overlaps)
//! { pattern = "^v\\d+" }        | string value matches the regex
//! ```
//!
//! # Example
//!
//! ```toml
//! [[modules.routes]]
//! name = "human-issues"
//! transforms = ["dedup"]
//! [modules.routes.when]
//! source = "github"
//! events = ["issue", "pull_request"]
//! filter = { "provenance.author.kind" = "human", "payload.labels" = "bug" }
//! [modules.routes.then]
//! actor = "notify"
//! ```

use crate::config::ConfigError;
use crate::delivery::DeliverySettings;
use crate::event::{lookup_path, Event, EventType};
use crate::transform::TransformRef;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// One filter criterion as written in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FilterCriterion {
    Pattern { pattern: String },
    OneOf { any: Vec<Value> },
    Exact(Value),
}

/// The `when` block of a route.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MatchSpec {
    pub source: String,

    pub events: Vec<EventType>,

    #[serde(default)]
    pub filter: BTreeMap<String, FilterCriterion>,
}

/// The `then` block of a route: which actor receives surviving events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetSpec {
    pub actor: String,

    /// Merged over the actor's own config for every delivery on this route
    #[serde(default)]
    pub config: Value,

    /// Launch-context text passed to the actor
    #[serde(default)]
    pub context: Option<String>,
}

/// A route as declared in a module definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteDefinition {
    pub name: String,

    pub when: MatchSpec,

    #[serde(default)]
    pub transforms: Vec<TransformRef>,

    pub then: TargetSpec,

    #[serde(default)]
    pub advanced: DeliverySettings,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(Value),
    Wildcard(Regex),
    OneOf(Vec<Value>),
    Pattern(Regex),
}

impl Matcher {
    fn compile(path: &str, criterion: &FilterCriterion) -> Result<Self, ConfigError> {
        match criterion {
            FilterCriterion::Pattern { pattern } => Regex::new(pattern)
                .map(Matcher::Pattern)
                .map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "invalid pattern for filter '{}': {}",
                        path, e
                    ))
                }),
            FilterCriterion::OneOf { any } => Ok(Matcher::OneOf(any.clone())),
            FilterCriterion::Exact(Value::String(s)) if is_wildcard_pattern(s) => {
                wildcard_regex(s).map(Matcher::Wildcard).map_err(|e| {
                    ConfigError::ValidationError(format!(
                        "invalid wildcard for filter '{}': {}",
                        path, e
                    ))
                })
            }
            FilterCriterion::Exact(value) => Ok(Matcher::Exact(value.clone())),
        }
    }

    fn holds(&self, actual: &Value) -> bool {
        match self {
            Matcher::Exact(expected) => {
                actual == expected
                    || actual
                        .as_array()
                        .map(|items| items.contains(expected))
                        .unwrap_or(false)
            }
            Matcher::OneOf(options) => match actual {
                Value::Array(items) => items.iter().any(|item| options.contains(item)),
                other => options.contains(other),
            },
            Matcher::Wildcard(re) | Matcher::Pattern(re) => match actual {
                Value::Array(items) => items.iter().any(|item| scalar_matches(re, item)),
                other => scalar_matches(re, other),
            },
        }
    }
}

fn scalar_matches(re: &Regex, value: &Value) -> bool {
    match value {
        Value::String(s) => re.is_match(s),
        Value::Number(n) => re.is_match(&n.to_string()),
        Value::Bool(b) => re.is_match(&b.to_string()),
        _ => false,
    }
}

/// Check if a criterion string is a wildcard pattern (contains `*`).
fn is_wildcard_pattern(pattern: &str) -> bool {
    pattern.contains('*')
}

/// Compile a `*` wildcard into an anchored regex.
fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}

/// A compiled set of dot-path criteria; all must hold.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    criteria: Vec<(String, Matcher)>,
}

impl Filter {
    pub fn compile(raw: &BTreeMap<String, FilterCriterion>) -> Result<Self, ConfigError> {
        let criteria = raw
            .iter()
            .map(|(path, criterion)| Ok((path.clone(), Matcher::compile(path, criterion)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { criteria })
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Evaluate against an already-serialized event document.
    pub fn matches_document(&self, document: &Value) -> bool {
        self.criteria.iter().all(|(path, matcher)| {
            lookup_path(document, path)
                .map(|actual| matcher.holds(actual))
                .unwrap_or(false)
        })
    }

    pub fn matches(&self, event: &Event) -> bool {
        if self.is_empty() {
            return true;
        }
        match serde_json::to_value(event) {
            Ok(document) => self.matches_document(&document),
            Err(_) => false,
        }
    }
}

/// A validated, ready-to-match route.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub source: String,
    pub events: HashSet<EventType>,
    filter: Filter,
    pub transforms: Vec<TransformRef>,
    pub target: TargetSpec,
    pub settings: DeliverySettings,
}

impl Route {
    pub fn compile(definition: &RouteDefinition) -> Result<Self, ConfigError> {
        if definition.when.events.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "route '{}' must list at least one event type",
                definition.name
            )));
        }
        Ok(Self {
            name: definition.name.clone(),
            source: definition.when.source.clone(),
            events: definition.when.events.iter().copied().collect(),
            filter: Filter::compile(&definition.when.filter)?,
            transforms: definition.transforms.clone(),
            target: definition.then.clone(),
            settings: definition.advanced.clone(),
        })
    }

    fn applies_to(&self, event: &Event, document: Option<&Value>) -> bool {
        if self.source != event.source || !self.events.contains(&event.event_type) {
            return false;
        }
        match document {
            Some(document) => self.filter.matches_document(document),
            None => self.filter.is_empty(),
        }
    }
}

/// Holds a module's routes and computes the matching set for each event.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    routes: Vec<Arc<Route>>,
}

impl RouteMatcher {
    /// Build a matcher; route names must be unique within the module.
    pub fn new(routes: Vec<Route>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for route in &routes {
            if !seen.insert(route.name.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate route name '{}'",
                    route.name
                )));
            }
        }
        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn from_definitions(definitions: &[RouteDefinition]) -> Result<Self, ConfigError> {
        let routes = definitions
            .iter()
            .map(Route::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(routes)
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every route that applies to `event`, in declaration order.
    pub fn matching(&self, event: &Event) -> Vec<Arc<Route>> {
        let needs_document = self
            .routes
            .iter()
            .any(|r| !r.filter.is_empty() && r.source == event.source);
        let document = if needs_document {
            serde_json::to_value(event).ok()
        } else {
            None
        };

        let matched: Vec<Arc<Route>> = self
            .routes
            .iter()
            .filter(|route| route.applies_to(event, document.as_ref()))
            .cloned()
            .collect();

        debug!(
            event_id = %event.id,
            source = %event.source,
            event_type = %event.event_type,
            matched = matched.len(),
            "Routes evaluated"
        );
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Author, AuthorKind, Provenance};
    use serde_json::json;

    fn event(source: &str, event_type: EventType, payload: Value) -> Event {
        Event::new(source, event_type, payload).with_module("m")
    }

    fn route(name: &str, source: &str, events: &[EventType], filter: Value) -> Route {
        let definition: RouteDefinition = serde_json::from_value(json!({
            "name": name,
            "when": { "source": source, "events": events, "filter": filter },
            "then": { "actor": "log" }
        }))
        .unwrap();
        Route::compile(&definition).unwrap()
    }

    fn names(routes: &[Arc<Route>]) -> Vec<&str> {
        routes.iter().map(|r| r.name.as_str()).collect()
    }

    // Criterion tests

    #[test]
    fn test_is_wildcard_pattern() {
        assert!(is_wildcard_pattern("release-*"));
        assert!(is_wildcard_pattern("*"));
        assert!(!is_wildcard_pattern("exact.match"));
    }

    #[test]
    fn test_wildcard_criterion() {
        let re = wildcard_regex("v1.*").unwrap();
        assert!(re.is_match("v1.2"));
        assert!(!re.is_match("v10"));
        assert!(wildcard_regex("*").unwrap().is_match(""));
    }

    #[test]
    fn test_criterion_deserialize() {
        let raw: BTreeMap<String, FilterCriterion> = serde_json::from_value(json!({
            "a": "x",
            "b": {"any": [1, 2]},
            "c": {"pattern": "^v"},
            "d": 5
        }))
        .unwrap();
        assert_eq!(raw["a"], FilterCriterion::Exact(json!("x")));
        assert_eq!(raw["b"], FilterCriterion::OneOf { any: vec![json!(1), json!(2)] });
        assert_eq!(raw["c"], FilterCriterion::Pattern { pattern: "^v".into() });
        assert_eq!(raw["d"], FilterCriterion::Exact(json!(5)));
    }

    #[test]
    fn test_exact_and_membership() {
        let filter = Filter::compile(
            &serde_json::from_value(json!({"payload.labels": "bug", "payload.n": 3})).unwrap(),
        )
        .unwrap();

        let doc = json!({"payload": {"labels": ["bug", "ui"], "n": 3}});
        assert!(filter.matches_document(&doc));

        let doc = json!({"payload": {"labels": ["ui"], "n": 3}});
        assert!(!filter.matches_document(&doc));

        // Missing path never matches
        assert!(!filter.matches_document(&json!({"payload": {"n": 3}})));
    }

    #[test]
    fn test_one_of_and_pattern() {
        let filter = Filter::compile(
            &serde_json::from_value(json!({
                "payload.lang": {"any": ["rust", "go"]},
                "payload.tag": {"pattern": "^v\\d+\\."}
            }))
            .unwrap(),
        )
        .unwrap();

        assert!(filter.matches_document(&json!({"payload": {"lang": "rust", "tag": "v1.2"}})));
        assert!(!filter.matches_document(&json!({"payload": {"lang": "java", "tag": "v1.2"}})));
        assert!(!filter.matches_document(&json!({"payload": {"lang": "go", "tag": "1.2"}})));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let raw = serde_json::from_value(json!({"payload.x": {"pattern": "("}})).unwrap();
        assert!(matches!(
            Filter::compile(&raw),
            Err(ConfigError::ValidationError(_))
        ));
    }

    // Matcher tests

    #[test]
    fn test_source_and_type_must_match() {
        let matcher = RouteMatcher::new(vec![route("r", "github", &[EventType::Issue], json!({}))])
            .unwrap();

        assert_eq!(matcher.matching(&event("github", EventType::Issue, json!({}))).len(), 1);
        assert!(matcher.matching(&event("gitlab", EventType::Issue, json!({}))).is_empty());
        assert!(matcher.matching(&event("github", EventType::Commit, json!({}))).is_empty());
    }

    #[test]
    fn test_filter_on_provenance() {
        let matcher = RouteMatcher::new(vec![route(
            "humans",
            "github",
            &[EventType::Issue],
            json!({"provenance.author.kind": "human"}),
        )])
        .unwrap();

        let human = event("github", EventType::Issue, json!({})).with_provenance(
            Provenance::new("github").with_author(Author {
                kind: AuthorKind::Human,
                ..Default::default()
            }),
        );
        let bot = event("github", EventType::Issue, json!({})).with_provenance(
            Provenance::new("github").with_author(Author {
                kind: AuthorKind::Bot,
                ..Default::default()
            }),
        );

        assert_eq!(names(&matcher.matching(&human)), vec!["humans"]);
        assert!(matcher.matching(&bot).is_empty());
    }

    #[test]
    fn test_all_matching_routes_fire() {
        let matcher = RouteMatcher::new(vec![
            route("all-issues", "github", &[EventType::Issue], json!({})),
            route("bugs", "github", &[EventType::Issue], json!({"payload.labels": "bug"})),
            route("commits", "github", &[EventType::Commit], json!({})),
        ])
        .unwrap();

        let bug = event("github", EventType::Issue, json!({"labels": ["bug"]}));
        assert_eq!(names(&matcher.matching(&bug)), vec!["all-issues", "bugs"]);

        let feature = event("github", EventType::Issue, json!({"labels": ["feature"]}));
        assert_eq!(names(&matcher.matching(&feature)), vec!["all-issues"]);
    }

    #[test]
    fn test_duplicate_route_names_rejected() {
        let result = RouteMatcher::new(vec![
            route("same", "a", &[EventType::Post], json!({})),
            route("same", "b", &[EventType::Post], json!({})),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_route_requires_events() {
        let definition: RouteDefinition = serde_json::from_value(json!({
            "name": "empty",
            "when": { "source": "a", "events": [] },
            "then": { "actor": "log" }
        }))
        .unwrap();
        assert!(Route::compile(&definition).is_err());
    }
}
