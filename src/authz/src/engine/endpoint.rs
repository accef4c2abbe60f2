//! HTTP method + path to (resource, action) mapping
//!
//! Explicit rules are matched first, in the order given. When no rule
//! matches and the convention fallback is enabled, paths of the form
//! `/api/v{n}/{collection}[/{id}]` map to `collection` with an action derived
//! from the method.

use crate::error::{AuthzError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Configured endpoint rule, e.g. `GET /api/v1/documents/{id}` → `documents:read`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// HTTP method, or `*` for any
    pub method: String,
    /// Path pattern; `{name}` and `*` each match one segment, `{id}` is
    /// captured as the resource instance
    pub pattern: String,
    pub resource: String,
    pub action: String,
}

impl EndpointRule {
    pub fn new(
        method: impl Into<String>,
        pattern: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            pattern: pattern.into(),
            resource: resource.into(),
            action: action.into(),
        }
    }
}

/// Permission an endpoint requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredPermission {
    pub resource: String,
    pub action: String,
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: EndpointRule,
    matcher: Regex,
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    let segments: Vec<String> = normalize_path(pattern)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| match segment {
            "*" => "[^/]+".to_string(),
            "{id}" => "(?P<id>[^/]+)".to_string(),
            s if s.starts_with('{') && s.ends_with('}') => "[^/]+".to_string(),
            s => regex::escape(s),
        })
        .collect();

    Regex::new(&format!("^/{}$", segments.join("/")))
        .map_err(|e| AuthzError::Validation(format!("invalid endpoint pattern '{}': {}", pattern, e)))
}

/// Drop query string and trailing slashes
fn normalize_path(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Action implied by an HTTP method under the path convention
pub fn method_action(method: &str) -> Option<&'static str> {
    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" => Some("read"),
        "POST" => Some("create"),
        "PUT" | "PATCH" => Some("update"),
        "DELETE" => Some("delete"),
        _ => None,
    }
}

/// `/api/v{n}/{collection}[/{id}[/...]]`
fn resolve_by_convention(method: &str, path: &str) -> Option<RequiredPermission> {
    let action = method_action(method)?;
    let mut parts = path.split('/').filter(|s| !s.is_empty());

    if parts.next()? != "api" {
        return None;
    }
    let version = parts.next()?;
    let is_version = version.len() > 1
        && version.starts_with('v')
        && version[1..].chars().all(|c| c.is_ascii_digit());
    if !is_version {
        return None;
    }

    let collection = parts.next()?;
    Some(RequiredPermission {
        resource: collection.to_string(),
        action: action.to_string(),
        resource_id: parts.next().map(str::to_string),
    })
}

/// Endpoint → permission map
#[derive(Debug, Clone, Default)]
pub struct EndpointPermissionMap {
    rules: Vec<CompiledRule>,
    convention_fallback: bool,
}

impl EndpointPermissionMap {
    pub fn new(rules: Vec<EndpointRule>, convention_fallback: bool) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    matcher: compile_pattern(&rule.pattern)?,
                    rule,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            convention_fallback,
        })
    }

    /// Map resolved only by the path convention
    pub fn convention_only() -> Self {
        Self {
            rules: Vec::new(),
            convention_fallback: true,
        }
    }

    /// Load rules from a JSON array of [`EndpointRule`]
    pub fn from_json(json: &str, convention_fallback: bool) -> Result<Self> {
        let rules: Vec<EndpointRule> = serde_json::from_str(json)
            .map_err(|e| AuthzError::Validation(format!("invalid endpoint rules: {}", e)))?;
        Self::new(rules, convention_fallback)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Permission required for `method path`, or `None` if unmapped
    pub fn resolve(&self, method: &str, path: &str) -> Option<RequiredPermission> {
        let path = normalize_path(path);

        for compiled in &self.rules {
            let method_ok = compiled.rule.method == "*"
                || compiled.rule.method.eq_ignore_ascii_case(method);
            if !method_ok {
                continue;
            }
            if let Some(captures) = compiled.matcher.captures(path) {
                return Some(RequiredPermission {
                    resource: compiled.rule.resource.clone(),
                    action: compiled.rule.action.clone(),
                    resource_id: captures.name("id").map(|m| m.as_str().to_string()),
                });
            }
        }

        if self.convention_fallback {
            resolve_by_convention(method, path)
        } else {
            None
        }
    }
}
