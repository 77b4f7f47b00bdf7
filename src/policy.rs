//! Request Validation & Security Policy Evaluator
//!
//! Pure functions turning declarative, possibly-sloppy request shapes into
//! the concrete validated values the rest of the core trusts.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

static MODULE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").expect("valid regex"));

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\r', '\n'];

/// Canonical internal representation of a permission value. The wire shape
/// may arrive as a bare bool, a list of strings, or be absent entirely;
/// this collapses all three into one type the rest of the core switches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowed {
    All,
    Denied,
    List(Vec<String>),
}

impl Default for Allowed {
    fn default() -> Self {
        Allowed::Denied
    }
}

/// Raw wire shape accepted from a SetupRequest's permissions block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawAllowed {
    Bool(bool),
    List(Vec<String>),
}

impl From<RawAllowed> for Allowed {
    fn from(raw: RawAllowed) -> Self {
        match raw {
            RawAllowed::Bool(true) => Allowed::All,
            RawAllowed::Bool(false) => Allowed::Denied,
            RawAllowed::List(items) => Allowed::List(items),
        }
    }
}

/// Declarative permissions as they arrive on a SetupRequest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsRequest {
    #[serde(default)]
    allow_net: Option<RawAllowed>,
    #[serde(default)]
    allow_env: Option<RawAllowed>,
    #[serde(default)]
    allow_read: Option<RawAllowed>,
    #[serde(default)]
    allow_write: Option<RawAllowed>,
    #[serde(default)]
    allow_run: Option<RawAllowed>,
    #[serde(default)]
    allow_ffi: Option<RawAllowed>,
    #[serde(default)]
    allow_hrtime: bool,
}

/// Canonical permissions, as stored in environment metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub allow_net: Allowed,
    #[serde(default)]
    pub allow_env: Allowed,
    #[serde(default)]
    pub allow_read: Allowed,
    #[serde(default)]
    pub allow_write: Allowed,
    #[serde(default)]
    pub allow_run: Allowed,
    #[serde(default)]
    pub allow_ffi: Allowed,
    #[serde(default)]
    pub allow_hrtime: bool,
}

impl From<PermissionsRequest> for Permissions {
    fn from(req: PermissionsRequest) -> Self {
        Self {
            allow_net: req.allow_net.map(Allowed::from).unwrap_or_default(),
            allow_env: req.allow_env.map(Allowed::from).unwrap_or_default(),
            allow_read: req.allow_read.map(Allowed::from).unwrap_or_default(),
            allow_write: req.allow_write.map(Allowed::from).unwrap_or_default(),
            allow_run: req.allow_run.map(Allowed::from).unwrap_or_default(),
            allow_ffi: req.allow_ffi.map(Allowed::from).unwrap_or_default(),
            allow_hrtime: req.allow_hrtime,
        }
    }
}

/// What the Engine should forward to the worker as `env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvDecision {
    None,
    Keys(Vec<String>),
}

impl Permissions {
    /// Whether network access should be enabled for this execution and, if
    /// so, the allow-list to propagate. A present list *replaces* the
    /// deny-all default rather than adding to it — see the root design
    /// document's notes on this decision.
    pub fn network_allowance(&self) -> Option<&[String]> {
        match &self.allow_net {
            Allowed::All => Some(&[]),
            Allowed::Denied => None,
            Allowed::List(hosts) => {
                if hosts.is_empty() {
                    None
                } else {
                    Some(hosts)
                }
            }
        }
    }

    /// Intersect the request's env map against the recorded `allow_env`
    /// policy, yielding the keys the worker may see.
    pub fn env_decision(&self, requested: &HashMap<String, String>) -> EnvDecision {
        match &self.allow_env {
            Allowed::All => EnvDecision::Keys(requested.keys().cloned().collect()),
            Allowed::Denied => EnvDecision::None,
            Allowed::List(allowed) => {
                let keys: Vec<String> = requested
                    .keys()
                    .filter(|k| allowed.contains(k))
                    .cloned()
                    .collect();
                if keys.is_empty() {
                    EnvDecision::None
                } else {
                    EnvDecision::Keys(keys)
                }
            }
        }
    }
}

/// Validate a module filename: relative, no traversal, restricted charset.
pub fn validate_module_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(CoreError::Validation(format!(
            "module filename must be 1-255 characters: {name}"
        )));
    }
    if name.starts_with('/') {
        return Err(CoreError::Validation(format!(
            "module filename must be relative: {name}"
        )));
    }
    if name.split('/').any(|part| part == "..") {
        return Err(CoreError::Validation(format!(
            "module filename must not contain '..': {name}"
        )));
    }
    if !MODULE_NAME_RE.is_match(name) {
        return Err(CoreError::Validation(format!(
            "module filename contains disallowed characters: {name}"
        )));
    }
    Ok(())
}

/// Validate a dependency specifier is free of shell metacharacters. The
/// Builder never composes these into a shell command string, but rejecting
/// them up front keeps the contract obvious and testable.
pub fn validate_dependency_spec(spec: &str) -> Result<()> {
    if spec.is_empty() {
        return Err(CoreError::Validation("dependency specifier is empty".to_string()));
    }
    if spec.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return Err(CoreError::Validation(format!(
            "dependency specifier contains disallowed characters: {spec}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_module_name_accepts_plain_names() {
        assert!(validate_module_name("main.ts").is_ok());
        assert!(validate_module_name("lib/helpers.ts").is_ok());
    }

    #[test]
    fn test_validate_module_name_rejects_traversal() {
        assert!(validate_module_name("../secrets.env").is_err());
        assert!(validate_module_name("a/../b.ts").is_err());
        assert!(validate_module_name("/etc/passwd").is_err());
    }

    #[test]
    fn test_validate_module_name_rejects_shell_metacharacters() {
        assert!(validate_module_name("main.ts; rm -rf /").is_err());
    }

    #[test]
    fn test_validate_dependency_spec() {
        assert!(validate_dependency_spec("lodash@4.17.21").is_ok());
        assert!(validate_dependency_spec("lodash; rm -rf /").is_err());
    }

    #[test]
    fn test_network_allowance_replaces_rather_than_adds() {
        let perms = Permissions {
            allow_net: Allowed::List(vec!["api.example.com".to_string()]),
            allow_env: Allowed::Denied,
            allow_read: Allowed::Denied,
            allow_write: Allowed::Denied,
            allow_run: Allowed::Denied,
            allow_ffi: Allowed::Denied,
            allow_hrtime: false,
        };
        assert_eq!(
            perms.network_allowance(),
            Some(&["api.example.com".to_string()][..])
        );

        let empty_list = Permissions {
            allow_net: Allowed::List(vec![]),
            ..perms.clone()
        };
        assert_eq!(empty_list.network_allowance(), None);
    }

    #[test]
    fn test_env_decision_intersection() {
        let perms = Permissions {
            allow_net: Allowed::Denied,
            allow_env: Allowed::List(vec!["API_KEY".to_string()]),
            allow_read: Allowed::Denied,
            allow_write: Allowed::Denied,
            allow_run: Allowed::Denied,
            allow_ffi: Allowed::Denied,
            allow_hrtime: false,
        };
        let mut requested = HashMap::new();
        requested.insert("API_KEY".to_string(), "secret".to_string());
        requested.insert("OTHER".to_string(), "value".to_string());

        match perms.env_decision(&requested) {
            EnvDecision::Keys(keys) => assert_eq!(keys, vec!["API_KEY".to_string()]),
            EnvDecision::None => panic!("expected keys"),
        }
    }
}
