//! Store key layout and service name filtering.
//!
//! ```text
//! <root>/<service>/<instance>   instance key, value = dial address
//! <root>/<service>              logical path
//! <root>/names                  optional allow-list, one name per line
//! ```

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// Why a store key does not name a usable service instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("{0} is outside the registry root")]
    OutsideRoot(String),

    #[error("{0} is not a <service>/<instance> entry")]
    Malformed(String),

    #[error("service '{0}' is not in the allow-list")]
    NotAllowed(String),
}

/// A classified instance key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePath {
    /// Service name, e.g. `auth`.
    pub service: String,
    /// Logical path, e.g. `/backends/auth`.
    pub logical_path: String,
    /// Full instance key, e.g. `/backends/auth/host123`.
    pub key: String,
}

/// Allow-list shared by every clone of a filter. Unset while it is still
/// being read from the store; `None` inside means every service is allowed.
type AllowList = Arc<OnceLock<Option<HashSet<String>>>>;

/// Maps store keys onto services, applying the optional allow-list.
#[derive(Debug, Clone)]
pub struct ServiceFilter {
    root: String,
    allowed: AllowList,
    names_key: Option<String>,
}

impl ServiceFilter {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            allowed: Arc::new(OnceLock::from(None)),
            names_key: None,
        }
    }

    /// Restrict the registry to these service names.
    pub fn with_allowed<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        self.allowed = Arc::new(OnceLock::from(Some(names)));
        self
    }

    /// Leave the allow-list unresolved: no service passes until
    /// [`resolve_allowed`](Self::resolve_allowed) is called on any clone.
    pub fn with_pending_allow_list(mut self) -> Self {
        self.allowed = Arc::new(OnceLock::new());
        self
    }

    /// Settle a pending allow-list. False if it was already settled.
    pub fn resolve_allowed(&self, names: Option<Vec<String>>) -> bool {
        self.allowed
            .set(names.map(|names| names.into_iter().collect()))
            .is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.allowed.get().is_some()
    }

    /// Key of the names file; skipped silently when seen under the root.
    pub fn with_names_key(mut self, key: Option<String>) -> Self {
        self.names_key = key;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The active allow-list, if one is resolved and restricts anything.
    pub fn allowed(&self) -> Option<&HashSet<String>> {
        self.allowed.get().and_then(Option::as_ref)
    }

    pub fn names_key(&self) -> Option<&str> {
        self.names_key.as_deref()
    }

    pub fn is_names_key(&self, key: &str) -> bool {
        self.names_key.as_deref() == Some(key)
    }

    /// Nothing is allowed while the allow-list is pending.
    pub fn is_allowed(&self, service: &str) -> bool {
        match self.allowed.get() {
            None => false,
            Some(None) => true,
            Some(Some(names)) => names.contains(service),
        }
    }

    fn relative<'a>(&self, key: &'a str) -> Result<&'a str, PathError> {
        key.strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| PathError::OutsideRoot(key.to_string()))
    }

    /// Classify an instance key.
    pub fn classify(&self, key: &str) -> Result<InstancePath, PathError> {
        let relative = self.relative(key)?;
        let (service, instance) = relative
            .split_once('/')
            .ok_or_else(|| PathError::Malformed(key.to_string()))?;
        if service.is_empty() || instance.is_empty() || instance.contains('/') {
            return Err(PathError::Malformed(key.to_string()));
        }
        if !self.is_allowed(service) {
            return Err(PathError::NotAllowed(service.to_string()));
        }
        Ok(InstancePath {
            service: service.to_string(),
            logical_path: format!("{}/{}", self.root, service),
            key: key.to_string(),
        })
    }

    /// Classify a service directory key, returning its logical path.
    pub fn classify_service(&self, key: &str) -> Result<String, PathError> {
        let service = self.relative(key)?;
        if service.is_empty() || service.contains('/') {
            return Err(PathError::Malformed(key.to_string()));
        }
        if !self.is_allowed(service) {
            return Err(PathError::NotAllowed(service.to_string()));
        }
        Ok(key.to_string())
    }

    /// Resolve a caller-supplied service name to its logical path. Names that
    /// already start with `/` are taken as logical paths.
    pub fn service_path(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{}", self.root, name)
        }
    }

    /// Build the instance key for a service name and instance id.
    pub fn instance_key(&self, service: &str, instance_id: &str) -> Result<String, PathError> {
        let key = format!("{}/{}", self.service_path(service), instance_id);
        self.classify(&key).map(|p| p.key)
    }
}

/// Parse the names file: one service name per line, blanks ignored.
pub fn parse_names(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_instance() {
        let filter = ServiceFilter::new("/backends");
        let path = filter.classify("/backends/auth/host123").unwrap();
        assert_eq!(path.service, "auth");
        assert_eq!(path.logical_path, "/backends/auth");
        assert_eq!(path.key, "/backends/auth/host123");
    }

    #[test]
    fn test_classify_rejects_bad_shapes() {
        let filter = ServiceFilter::new("/backends");
        assert_eq!(
            filter.classify("/backends/names"),
            Err(PathError::Malformed("/backends/names".into()))
        );
        assert!(matches!(
            filter.classify("/backends/auth/a/b"),
            Err(PathError::Malformed(_))
        ));
        assert!(matches!(
            filter.classify("/backends//x"),
            Err(PathError::Malformed(_))
        ));
        assert!(matches!(
            filter.classify("/backendsx/auth/i1"),
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[test]
    fn test_allow_list() {
        let filter = ServiceFilter::new("/backends").with_allowed(["auth"]);
        assert!(filter.classify("/backends/auth/i1").is_ok());
        assert_eq!(
            filter.classify("/backends/chat/c1"),
            Err(PathError::NotAllowed("chat".into()))
        );
        assert_eq!(
            filter.classify_service("/backends/chat"),
            Err(PathError::NotAllowed("chat".into()))
        );
        assert_eq!(filter.classify_service("/backends/auth").unwrap(), "/backends/auth");
    }

    #[test]
    fn test_pending_allow_list_shared_by_clones() {
        let filter = ServiceFilter::new("/backends").with_pending_allow_list();
        let clone = filter.clone();
        assert!(!clone.is_resolved());
        assert_eq!(
            clone.classify("/backends/auth/i1"),
            Err(PathError::NotAllowed("auth".into()))
        );

        assert!(filter.resolve_allowed(Some(vec!["auth".into()])));
        assert!(!filter.resolve_allowed(None));
        assert!(clone.is_resolved());
        assert!(clone.classify("/backends/auth/i1").is_ok());
        assert!(clone.classify("/backends/chat/c1").is_err());
    }

    #[test]
    fn test_service_path_and_instance_key() {
        let filter = ServiceFilter::new("/backends");
        assert_eq!(filter.service_path("auth"), "/backends/auth");
        assert_eq!(filter.service_path("/backends/auth"), "/backends/auth");
        assert_eq!(
            filter.instance_key("auth", "i1").unwrap(),
            "/backends/auth/i1"
        );
        assert!(filter.instance_key("auth", "a/b").is_err());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            parse_names("snowflake\n auth \n\n chat\r\n"),
            vec!["snowflake", "auth", "chat"]
        );
    }

    #[test]
    fn test_names_key() {
        let filter =
            ServiceFilter::new("/backends").with_names_key(Some("/backends/names".into()));
        assert!(filter.is_names_key("/backends/names"));
        assert!(!filter.is_names_key("/backends/auth"));
    }
}
