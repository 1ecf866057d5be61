//! Error classification shared by every component.
//!
//! External failures are translated into a small set of kinds at the probe
//! and store boundaries. Orchestration code branches on the kind, never on
//! the raw SDK error.

/* ============================= KINDS ============================= */

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// The app, record, or cloud resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The external system refused the call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Retryable failure (throttling, connection reset, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A deadline elapsed before the operation finished.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// An optimistic conditional write lost the race.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// Unrecoverable invariant violation.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type OpsResult<T> = std::result::Result<T, OpsError>;

impl OpsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed(_))
    }
}

/* ============================= TRANSLATION ============================= */

impl From<kube::Error> for OpsError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
                Self::PermissionDenied(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code >= 500 => Self::Transient(resp.message.clone()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OpsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("malformed stored document: {err}"))
    }
}

/// Classify a rendered AWS SDK error by its service-level markers.
///
/// The SDK wraps every service error in layers of dispatch/response types;
/// matching on the rendered text keeps the probe clients independent of each
/// service's generated error enums.
pub fn classify_aws(rendered: String) -> OpsError {
    let lower = rendered.to_lowercase();
    if lower.contains("resourcenotfound") || lower.contains("does not exist") {
        OpsError::NotFound(rendered)
    } else if lower.contains("accessdenied")
        || lower.contains("unauthorized")
        || lower.contains("not authorized")
    {
        OpsError::PermissionDenied(rendered)
    } else if lower.contains("conditionalcheckfailed") {
        OpsError::ConditionFailed(rendered)
    } else if lower.contains("throttl") || lower.contains("timed out") {
        OpsError::Transient(rendered)
    } else {
        OpsError::Transient(rendered)
    }
}

/* ============================= TESTS ============================= */
