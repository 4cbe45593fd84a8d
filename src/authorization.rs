//! Per-entity-kind create/read/update/delete decisions

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// The four operations a policy can grant or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
   Create,
   Read,
   Update,
   Delete,
}

impl fmt::Display for Operation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         Operation::Create => "create",
         Operation::Read => "read",
         Operation::Update => "update",
         Operation::Delete => "delete",
      };
      f.write_str(name)
   }
}

/// Which operations are allowed on one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationDecision {
   pub can_create: bool,
   pub can_read: bool,
   pub can_update: bool,
   pub can_delete: bool,
}

impl AuthorizationDecision {
   pub const ALLOW_ALL: Self = Self {
      can_create: true,
      can_read: true,
      can_update: true,
      can_delete: true,
   };

   pub const DENY_ALL: Self = Self {
      can_create: false,
      can_read: false,
      can_update: false,
      can_delete: false,
   };

   pub const READ_ONLY: Self = Self {
      can_create: false,
      can_read: true,
      can_update: false,
      can_delete: false,
   };

   pub fn allows(&self, operation: Operation) -> bool {
      match operation {
         Operation::Create => self.can_create,
         Operation::Read => self.can_read,
         Operation::Update => self.can_update,
         Operation::Delete => self.can_delete,
      }
   }
}

/// Maps an entity kind to a decision.
///
/// Implementations must be pure: the same kind always yields the same
/// decision for the lifetime of the policy.
pub trait AuthorizationPolicy: Send + Sync + fmt::Debug {
   fn decision(&self, kind: &str) -> AuthorizationDecision;
}

/// Serializable built-in policies.
///
/// ```
/// use sqlite_access_coordinator::{AuthorizationPolicy, AuthorizationProfile};
///
/// let profile: AuthorizationProfile = serde_json::from_str(
///     r#"{ "policy": "custom", "kinds": { "audit_log": { "can_read": true } } }"#,
/// )
/// .unwrap();
///
/// assert!(profile.decision("audit_log").can_read);
/// assert!(!profile.decision("audit_log").can_delete);
/// assert!(!profile.decision("orders").can_read);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum AuthorizationProfile {
   /// Grants everything. Used when no profile is configured.
   #[default]
   Administrator,

   /// Grants reads on every kind and nothing else.
   ReadOnly,

   /// Explicit per-kind decisions; unlisted kinds get `fallback`.
   Custom {
      #[serde(default)]
      kinds: BTreeMap<String, AuthorizationDecision>,
      #[serde(default)]
      fallback: AuthorizationDecision,
   },
}

impl AuthorizationPolicy for AuthorizationProfile {
   fn decision(&self, kind: &str) -> AuthorizationDecision {
      match self {
         AuthorizationProfile::Administrator => AuthorizationDecision::ALLOW_ALL,
         AuthorizationProfile::ReadOnly => AuthorizationDecision::READ_ONLY,
         AuthorizationProfile::Custom { kinds, fallback } => {
            kinds.get(kind).copied().unwrap_or(*fallback)
         }
      }
   }
}

/// Checks every coordinator entry point against a policy before any gate is
/// touched.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
   policy: Arc<dyn AuthorizationPolicy>,
}

impl Default for AuthorizationGate {
   fn default() -> Self {
      Self::from_profile(AuthorizationProfile::Administrator)
   }
}

impl AuthorizationGate {
   pub fn new(policy: Arc<dyn AuthorizationPolicy>) -> Self {
      Self { policy }
   }

   pub fn from_profile(profile: AuthorizationProfile) -> Self {
      Self::new(Arc::new(profile))
   }

   pub fn decision(&self, kind: &str) -> AuthorizationDecision {
      self.policy.decision(kind)
   }

   pub fn decide(&self, kind: &str, operation: Operation) -> bool {
      self.decision(kind).allows(operation)
   }

   /// `Ok(())` when allowed, otherwise [`Error::Unauthorized`].
   pub fn authorize(&self, kind: &str, operation: Operation) -> Result<()> {
      if self.decide(kind, operation) {
         return Ok(());
      }

      debug!(kind, %operation, "Operation denied");
      Err(Error::Unauthorized {
         kind: kind.to_string(),
         operation,
      })
   }

   /// Check every operation on every kind, failing on the first denial.
   pub fn authorize_all<S: AsRef<str>>(&self, kinds: &[S], operations: &[Operation]) -> Result<()> {
      for kind in kinds {
         for operation in operations {
            self.authorize(kind.as_ref(), *operation)?;
         }
      }
      Ok(())
   }
}
