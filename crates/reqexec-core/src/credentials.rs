// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution identity resolution.
//!
//! A request runs either under a pre-provisioned service identity (a
//! "shifter") when its owner is one, or under a delegated credential issued
//! for the owner on demand. The resolved identity is handed to handlers
//! through [`crate::handlers::ExecutionContext`]; nothing process-wide is
//! modified.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::ErrorKind;

/// Environment variable external grid tools read the credential location from.
pub const CREDENTIAL_ENV_VAR: &str = "X509_USER_PROXY";

/// Default minimum remaining validity for issued credentials.
pub const DEFAULT_MIN_VALIDITY: Duration = Duration::from_secs(1200);

/// Default caching hint for issued credentials.
pub const DEFAULT_CACHE_HINT: Duration = Duration::from_secs(4 * 43200);

/// Validity constraints passed to every issuance call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    /// Minimum remaining lifetime the issued credential must have.
    pub min_validity: Duration,
    /// How long the issuer may cache and reuse the credential.
    pub cache_hint: Duration,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            min_validity: DEFAULT_MIN_VALIDITY,
            cache_hint: DEFAULT_CACHE_HINT,
        }
    }
}

/// A file-backed credential plus the identity it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Location of the credential file.
    pub path: PathBuf,
    /// Subject the credential was issued for.
    pub subject: String,
    /// Group the credential was issued for.
    pub group: String,
    /// VOMS attribute embedded in the credential, if any.
    pub voms_attribute: Option<String>,
}

/// Parameters of a delegated credential issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// Subject to issue for.
    pub subject: String,
    /// Group to issue for.
    pub group: String,
    /// VOMS attribute to embed, when the group maps to one.
    pub voms_attribute: Option<String>,
    /// Minimum remaining validity.
    pub min_validity: Duration,
    /// Caching hint for reuse.
    pub cache_hint: Duration,
}

/// Errors from the credential issuance service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum IssueError {
    /// The subject has no credential registered at all.
    #[error("'{subject}'@'{group}' has no proxy registered")]
    NotRegistered {
        /// Subject that was looked up.
        subject: String,
        /// Group that was looked up.
        group: String,
    },

    /// The issuance service failed or could not be reached.
    #[error("{0}")]
    Unavailable(String),
}

/// External credential issuance service.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Obtain a delegated credential for `request.subject`@`request.group`.
    async fn issue_delegated(&self, request: &IssueRequest) -> Result<Credential, IssueError>;
}

/// Errors from the identity directory.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DirectoryError {
    /// No subject is known for the user name.
    #[error("no subject registered for user '{0}'")]
    UnknownUser(String),

    /// The directory could not be queried.
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

/// Maps user names to subjects and groups to VOMS attributes.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Subject (DN) registered for a user name.
    async fn subject_for_user(&self, user: &str) -> Result<String, DirectoryError>;

    /// VOMS attribute associated with a group, if the group has one.
    fn voms_attribute_for_group(&self, group: &str) -> Option<String>;
}

/// Directory backed by fixed maps.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: HashMap<String, String>,
    voms: HashMap<String, String>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user's subject.
    pub fn with_user(mut self, user: impl Into<String>, subject: impl Into<String>) -> Self {
        self.users.insert(user.into(), subject.into());
        self
    }

    /// Register a group's VOMS attribute.
    pub fn with_voms(mut self, group: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.voms.insert(group.into(), attribute.into());
        self
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn subject_for_user(&self, user: &str) -> Result<String, DirectoryError> {
        self.users
            .get(user)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownUser(user.to_string()))
    }

    fn voms_attribute_for_group(&self, group: &str) -> Option<String> {
        self.voms.get(group).cloned()
    }
}

/// Configured shifter: a logical role bound to a service user and group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShifterSpec {
    /// Logical role name, e.g. `DataManager`.
    pub role: String,
    /// Service user name.
    pub user: String,
    /// Group the shifter acts in.
    pub group: String,
}

impl ShifterSpec {
    /// Create a shifter definition.
    pub fn new(
        role: impl Into<String>,
        user: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            user: user.into(),
            group: group.into(),
        }
    }

    /// Parse `Role=user:group`.
    pub fn parse(s: &str) -> Option<Self> {
        let (role, rest) = s.split_once('=')?;
        let (user, group) = rest.split_once(':')?;
        let (role, user, group) = (role.trim(), user.trim(), group.trim());
        if role.is_empty() || user.is_empty() || group.is_empty() {
            return None;
        }
        Some(Self::new(role, user, group))
    }
}

/// A shifter whose credential was fetched successfully.
#[derive(Debug, Clone)]
pub struct ShifterCredential {
    /// Shifter user name.
    pub user: String,
    /// Subject resolved for the user.
    pub subject: String,
    /// Shifter group.
    pub group: String,
    /// Pre-fetched credential.
    pub credential: Credential,
}

/// Identity a request's operations execute under.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// Credential to act with.
    pub credential: Credential,
    /// Shifter roles matching the owner, sorted; empty for owner credentials.
    pub shifters: Vec<String>,
}

impl ResolvedIdentity {
    /// Whether the identity comes from the shifter pool.
    pub fn is_delegated(&self) -> bool {
        !self.shifters.is_empty()
    }
}

/// Identity resolution failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolveError {
    /// The owner has no credential registered; retrying will not help.
    #[error("cannot obtain credential for '{subject}'@'{group}': {reason}")]
    NoCredential {
        /// Owner subject.
        subject: String,
        /// Owner group.
        group: String,
        /// Issuer message.
        reason: String,
    },

    /// Issuance failed for another reason; a later pass may succeed.
    #[error("cannot obtain credential for '{subject}'@'{group}': {reason}")]
    Unavailable {
        /// Owner subject.
        subject: String,
        /// Owner group.
        group: String,
        /// Issuer message.
        reason: String,
    },
}

impl ResolveError {
    /// Get the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCredential { .. } => ErrorKind::NoCredential,
            Self::Unavailable { .. } => ErrorKind::IdentityUnavailable,
        }
    }

    /// Whether this failure is permanent for the owner.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoCredential { .. })
    }
}

/// Resolves the execution identity of a request owner.
pub struct CredentialResolver {
    directory: Arc<dyn IdentityDirectory>,
    issuer: Arc<dyn CredentialIssuer>,
    shifters: Vec<ShifterSpec>,
    policy: CredentialPolicy,
}

impl std::fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("shifters", &self.shifters)
            .field("policy", &self.policy)
            .finish()
    }
}

impl CredentialResolver {
    /// Create a resolver with the default credential policy.
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        issuer: Arc<dyn CredentialIssuer>,
        shifters: Vec<ShifterSpec>,
    ) -> Self {
        Self {
            directory,
            issuer,
            shifters,
            policy: CredentialPolicy::default(),
        }
    }

    /// Create a resolver with the shifters and credential policy of a
    /// loaded [`Config`].
    pub fn from_config(
        directory: Arc<dyn IdentityDirectory>,
        issuer: Arc<dyn CredentialIssuer>,
        config: &Config,
    ) -> Self {
        Self::new(directory, issuer, config.shifters.clone()).with_policy(config.credential_policy)
    }

    /// Override the credential policy.
    pub fn with_policy(mut self, policy: CredentialPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The credential policy in use.
    pub fn policy(&self) -> CredentialPolicy {
        self.policy
    }

    fn issue_request(&self, subject: &str, group: &str) -> IssueRequest {
        IssueRequest {
            subject: subject.to_string(),
            group: group.to_string(),
            voms_attribute: self.directory.voms_attribute_for_group(group),
            min_validity: self.policy.min_validity,
            cache_hint: self.policy.cache_hint,
        }
    }

    /// Fetch credentials for every configured shifter.
    ///
    /// Shifters whose subject or credential cannot be obtained are logged and
    /// left out of the table.
    pub async fn shifter_table(&self) -> BTreeMap<String, ShifterCredential> {
        let mut table = BTreeMap::new();

        for shifter in &self.shifters {
            let subject = match self.directory.subject_for_user(&shifter.user).await {
                Ok(subject) => subject,
                Err(e) => {
                    warn!(role = %shifter.role, user = %shifter.user, error = %e, "Skipping shifter");
                    continue;
                }
            };

            let request = self.issue_request(&subject, &shifter.group);
            debug!(
                role = %shifter.role,
                user = %shifter.user,
                group = %shifter.group,
                voms = ?request.voms_attribute,
                "Fetching shifter credential"
            );

            match self.issuer.issue_delegated(&request).await {
                Ok(credential) => {
                    table.insert(
                        shifter.role.clone(),
                        ShifterCredential {
                            user: shifter.user.clone(),
                            subject,
                            group: shifter.group.clone(),
                            credential,
                        },
                    );
                }
                Err(e) => {
                    error!(role = %shifter.role, error = %e, "Unable to set up shifter credential");
                }
            }
        }

        table
    }

    /// Resolve the identity for `subject`@`group`.
    ///
    /// A matching shifter's pre-fetched credential wins; otherwise a delegated
    /// credential is issued for the owner.
    pub async fn resolve(&self, subject: &str, group: &str) -> Result<ResolvedIdentity, ResolveError> {
        let table = self.shifter_table().await;

        // BTreeMap iteration keeps matching roles sorted.
        let matching: Vec<(&String, &ShifterCredential)> = table
            .iter()
            .filter(|(_, s)| s.subject == subject && s.group == group)
            .collect();

        if let Some((role, shifter)) = matching.first() {
            debug!(role = %role, "Owner is a shifter, using pre-fetched credential");
            return Ok(ResolvedIdentity {
                credential: shifter.credential.clone(),
                shifters: matching.iter().map(|(r, _)| (*r).clone()).collect(),
            });
        }

        let request = self.issue_request(subject, group);
        match self.issuer.issue_delegated(&request).await {
            Ok(credential) => Ok(ResolvedIdentity {
                credential,
                shifters: Vec::new(),
            }),
            Err(e @ IssueError::NotRegistered { .. }) => Err(ResolveError::NoCredential {
                subject: subject.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(ResolveError::Unavailable {
                subject: subject.to_string(),
                group: group.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Issuer that hands out credentials for a fixed set of subjects.
    #[derive(Default)]
    struct FakeIssuer {
        registered: Vec<String>,
        down: bool,
        calls: Mutex<Vec<IssueRequest>>,
    }

    #[async_trait]
    impl CredentialIssuer for FakeIssuer {
        async fn issue_delegated(&self, request: &IssueRequest) -> Result<Credential, IssueError> {
            self.calls.lock().unwrap().push(request.clone());
            if self.down {
                return Err(IssueError::Unavailable("connection refused".to_string()));
            }
            if !self.registered.contains(&request.subject) {
                return Err(IssueError::NotRegistered {
                    subject: request.subject.clone(),
                    group: request.group.clone(),
                });
            }
            Ok(Credential {
                path: PathBuf::from(format!("/tmp/x509up_{}", request.group)),
                subject: request.subject.clone(),
                group: request.group.clone(),
                voms_attribute: request.voms_attribute.clone(),
            })
        }
    }

    fn directory() -> Arc<StaticDirectory> {
        Arc::new(
            StaticDirectory::new()
                .with_user("dm", "/DC=org/CN=data manager")
                .with_voms("prod", "/vo/Role=production"),
        )
    }

    #[tokio::test]
    async fn test_shifter_owner_uses_prefetched_credential() {
        let issuer = Arc::new(FakeIssuer {
            registered: vec!["/DC=org/CN=data manager".to_string()],
            ..Default::default()
        });
        let resolver = CredentialResolver::new(
            directory(),
            issuer.clone(),
            vec![
                ShifterSpec::new("DataManager", "dm", "prod"),
                ShifterSpec::new("Archiver", "dm", "prod"),
            ],
        );

        let identity = resolver
            .resolve("/DC=org/CN=data manager", "prod")
            .await
            .unwrap();

        assert!(identity.is_delegated());
        assert_eq!(identity.shifters, vec!["Archiver", "DataManager"]);
        assert_eq!(identity.credential.path, PathBuf::from("/tmp/x509up_prod"));
        // Only the two shifter fetches, no extra owner round trip.
        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].voms_attribute.as_deref(), Some("/vo/Role=production"));
        assert_eq!(calls[0].min_validity, Duration::from_secs(1200));
        assert_eq!(calls[0].cache_hint, Duration::from_secs(172800));
    }

    #[tokio::test]
    async fn test_owner_gets_delegated_credential() {
        let issuer = Arc::new(FakeIssuer {
            registered: vec!["/DC=org/CN=alice".to_string()],
            ..Default::default()
        });
        let resolver = CredentialResolver::new(directory(), issuer.clone(), Vec::new());

        let identity = resolver.resolve("/DC=org/CN=alice", "user").await.unwrap();

        assert!(!identity.is_delegated());
        assert_eq!(identity.credential.subject, "/DC=org/CN=alice");
        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].voms_attribute, None);
    }

    #[tokio::test]
    async fn test_broken_shifters_are_skipped() {
        let issuer = Arc::new(FakeIssuer {
            registered: vec!["/DC=org/CN=alice".to_string()],
            ..Default::default()
        });
        let resolver = CredentialResolver::new(
            directory(),
            issuer,
            vec![
                // Unknown user: directory lookup fails.
                ShifterSpec::new("Ghost", "nobody", "prod"),
                // Known user without a registered credential.
                ShifterSpec::new("DataManager", "dm", "prod"),
            ],
        );

        assert!(resolver.shifter_table().await.is_empty());
        let identity = resolver.resolve("/DC=org/CN=alice", "user").await.unwrap();
        assert!(!identity.is_delegated());
    }

    #[tokio::test]
    async fn test_unregistered_owner_is_permanent() {
        let resolver =
            CredentialResolver::new(directory(), Arc::new(FakeIssuer::default()), Vec::new());

        let err = resolver.resolve("/DC=org/CN=bob", "user").await.unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(err.kind(), ErrorKind::NoCredential);
        assert_eq!(
            err.to_string(),
            "cannot obtain credential for '/DC=org/CN=bob'@'user': '/DC=org/CN=bob'@'user' has no proxy registered"
        );
    }

    #[tokio::test]
    async fn test_issuer_outage_is_transient() {
        let issuer = Arc::new(FakeIssuer {
            down: true,
            ..Default::default()
        });
        let resolver = CredentialResolver::new(directory(), issuer, Vec::new());

        let err = resolver.resolve("/DC=org/CN=alice", "user").await.unwrap_err();

        assert!(!err.is_permanent());
        assert_eq!(err.kind(), ErrorKind::IdentityUnavailable);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_resolver_from_config() {
        let issuer = Arc::new(FakeIssuer {
            registered: vec!["/DC=org/CN=data manager".to_string()],
            ..Default::default()
        });
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            config_path: "/Agents/Test".to_string(),
            operation_handlers: Default::default(),
            shifters: vec![ShifterSpec::new("DataManager", "dm", "prod")],
            credential_policy: CredentialPolicy {
                min_validity: Duration::from_secs(600),
                cache_hint: Duration::from_secs(3600),
            },
            finalize_policy: Default::default(),
        };

        let resolver = CredentialResolver::from_config(directory(), issuer.clone(), &config);
        let identity = resolver
            .resolve("/DC=org/CN=data manager", "prod")
            .await
            .unwrap();

        assert_eq!(identity.shifters, vec!["DataManager"]);
        assert_eq!(resolver.policy(), config.credential_policy);
        let calls = issuer.calls.lock().unwrap();
        assert_eq!(calls[0].min_validity, Duration::from_secs(600));
        assert_eq!(calls[0].cache_hint, Duration::from_secs(3600));
    }

    #[test]
    fn test_shifter_spec_parse() {
        assert_eq!(
            ShifterSpec::parse("DataManager=dm:prod"),
            Some(ShifterSpec::new("DataManager", "dm", "prod"))
        );
        assert_eq!(
            ShifterSpec::parse(" Admin = root : admin "),
            Some(ShifterSpec::new("Admin", "root", "admin"))
        );
        assert_eq!(ShifterSpec::parse("DataManager=dm"), None);
        assert_eq!(ShifterSpec::parse("=dm:prod"), None);
        assert_eq!(ShifterSpec::parse("DataManager"), None);
    }
}
