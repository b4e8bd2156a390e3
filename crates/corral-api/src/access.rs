//! Access decisions
//!
//! Every authorization question the pipeline asks is an [`AccessReview`]
//! answered by an [`AccessReviewer`]. The production reviewer posts a
//! `SubjectAccessReview` to the local API server; downstream clusters answer
//! the same shape through their proxy handle.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Verb used for every impersonation check
pub const IMPERSONATE_VERB: &str = "impersonate";

/// API group of the `userextras` resource
pub const AUTHENTICATION_GROUP: &str = "authentication.k8s.io";

/// One resource-attribute access question about a subject
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessReview {
    /// Subject user name
    pub user: String,
    /// Subject uid
    pub uid: String,
    /// Subject groups
    pub groups: Vec<String>,
    /// Subject extras
    pub extra: BTreeMap<String, Vec<String>>,
    /// Verb being checked
    pub verb: String,
    /// API group of the resource
    pub api_group: String,
    /// Resource type
    pub resource: String,
    /// Subresource, e.g. the extra key for `userextras`
    pub subresource: Option<String>,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: Option<String>,
}

impl AccessReview {
    /// Ask whether `subject` may `verb` the `resource` named `name`
    pub fn new(
        subject: &Identity,
        verb: &str,
        api_group: &str,
        resource: &str,
        name: &str,
    ) -> Self {
        Self {
            user: subject.name.clone(),
            uid: subject.uid.clone(),
            groups: subject.groups.clone(),
            extra: subject.extra.clone(),
            verb: verb.to_string(),
            api_group: api_group.to_string(),
            resource: resource.to_string(),
            subresource: None,
            name: name.to_string(),
            namespace: None,
        }
    }

    /// Scope the question to a namespace
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Scope the question to a subresource
    pub fn with_subresource(mut self, subresource: &str) -> Self {
        self.subresource = Some(subresource.to_string());
        self
    }

    /// `resource` or `resource/subresource`
    pub fn resource_path(&self) -> String {
        match &self.subresource {
            Some(sub) => format!("{}/{}", self.resource, sub),
            None => self.resource.clone(),
        }
    }

    /// Kubernetes `SubjectAccessReview` asking the same question
    pub fn to_subject_access_review(&self) -> SubjectAccessReview {
        SubjectAccessReview {
            metadata: Default::default(),
            spec: SubjectAccessReviewSpec {
                user: Some(self.user.clone()),
                uid: (!self.uid.is_empty()).then(|| self.uid.clone()),
                groups: Some(self.groups.clone()),
                extra: (!self.extra.is_empty()).then(|| self.extra.clone()),
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(self.verb.clone()),
                    group: Some(self.api_group.clone()),
                    resource: Some(self.resource.clone()),
                    subresource: self.subresource.clone(),
                    name: Some(self.name.clone()),
                    namespace: self.namespace.clone(),
                    ..Default::default()
                }),
                non_resource_attributes: None,
            },
            status: None,
        }
    }
}

/// Answers access reviews
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the review's subject is allowed
    async fn review(&self, review: &AccessReview) -> Result<bool>;
}

/// Reviewer backed by the local API server's SubjectAccessReview endpoint
pub struct KubeAccessReviewer {
    client: Client,
}

impl KubeAccessReviewer {
    /// Create a reviewer using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review(&self, review: &AccessReview) -> Result<bool> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let result = api
            .create(&PostParams::default(), &review.to_subject_access_review())
            .await
            .map_err(|e| Error::Internal(format!("SubjectAccessReview API error: {e}")))?;

        let allowed = result.status.map(|s| s.allowed).unwrap_or(false);
        debug!(
            user = %review.user,
            verb = %review.verb,
            resource = %review.resource_path(),
            name = %review.name,
            allowed,
            "SubjectAccessReview"
        );
        Ok(allowed)
    }
}

/// Whether `real` may impersonate user `target`
pub async fn can_impersonate_user(
    reviewer: &dyn AccessReviewer,
    real: &Identity,
    target: &str,
) -> Result<bool> {
    reviewer
        .review(&AccessReview::new(real, IMPERSONATE_VERB, "", "users", target))
        .await
}

/// Whether `real` may impersonate group `group`
pub async fn can_impersonate_group(
    reviewer: &dyn AccessReviewer,
    real: &Identity,
    group: &str,
) -> Result<bool> {
    reviewer
        .review(&AccessReview::new(real, IMPERSONATE_VERB, "", "groups", group))
        .await
}

/// Whether `real` may assert every extra value in `extras`
///
/// One review per key/value pair; the first denial stops the batch.
pub async fn can_impersonate_extras(
    reviewer: &dyn AccessReviewer,
    real: &Identity,
    extras: &BTreeMap<String, Vec<String>>,
) -> Result<bool> {
    for (key, values) in extras {
        for value in values {
            let review =
                AccessReview::new(real, IMPERSONATE_VERB, AUTHENTICATION_GROUP, "userextras", value)
                    .with_subresource(key);
            if !reviewer.review(&review).await? {
                debug!(user = %real.name, key = %key, "Extra impersonation denied");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Review for impersonating service account `name` in `namespace`
pub fn service_account_review(real: &Identity, namespace: &str, name: &str) -> AccessReview {
    AccessReview::new(real, IMPERSONATE_VERB, "", "serviceaccounts", name).in_namespace(namespace)
}
