use json_patch::PatchOperation;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::Api;
use tokio::time::{Duration, sleep};
use tracing::debug;

use super::{Replicate, remove_op};
use crate::{Context, Result};

/// RoleBinding creation races the push of the Role it references when both
/// replicate into the same namespace; the API server rejects a binding whose
/// Role is missing. Bounded retry covers the window.
const ROLE_CHECK_ATTEMPTS: u32 = 5;
const ROLE_CHECK_BACKOFF: Duration = Duration::from_millis(100);

impl Replicate for RoleBinding {
    /// `roleRef` is immutable after creation, so only a fresh target takes
    /// the source's; an existing one keeps its own.
    fn copy_payload(source: &Self, target: &mut Self, _ctx: &Context) -> Option<Vec<String>> {
        target.subjects = source.subjects.clone();
        if target.role_ref.name.is_empty() {
            target.role_ref = source.role_ref.clone();
        }
        None
    }

    fn clear_payload(target: &Self) -> Vec<PatchOperation> {
        match target.subjects {
            Some(_) => vec![remove_op(["subjects"])],
            None => vec![],
        }
    }

    fn before_push(
        source: &Self,
        ctx: &Context,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            if source.role_ref.kind != "Role" {
                // ClusterRoles are not namespaced; nothing to wait for.
                return Ok(());
            }
            let name = &source.role_ref.name;
            let api: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
            for attempt in 1..=ROLE_CHECK_ATTEMPTS {
                if api.get_opt(name).await?.is_some() {
                    return Ok(());
                }
                debug!(role = %name, namespace, attempt, "referenced Role not there yet");
                if attempt < ROLE_CHECK_ATTEMPTS {
                    sleep(ROLE_CHECK_BACKOFF).await;
                }
            }
            Err(anyhow::anyhow!(
                "role {name:?} does not exist in namespace {namespace:?} after {ROLE_CHECK_ATTEMPTS} attempts"
            )
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::rbac::v1::{RoleRef, Subject};

    use super::*;

    fn binding(role: &str) -> RoleBinding {
        let mut rb = RoleBinding::default();
        rb.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: role.into(),
        };
        rb.subjects = Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: "runner".into(),
            ..Default::default()
        }]);
        rb
    }

    #[test_log::test(tokio::test)]
    async fn subjects_replaced_role_ref_taken_when_fresh() {
        let source = binding("reader");
        let mut fresh = RoleBinding::default();
        RoleBinding::copy_payload(&source, &mut fresh, &crate::testing::context());
        assert_eq!(fresh.role_ref.name, "reader");
        assert_eq!(fresh.subjects.as_ref().unwrap().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn existing_role_ref_is_never_rewritten() {
        let source = binding("reader");
        let mut existing = binding("writer");
        RoleBinding::copy_payload(&source, &mut existing, &crate::testing::context());
        assert_eq!(existing.role_ref.name, "writer");
        assert_eq!(existing.subjects, source.subjects);
    }
}
