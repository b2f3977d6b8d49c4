use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::warn;

use super::Replicate;
use crate::{Context, Result};

/// Source_fqdn renders the cluster DNS name a replica points back at.
fn source_fqdn(source: &Service, cluster_domain: &str) -> String {
    format!(
        "{}.{}.svc.{}",
        source.name_any(),
        source.namespace().unwrap_or_default(),
        cluster_domain,
    )
}

impl Replicate for Service {
    /// A Service replica is not a copy: it is an ExternalName alias pointing
    /// back at the source service's cluster FQDN. Push only.
    fn copy_payload(source: &Self, target: &mut Self, ctx: &Context) -> Option<Vec<String>> {
        let mut spec = target.spec.take().unwrap_or_default();
        spec.type_ = Some("ExternalName".to_string());
        spec.external_name = Some(source_fqdn(source, &ctx.cluster_domain));
        spec.selector = None;
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        target.spec = Some(spec);
        None
    }

    fn clear_payload(_target: &Self) -> Vec<PatchOperation> {
        vec![]
    }

    fn before_push(
        source: &Self,
        ctx: &Context,
        _namespace: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        // Probe the name through the OS resolver. Out-of-cluster runs cannot
        // see the cluster domain, so failure is advisory.
        let fqdn = source_fqdn(source, &ctx.cluster_domain);
        async move {
            if let Err(err) = tokio::net::lookup_host((fqdn.as_str(), 0)).await {
                warn!(fqdn, error = %err, "replica target does not resolve from here");
            }
            Ok(())
        }
    }
}
