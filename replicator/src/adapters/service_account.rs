use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::ServiceAccount;

use super::{Replicate, remove_op};
use crate::Context;

impl Replicate for ServiceAccount {
    fn copy_payload(source: &Self, target: &mut Self, _ctx: &Context) -> Option<Vec<String>> {
        target.image_pull_secrets = source.image_pull_secrets.clone();
        None
    }

    fn clear_payload(target: &Self) -> Vec<PatchOperation> {
        match target.image_pull_secrets {
            Some(_) => vec![remove_op(["imagePullSecrets"])],
            None => vec![],
        }
    }
}
