use json_patch::PatchOperation;
use k8s_openapi::api::rbac::v1::Role;

use super::{Replicate, remove_op};
use crate::Context;

impl Replicate for Role {
    fn copy_payload(source: &Self, target: &mut Self, _ctx: &Context) -> Option<Vec<String>> {
        target.rules = source.rules.clone();
        None
    }

    fn clear_payload(target: &Self) -> Vec<PatchOperation> {
        match target.rules {
            Some(_) => vec![remove_op(["rules"])],
            None => vec![],
        }
    }
}
