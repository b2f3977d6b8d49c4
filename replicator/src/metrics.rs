//! Metrics contains the metrics setup for the controller.

/// OPERATIONS_TOTAL counts every successful mutation the controller performs
/// against the API server.
pub const OPERATIONS_TOTAL: &str = "replicator_kube_operations_total";

/// Operation labels a mutation for [`OPERATIONS_TOTAL`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::AsRefStr, strum::IntoStaticStr)]
pub enum Operation {
    /// A resource was created.
    Create,
    /// A resource was replaced.
    Update,
    /// A resource was patched.
    Patch,
    /// A resource was deleted.
    Delete,
}

/// Record increments the operation counter for one successful mutation.
pub fn record(kind: &str, namespace: &str, name: &str, operation: Operation) {
    let operation: &'static str = operation.into();
    metrics::counter!(
        OPERATIONS_TOTAL,
        "kind" => kind.to_string(),
        "namespace" => namespace.to_string(),
        "name" => name.to_string(),
        "operation" => operation,
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_labels() {
        assert_eq!(Operation::Create.as_ref(), "Create");
        assert_eq!(Operation::Delete.as_ref(), "Delete");
    }
}
