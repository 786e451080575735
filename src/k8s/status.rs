//! Status write-back contract.
//!
//! After every compile the control plane reports each object's computed
//! status through a [`StatusSink`]. Writes are best-effort: a failure is
//! logged and forgotten, because the next compile reports again anyway.

use tracing::info;

use crate::dag::ObjectStatus;
use crate::k8s::object::ObjectRef;
use crate::Result;

/// Best-effort status patch target.
pub trait StatusSink: Send + Sync {
    fn apply(&self, target: &ObjectRef, status: &ObjectStatus) -> Result<()>;
}

/// Default sink: statuses go to the structured log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn apply(&self, target: &ObjectRef, status: &ObjectStatus) -> Result<()> {
        info!(
            object = %target,
            condition = %status.condition,
            description = %status.description,
            "Object status"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ObjectStatus;

    #[test]
    fn log_sink_never_fails() {
        let sink = LogStatusSink;
        let status = ObjectStatus::valid("valid IngressRoute");
        assert!(sink.apply(&ObjectRef::new("default", "a"), &status).is_ok());
    }
}
