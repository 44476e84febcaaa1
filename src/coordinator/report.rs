//! Structured operation results

use serde::Serialize;

/// Outcome of one administrative operation.
///
/// `actions` lists the topology and metadata changes performed, or in a dry
/// run the changes that would have been performed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationReport {
    pub operation: String,
    pub dry_run: bool,
    pub messages: Vec<String>,
    pub warnings: Vec<String>,
    pub actions: Vec<String>,
}

impl OperationReport {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[{}] {}", self.operation, message);
        self.messages.push(message);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("[{}] {}", self.operation, warning);
        self.warnings.push(warning);
    }

    pub fn action(&mut self, action: impl Into<String>) {
        let action = action.into();
        if self.dry_run {
            tracing::info!("[{}] (dry run) would {}", self.operation, action);
        } else {
            tracing::debug!("[{}] {}", self.operation, action);
        }
        self.actions.push(action);
    }

    /// Nothing was (or would be) changed
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

pub(crate) const SPLIT_BRAIN_WARNING: &str =
    "This operation bypasses the normal safety checks: members or clusters left out may still \
     accept writes and cause a split-brain, and transactions not yet replicated may be lost. \
     Excluded members must be explicitly rejoined or removed.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_collects_entries() {
        let mut report = OperationReport::new("setPrimaryCluster").with_dry_run(true);
        assert!(report.is_noop());
        report.action("promote cluster 'R'");
        report.warn("cluster 'X' will be invalidated");
        report.info("done");
        assert!(!report.is_noop());
        assert!(report.dry_run);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["actions"][0], "promote cluster 'R'");
        assert_eq!(json["warnings"].as_array().unwrap().len(), 1);
    }
}
