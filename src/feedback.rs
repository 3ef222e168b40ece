//! Operator feedback: false-alarm reports and per-entity monitoring toggles.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::baseline::BaselineStore;
use crate::detect::{DetectError, Finding, FindingLog};
use crate::entity::{Entity, EntityRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct FalseAlarmOutcome {
    pub finding: Finding,
    /// The entity's sensitivity after the report.
    pub sensitivity: f64,
    /// False when the finding had already been reported.
    pub adjusted: bool,
}

pub struct FeedbackAdjuster {
    findings: FindingLog,
    store: Arc<BaselineStore>,
    registry: Arc<EntityRegistry>,
    step: f64,
    floor: f64,
}

impl FeedbackAdjuster {
    pub fn new(
        findings: FindingLog,
        store: Arc<BaselineStore>,
        registry: Arc<EntityRegistry>,
        step: f64,
        floor: f64,
    ) -> Self {
        Self {
            findings,
            store,
            registry,
            step,
            floor,
        }
    }

    /// Mark a finding as a false positive and make its entity less
    /// sensitive, as one write. Reporting the same finding again changes
    /// nothing.
    pub async fn report_false_alarm(
        &self,
        finding_id: Uuid,
        reason: Option<String>,
    ) -> Result<FalseAlarmOutcome, DetectError> {
        let finding = self.find(finding_id).await?;
        let entity = finding.entity_id.as_str();

        let lowered = self
            .store
            .record_false_alarm(entity, finding_id, reason, self.step, self.floor)
            .await?;
        let Some(sensitivity) = lowered else {
            return Ok(FalseAlarmOutcome {
                sensitivity: self.store.sensitivity(entity),
                finding,
                adjusted: false,
            });
        };
        info!(entity = %entity, finding = %finding_id, sensitivity, "false alarm reported");

        Ok(FalseAlarmOutcome {
            finding: self.find(finding_id).await?,
            sensitivity,
            adjusted: true,
        })
    }

    async fn find(&self, finding_id: Uuid) -> Result<Finding, DetectError> {
        self.findings
            .get(finding_id)
            .await?
            .ok_or(DetectError::FindingNotFound(finding_id))
    }

    /// Turn evaluation of one entity on or off from the next tier tick.
    pub async fn report_monitoring_toggle(
        &self,
        entity_id: &str,
        enabled: bool,
    ) -> Result<Entity, DetectError> {
        let entity = self.registry.set_enabled(entity_id, enabled).await?;
        info!(entity = %entity_id, enabled, "entity monitoring toggled");
        Ok(entity)
    }
}
