//! Enrollment approval gate: pending -> approved | rejected, and the
//! externally-driven approved -> completed transition. Rejection is
//! terminal; retrying takes a fresh enrollment.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Enrollment, EnrollmentStatus};
use crate::store::EnrollmentStore;

#[derive(Clone)]
pub struct EnrollmentApprovalWorkflow {
    enrollments: Arc<dyn EnrollmentStore>,
}

impl EnrollmentApprovalWorkflow {
    pub fn new(enrollments: Arc<dyn EnrollmentStore>) -> Self {
        Self { enrollments }
    }

    pub async fn approve(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.transition(enrollment_id, EnrollmentStatus::Pending, EnrollmentStatus::Approved)
            .await
    }

    pub async fn reject(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.transition(enrollment_id, EnrollmentStatus::Pending, EnrollmentStatus::Rejected)
            .await
    }

    /// The completion event fed in by attendance/grading, or by batch
    /// completion.
    pub async fn mark_completed(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.transition(
            enrollment_id,
            EnrollmentStatus::Approved,
            EnrollmentStatus::Completed,
        )
        .await
    }

    /// Teacher-entered per-student percentage, separate from batch-level
    /// week progress.
    pub async fn set_student_progress(
        &self,
        enrollment_id: Uuid,
        percent: i32,
    ) -> EngineResult<Enrollment> {
        if !(0..=100).contains(&percent) {
            return Err(EngineError::Validation(format!(
                "progress percentage {percent} is outside 0..=100"
            )));
        }
        let mut enrollment = self.enrollments.get(enrollment_id).await?;
        enrollment.progress_percentage = Some(percent);
        enrollment.updated_at = Utc::now();
        self.enrollments.update(&enrollment).await?;
        Ok(enrollment)
    }

    async fn transition(
        &self,
        enrollment_id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> EngineResult<Enrollment> {
        let mut enrollment = self.enrollments.get(enrollment_id).await?;
        if enrollment.status != from {
            return Err(EngineError::InvalidState(format!(
                "enrollment {enrollment_id} is {}, expected {from}",
                enrollment.status
            )));
        }
        enrollment.status = to;
        enrollment.updated_at = Utc::now();
        self.enrollments.update(&enrollment).await?;
        info!(enrollment = %enrollment_id, from = %from, to = %to, "enrollment transitioned");
        Ok(enrollment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn pending(store: &Arc<MemoryStore>) -> Uuid {
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            status: EnrollmentStatus::Pending,
            progress_percentage: None,
            updated_at: Utc::now(),
        };
        let id = enrollment.id;
        store.add_enrollment(enrollment);
        id
    }

    #[tokio::test]
    async fn approve_then_complete() {
        let store = Arc::new(MemoryStore::new());
        let id = pending(&store);
        let workflow = EnrollmentApprovalWorkflow::new(store.clone());

        let approved = workflow.approve(id).await.unwrap();
        assert_eq!(approved.status, EnrollmentStatus::Approved);

        let completed = workflow.mark_completed(id).await.unwrap();
        assert_eq!(completed.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn approving_twice_is_an_invalid_transition() {
        let store = Arc::new(MemoryStore::new());
        let id = pending(&store);
        let workflow = EnrollmentApprovalWorkflow::new(store.clone());

        workflow.approve(id).await.unwrap();
        let err = workflow.approve(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let id = pending(&store);
        let workflow = EnrollmentApprovalWorkflow::new(store.clone());

        workflow.reject(id).await.unwrap();
        assert!(matches!(
            workflow.approve(id).await.unwrap_err(),
            EngineError::InvalidState(_)
        ));
        assert!(matches!(
            workflow.mark_completed(id).await.unwrap_err(),
            EngineError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn completing_a_pending_enrollment_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let id = pending(&store);
        let workflow = EnrollmentApprovalWorkflow::new(store.clone());

        let err = workflow.mark_completed(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn student_progress_is_bounded_and_stored() {
        let store = Arc::new(MemoryStore::new());
        let id = pending(&store);
        let workflow = EnrollmentApprovalWorkflow::new(store.clone());

        let err = workflow.set_student_progress(id, 120).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let updated = workflow.set_student_progress(id, 45).await.unwrap();
        assert_eq!(updated.progress_percentage, Some(45));
        // Independent of any batch-level percentage.
        assert_eq!(updated.status, EnrollmentStatus::Pending);
    }
}
