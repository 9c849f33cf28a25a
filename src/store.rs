//! Boundary contracts for persistence and the external issuance
//! collaborator. The engine services only ever talk to these traits;
//! `db` provides the Postgres implementations and `memory` the in-process
//! ones used by tests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{
    Batch, Certificate, CertificateData, CertificateTemplate, Course, Enrollment, WeekProgress,
};

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn get(&self, course_id: Uuid) -> EngineResult<Course>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn get(&self, batch_id: Uuid) -> EngineResult<Batch>;
    async fn update(&self, batch: &Batch) -> EngineResult<()>;
    async fn roster(&self, batch_id: Uuid) -> EngineResult<Vec<Uuid>>;
    async fn assign_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()>;
    async fn remove_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()>;
    /// Hard delete of the batch record, its roster rows and week progress.
    /// Enrollments and certificates are not cascaded.
    async fn delete(&self, batch_id: Uuid) -> EngineResult<()>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Completed weeks for a batch, ordered by week number.
    async fn completed_weeks(&self, batch_id: Uuid) -> EngineResult<Vec<WeekProgress>>;
    async fn record_completed(&self, progress: &WeekProgress) -> EngineResult<()>;
    async fn clear_week(&self, batch_id: Uuid, week_number: i32) -> EngineResult<()>;
    async fn clear_batch(&self, batch_id: Uuid) -> EngineResult<()>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn get(&self, enrollment_id: Uuid) -> EngineResult<Enrollment>;
    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Enrollment>>;
    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()>;
}

/// Result of a certificate insert attempt. The store enforces the
/// (student_id, course_id) uniqueness constraint; a lost race comes back as
/// `DuplicatePair`, never as a second row and never as a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicatePair,
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Certificate>>;
    async fn find(&self, student_id: Uuid, course_id: Uuid) -> EngineResult<Option<Certificate>>;
    async fn insert(&self, certificate: &Certificate) -> EngineResult<InsertOutcome>;
    /// Replace the artifact of an existing certificate in place. The
    /// (student, course) identity key never changes.
    async fn replace_artifact(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        artifact_url: &str,
        metadata: &serde_json::Value,
    ) -> EngineResult<Certificate>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, template_id: Uuid) -> EngineResult<Option<CertificateTemplate>>;
    async fn list_for_teacher(&self, teacher_id: Uuid) -> EngineResult<Vec<CertificateTemplate>>;
}

/// The external template-rendering collaborator. Treated as a fallible
/// remote call; the coordinator wraps every invocation in a timeout and
/// never retries on its own.
#[async_trait]
pub trait CertificateRenderer: Send + Sync {
    async fn render(
        &self,
        template: &CertificateTemplate,
        data: &CertificateData,
    ) -> Result<String, String>;
}
