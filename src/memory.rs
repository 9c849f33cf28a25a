//! In-memory store implementations backing the engine tests. One mutex
//! around the whole state keeps certificate inserts atomic, mirroring the
//! uniqueness constraint the Postgres schema enforces.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Batch, Certificate, CertificateData, CertificateTemplate, Course, Enrollment, WeekProgress,
};
use crate::store::{
    BatchStore, CertificateRenderer, CertificateStore, CourseStore, EnrollmentStore,
    InsertOutcome, ProgressStore, TemplateStore,
};

#[derive(Default)]
struct State {
    courses: HashMap<Uuid, Course>,
    batches: HashMap<Uuid, Batch>,
    rosters: HashMap<Uuid, Vec<Uuid>>,
    weeks: HashMap<Uuid, Vec<WeekProgress>>,
    enrollments: HashMap<Uuid, Enrollment>,
    certificates: HashMap<(Uuid, Uuid), Certificate>,
    templates: HashMap<Uuid, CertificateTemplate>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_course(&self, course: Course) {
        self.state.lock().unwrap().courses.insert(course.id, course);
    }

    pub fn add_batch(&self, batch: Batch) {
        self.state.lock().unwrap().batches.insert(batch.id, batch);
    }

    pub fn add_enrollment(&self, enrollment: Enrollment) {
        let mut state = self.state.lock().unwrap();
        state.enrollments.insert(enrollment.id, enrollment);
    }

    pub fn add_template(&self, template: CertificateTemplate) {
        let mut state = self.state.lock().unwrap();
        state.templates.insert(template.id, template);
    }

    pub fn certificate_count(&self) -> usize {
        self.state.lock().unwrap().certificates.len()
    }
}

#[async_trait]
impl CourseStore for MemoryStore {
    async fn get(&self, course_id: Uuid) -> EngineResult<Course> {
        self.state
            .lock()
            .unwrap()
            .courses
            .get(&course_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("course {course_id}")))
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn get(&self, batch_id: Uuid) -> EngineResult<Batch> {
        self.state
            .lock()
            .unwrap()
            .batches
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))
    }

    async fn update(&self, batch: &Batch) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.batches.contains_key(&batch.id) {
            return Err(EngineError::NotFound(format!("batch {}", batch.id)));
        }
        state.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn roster(&self, batch_id: Uuid) -> EngineResult<Vec<Uuid>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .rosters
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn assign_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let roster = state.rosters.entry(batch_id).or_default();
        if !roster.contains(&student_id) {
            roster.push(student_id);
        }
        Ok(())
    }

    async fn remove_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(roster) = state.rosters.get_mut(&batch_id) {
            roster.retain(|id| *id != student_id);
        }
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.batches.remove(&batch_id);
        state.rosters.remove(&batch_id);
        state.weeks.remove(&batch_id);
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn completed_weeks(&self, batch_id: Uuid) -> EngineResult<Vec<WeekProgress>> {
        let state = self.state.lock().unwrap();
        let mut weeks = state.weeks.get(&batch_id).cloned().unwrap_or_default();
        weeks.sort_by_key(|w| w.week_number);
        Ok(weeks)
    }

    async fn record_completed(&self, progress: &WeekProgress) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let weeks = state.weeks.entry(progress.batch_id).or_default();
        weeks.retain(|w| w.week_number != progress.week_number);
        weeks.push(progress.clone());
        Ok(())
    }

    async fn clear_week(&self, batch_id: Uuid, week_number: i32) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(weeks) = state.weeks.get_mut(&batch_id) {
            weeks.retain(|w| w.week_number != week_number);
        }
        Ok(())
    }

    async fn clear_batch(&self, batch_id: Uuid) -> EngineResult<()> {
        self.state.lock().unwrap().weeks.remove(&batch_id);
        Ok(())
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn get(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        self.state
            .lock()
            .unwrap()
            .enrollments
            .get(&enrollment_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("enrollment {enrollment_id}")))
    }

    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Enrollment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .enrollments
            .values()
            .filter(|e| e.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.enrollments.contains_key(&enrollment.id) {
            return Err(EngineError::NotFound(format!("enrollment {}", enrollment.id)));
        }
        state.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Certificate>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .certificates
            .values()
            .filter(|c| c.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn find(&self, student_id: Uuid, course_id: Uuid) -> EngineResult<Option<Certificate>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .certificates
            .get(&(student_id, course_id))
            .cloned())
    }

    async fn insert(&self, certificate: &Certificate) -> EngineResult<InsertOutcome> {
        let mut state = self.state.lock().unwrap();
        let key = (certificate.student_id, certificate.course_id);
        if state.certificates.contains_key(&key) {
            return Ok(InsertOutcome::DuplicatePair);
        }
        state.certificates.insert(key, certificate.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn replace_artifact(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        artifact_url: &str,
        metadata: &serde_json::Value,
    ) -> EngineResult<Certificate> {
        let mut state = self.state.lock().unwrap();
        let certificate = state
            .certificates
            .get_mut(&(student_id, course_id))
            .ok_or_else(|| {
                EngineError::NotFound(format!("certificate for {student_id}/{course_id}"))
            })?;
        certificate.artifact_url = artifact_url.to_string();
        certificate.metadata = metadata.clone();
        Ok(certificate.clone())
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn get(&self, template_id: Uuid) -> EngineResult<Option<CertificateTemplate>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .templates
            .get(&template_id)
            .cloned())
    }

    async fn list_for_teacher(&self, _teacher_id: Uuid) -> EngineResult<Vec<CertificateTemplate>> {
        Ok(self.state.lock().unwrap().templates.values().cloned().collect())
    }
}

/// Renderer that always succeeds with a deterministic URL.
pub struct StaticRenderer;

#[async_trait]
impl CertificateRenderer for StaticRenderer {
    async fn render(
        &self,
        template: &CertificateTemplate,
        data: &CertificateData,
    ) -> Result<String, String> {
        Ok(format!(
            "memory://certificates/{}/{}-{}",
            template.id, data.student_id, data.course_id
        ))
    }
}

/// Renderer that always fails, for exercising issuer-error outcomes.
pub struct FailingRenderer;

#[async_trait]
impl CertificateRenderer for FailingRenderer {
    async fn render(
        &self,
        _template: &CertificateTemplate,
        _data: &CertificateData,
    ) -> Result<String, String> {
        Err("render service unavailable".to_string())
    }
}

/// Renderer that sleeps past any reasonable timeout.
pub struct SlowRenderer {
    pub delay: Duration,
}

#[async_trait]
impl CertificateRenderer for SlowRenderer {
    async fn render(
        &self,
        template: &CertificateTemplate,
        data: &CertificateData,
    ) -> Result<String, String> {
        tokio::time::sleep(self.delay).await;
        StaticRenderer.render(template, data).await
    }
}
