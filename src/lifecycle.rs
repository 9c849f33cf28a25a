//! Batch status state machine: not_started -> active -> in_progress ->
//! completed, with an archived side branch and a reset edge back to
//! not_started. All batch mutation goes through here or through the weekly
//! progress tracker; nothing else writes batch state.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Batch, BatchStatus, EnrollmentStatus};
use crate::store::{BatchStore, CourseStore, EnrollmentStore, ProgressStore};

#[derive(Clone)]
pub struct BatchLifecycle {
    batches: Arc<dyn BatchStore>,
    courses: Arc<dyn CourseStore>,
    progress: Arc<dyn ProgressStore>,
    enrollments: Arc<dyn EnrollmentStore>,
}

impl BatchLifecycle {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        courses: Arc<dyn CourseStore>,
        progress: Arc<dyn ProgressStore>,
        enrollments: Arc<dyn EnrollmentStore>,
    ) -> Self {
        Self {
            batches,
            courses,
            progress,
            enrollments,
        }
    }

    /// Bind a batch to a course. Only allowed before the batch starts.
    pub async fn assign_course(&self, batch_id: Uuid, course_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        if batch.status != BatchStatus::NotStarted {
            return Err(EngineError::Precondition(format!(
                "batch {} is {}, the course can only change before the batch starts",
                batch.name, batch.status
            )));
        }
        let course = self.courses.get(course_id).await?;
        batch.course_id = Some(course.id);
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        Ok(batch)
    }

    /// Start the batch today. Computes the end date from the course length.
    pub async fn start(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        if batch.status != BatchStatus::NotStarted {
            return Err(EngineError::Precondition(format!(
                "batch {} is {}, only a not-started batch can be started",
                batch.name, batch.status
            )));
        }
        let course_id = batch.course_id.ok_or_else(|| {
            EngineError::Precondition(format!(
                "batch {} has no course assigned",
                batch.name
            ))
        })?;
        let course = self.courses.get(course_id).await?;

        let start = Utc::now().date_naive();
        batch.start_date = Some(start);
        batch.end_date = Some(start + Duration::days(i64::from(course.duration_weeks) * 7));
        batch.status = BatchStatus::Active;
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        info!(batch = %batch.id, course = %course.id, "batch started");
        Ok(batch)
    }

    /// Set explicit run dates. On a not-started batch this doubles as the
    /// start action and promotes it to active.
    pub async fn set_dates(
        &self,
        batch_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Batch> {
        if end <= start {
            return Err(EngineError::Validation(format!(
                "end date {end} must be after start date {start}"
            )));
        }
        let mut batch = self.batches.get(batch_id).await?;
        if batch.status == BatchStatus::Archived {
            return Err(EngineError::Precondition(format!(
                "batch {} is archived",
                batch.name
            )));
        }
        batch.start_date = Some(start);
        batch.end_date = Some(end);
        if batch.status == BatchStatus::NotStarted {
            batch.status = BatchStatus::Active;
        }
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        Ok(batch)
    }

    /// Reset the batch to a blank not-started state, wiping all weekly
    /// progress. Restarting a not-started batch is a no-op success.
    pub async fn restart(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        match batch.status {
            BatchStatus::NotStarted => return Ok(batch),
            BatchStatus::Archived => {
                return Err(EngineError::Precondition(format!(
                    "batch {} is archived",
                    batch.name
                )))
            }
            BatchStatus::Active | BatchStatus::InProgress | BatchStatus::Completed => {}
        }
        self.progress.clear_batch(batch_id).await?;
        batch.start_date = None;
        batch.end_date = None;
        batch.progress_percentage = 0;
        batch.certificates_issued = false;
        batch.status = BatchStatus::NotStarted;
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        info!(batch = %batch.id, "batch restarted");
        Ok(batch)
    }

    /// Close out a fully-progressed batch. Requires every curriculum week
    /// to be completed, then marks the roster's approved enrollments as
    /// completed so they become certificate-eligible.
    pub async fn mark_completed(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        match batch.status {
            BatchStatus::Completed => return Ok(batch),
            BatchStatus::NotStarted | BatchStatus::Archived => {
                return Err(EngineError::Precondition(format!(
                    "batch {} is {}, it cannot be completed",
                    batch.name, batch.status
                )))
            }
            BatchStatus::Active | BatchStatus::InProgress => {}
        }
        let course_id = batch.course_id.ok_or_else(|| {
            EngineError::Precondition(format!("batch {} has no course assigned", batch.name))
        })?;
        let course = self.courses.get(course_id).await?;
        let completed = self.progress.completed_weeks(batch_id).await?.len() as i32;
        if completed != course.duration_weeks {
            return Err(EngineError::Precondition(format!(
                "batch {} has completed {completed} of {} weeks",
                batch.name, course.duration_weeks
            )));
        }

        batch.status = BatchStatus::Completed;
        batch.progress_percentage = 100;
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;

        let roster = self.batches.roster(batch_id).await?;
        for mut enrollment in self.enrollments.list_for_course(course_id).await? {
            if enrollment.status == EnrollmentStatus::Approved
                && roster.contains(&enrollment.student_id)
            {
                enrollment.status = EnrollmentStatus::Completed;
                enrollment.updated_at = Utc::now();
                self.enrollments.update(&enrollment).await?;
            }
        }
        info!(batch = %batch.id, "batch completed");
        Ok(batch)
    }

    /// Terminal: an archived batch accepts no further transitions.
    pub async fn archive(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        if batch.status == BatchStatus::Archived {
            return Err(EngineError::Precondition(format!(
                "batch {} is already archived",
                batch.name
            )));
        }
        batch.status = BatchStatus::Archived;
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        info!(batch = %batch.id, "batch archived");
        Ok(batch)
    }

    /// Soft delete, the default removal path.
    pub async fn deactivate(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let mut batch = self.batches.get(batch_id).await?;
        batch.is_active = false;
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        Ok(batch)
    }

    /// Hard delete of the batch record, roster and progress rows only;
    /// enrollments and certificates survive.
    pub async fn delete(&self, batch_id: Uuid) -> EngineResult<()> {
        self.batches.get(batch_id).await?;
        self.batches.delete(batch_id).await
    }
}
