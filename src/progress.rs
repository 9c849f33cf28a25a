//! Sequential weekly progress. Completed weeks for a batch always form a
//! contiguous prefix {1..k}: week k+1 is the only week that can be
//! completed and week k the only one that can be un-completed. The count is
//! recomputed from the stored rows on every call, inside a per-batch
//! critical section, so concurrent updates cannot skip or gap the prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as RegistryMutex};

use chrono::Utc;
use tokio::sync::Mutex as BatchMutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::BatchLifecycle;
use crate::models::{BatchStatus, ProgressSummary, WeekProgress, WeekState};
use crate::store::{BatchStore, CourseStore, ProgressStore};

/// Gate a single week change against the current prefix length. Pure; the
/// tracker calls this with a freshly-read count.
pub fn validate_week_change(
    completed_count: i32,
    duration_weeks: i32,
    week_number: i32,
    complete: bool,
) -> EngineResult<()> {
    if week_number < 1 || week_number > duration_weeks {
        return Err(EngineError::Validation(format!(
            "week {week_number} is outside the course range 1..={duration_weeks}"
        )));
    }
    if complete {
        if week_number <= completed_count {
            return Err(EngineError::SequenceViolation(format!(
                "week {week_number} is already completed"
            )));
        }
        let next = completed_count + 1;
        if week_number != next {
            return Err(EngineError::SequenceViolation(format!(
                "complete week {next} first"
            )));
        }
    } else {
        if week_number > completed_count {
            return Err(EngineError::SequenceViolation(format!(
                "week {week_number} is not completed"
            )));
        }
        if week_number != completed_count {
            return Err(EngineError::SequenceViolation(format!(
                "only week {completed_count}, the latest completed week, can be marked incomplete"
            )));
        }
    }
    Ok(())
}

pub fn percentage(completed_count: i32, duration_weeks: i32) -> i32 {
    if duration_weeks <= 0 {
        return 0;
    }
    ((f64::from(completed_count) * 100.0) / f64::from(duration_weeks)).round() as i32
}

pub struct WeeklyProgressTracker {
    batches: Arc<dyn BatchStore>,
    courses: Arc<dyn CourseStore>,
    progress: Arc<dyn ProgressStore>,
    lifecycle: BatchLifecycle,
    locks: RegistryMutex<HashMap<Uuid, Arc<BatchMutex<()>>>>,
}

impl WeeklyProgressTracker {
    pub fn new(
        batches: Arc<dyn BatchStore>,
        courses: Arc<dyn CourseStore>,
        progress: Arc<dyn ProgressStore>,
        lifecycle: BatchLifecycle,
    ) -> Self {
        Self {
            batches,
            courses,
            progress,
            lifecycle,
            locks: RegistryMutex::new(HashMap::new()),
        }
    }

    fn batch_lock(&self, batch_id: Uuid) -> Arc<BatchMutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(batch_id)
            .or_insert_with(|| Arc::new(BatchMutex::new(())))
            .clone()
    }

    /// Complete or un-complete one week for a batch. Serialized per batch:
    /// of two concurrent "complete week k+1" calls exactly one wins, the
    /// other re-reads the prefix and gets a `SequenceViolation`.
    pub async fn set_week_status(
        &self,
        batch_id: Uuid,
        week_number: i32,
        complete: bool,
        actor: Uuid,
    ) -> EngineResult<()> {
        let lock = self.batch_lock(batch_id);
        let _guard = lock.lock().await;

        let mut batch = self.batches.get(batch_id).await?;
        match batch.status {
            BatchStatus::NotStarted => {
                return Err(EngineError::Precondition(format!(
                    "batch {} has not started",
                    batch.name
                )))
            }
            BatchStatus::Completed => {
                return Err(EngineError::Precondition(format!(
                    "batch {} is completed, restart it to change weekly progress",
                    batch.name
                )))
            }
            BatchStatus::Archived => {
                return Err(EngineError::Precondition(format!(
                    "batch {} is archived",
                    batch.name
                )))
            }
            BatchStatus::Active | BatchStatus::InProgress => {}
        }
        let course_id = batch.course_id.ok_or_else(|| {
            EngineError::Precondition(format!("batch {} has no course assigned", batch.name))
        })?;
        let course = self.courses.get(course_id).await?;

        let completed_count = self.progress.completed_weeks(batch_id).await?.len() as i32;
        validate_week_change(completed_count, course.duration_weeks, week_number, complete)?;

        if complete {
            self.progress
                .record_completed(&WeekProgress {
                    batch_id,
                    week_number,
                    completed_at: Utc::now(),
                    completed_by: actor,
                })
                .await?;
        } else {
            self.progress.clear_week(batch_id, week_number).await?;
        }

        let new_count = if complete {
            completed_count + 1
        } else {
            completed_count - 1
        };
        batch.progress_percentage = percentage(new_count, course.duration_weeks);
        if new_count > 0 && batch.status == BatchStatus::Active {
            batch.status = BatchStatus::InProgress;
        }
        batch.updated_at = Utc::now();
        self.batches.update(&batch).await?;
        info!(
            batch = %batch_id,
            week = week_number,
            complete = complete,
            percentage = batch.progress_percentage,
            "weekly progress updated"
        );

        if new_count == course.duration_weeks {
            self.lifecycle.mark_completed(batch_id).await?;
        }
        Ok(())
    }

    /// Read-only view of a batch's weekly progress, recomputed from the
    /// stored rows on every call.
    pub async fn progress_summary(&self, batch_id: Uuid) -> EngineResult<ProgressSummary> {
        let batch = self.batches.get(batch_id).await?;
        let course_id = batch.course_id.ok_or_else(|| {
            EngineError::Precondition(format!("batch {} has no course assigned", batch.name))
        })?;
        let course = self.courses.get(course_id).await?;

        let rows = self.progress.completed_weeks(batch_id).await?;
        let by_week: HashMap<i32, &WeekProgress> =
            rows.iter().map(|w| (w.week_number, w)).collect();
        let weeks = (1..=course.duration_weeks)
            .map(|n| match by_week.get(&n) {
                Some(w) => WeekState {
                    week_number: n,
                    completed: true,
                    completed_at: Some(w.completed_at),
                    completed_by: Some(w.completed_by),
                },
                None => WeekState {
                    week_number: n,
                    completed: false,
                    completed_at: None,
                    completed_by: None,
                },
            })
            .collect();

        let completed_weeks = rows.len() as i32;
        Ok(ProgressSummary {
            batch_id,
            completed_weeks,
            duration_weeks: course.duration_weeks,
            percentage: percentage(completed_weeks, course.duration_weeks),
            weeks,
        })
    }
}
