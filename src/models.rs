use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub duration_weeks: i32,
    pub has_certificate: bool,
}

/// Lifecycle states of a batch. Transitions are owned by `lifecycle` and
/// `progress`; nothing else writes a batch status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    NotStarted,
    Active,
    InProgress,
    Completed,
    Archived,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::NotStarted => "not_started",
            BatchStatus::Active => "active",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Archived => "archived",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(BatchStatus::NotStarted),
            "active" => Ok(BatchStatus::Active),
            "in_progress" => Ok(BatchStatus::InProgress),
            "completed" => Ok(BatchStatus::Completed),
            "archived" => Ok(BatchStatus::Archived),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub course_id: Option<Uuid>,
    pub status: BatchStatus,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Derived from completed week count; 0-100.
    pub progress_percentage: i32,
    pub certificates_issued: bool,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// A completed curriculum week. Rows exist only for completed weeks; the
/// contiguous prefix 1..k of a batch's rows is the source of truth for
/// batch progress.
#[derive(Debug, Clone)]
pub struct WeekProgress {
    pub batch_id: Uuid,
    pub week_number: i32,
    pub completed_at: DateTime<Utc>,
    pub completed_by: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Approved => "approved",
            EnrollmentStatus::Rejected => "rejected",
            EnrollmentStatus::Completed => "completed",
        }
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrollmentStatus::Pending),
            "approved" => Ok(EnrollmentStatus::Approved),
            "rejected" => Ok(EnrollmentStatus::Rejected),
            "completed" => Ok(EnrollmentStatus::Completed),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub status: EnrollmentStatus,
    /// Teacher-entered per-student percentage. Independent of the batch-level
    /// week progress; neither derives from the other.
    pub progress_percentage: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub enrollment_id: Uuid,
    pub template_id: Uuid,
    pub artifact_url: String,
    pub metadata: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub id: Uuid,
    pub name: String,
    pub body: String,
}

/// Everything the rendering collaborator needs to produce an artifact.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateData {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub course_name: String,
    pub issued_on: NaiveDate,
}

#[derive(Debug, Clone)]
pub enum IssueOutcome {
    Issued(Certificate),
    Failed(IssueFailure),
}

impl IssueOutcome {
    pub fn is_issued(&self) -> bool {
        matches!(self, IssueOutcome::Issued(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueFailure {
    AlreadyCertified,
    EnrollmentNotCompleted,
    TemplateNotFound,
    CourseNotCertifiable,
    Issuer(String),
}

impl fmt::Display for IssueFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueFailure::AlreadyCertified => write!(f, "already certified"),
            IssueFailure::EnrollmentNotCompleted => write!(f, "enrollment not completed"),
            IssueFailure::TemplateNotFound => write!(f, "template not found"),
            IssueFailure::CourseNotCertifiable => write!(f, "course does not award certificates"),
            IssueFailure::Issuer(detail) => write!(f, "issuer error: {detail}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueResult {
    pub enrollment_id: Uuid,
    pub outcome: IssueOutcome,
}

/// Aggregated bulk-issuance result: exactly one entry per requested
/// enrollment, in request order.
#[derive(Debug, Clone)]
pub struct IssueReport {
    pub results: Vec<IssueResult>,
}

impl IssueReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_issued()).count()
    }

    pub fn fail_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    pub fn is_full_success(&self) -> bool {
        self.fail_count() == 0
    }
}

#[derive(Debug, Clone)]
pub struct WeekState {
    pub week_number: i32,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub batch_id: Uuid,
    pub completed_weeks: i32,
    pub duration_weeks: i32,
    pub percentage: i32,
    pub weeks: Vec<WeekState>,
}
