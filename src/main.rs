use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

mod db;
mod eligibility;
mod enrollment;
mod error;
mod issuance;
mod lifecycle;
#[cfg(test)]
mod memory;
mod models;
mod progress;
mod report;
mod store;

use crate::db::{MarkdownRenderer, PgStore};
use crate::enrollment::EnrollmentApprovalWorkflow;
use crate::issuance::IssuanceCoordinator;
use crate::lifecycle::BatchLifecycle;
use crate::models::{BatchStatus, IssueOutcome, IssueReport, Student};
use crate::progress::WeeklyProgressTracker;
use crate::store::{BatchStore, CertificateStore, CourseStore, EnrollmentStore, TemplateStore};

#[derive(Parser)]
#[command(name = "batch-certificates")]
#[command(about = "Batch lifecycle and certificate issuance for Group Scholar", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import enrollments from a CSV file
    ImportEnrollments {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Create a batch, optionally bound to a course
    CreateBatch {
        #[arg(long)]
        name: String,
        #[arg(long)]
        course: Option<Uuid>,
    },
    /// Bind a not-started batch to a course
    AssignCourse {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        course: Uuid,
    },
    /// Add a student to a batch roster
    AssignStudent {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        student: Uuid,
    },
    /// Remove a student from a batch roster
    RemoveStudent {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        student: Uuid,
    },
    /// Start a batch today
    StartBatch {
        #[arg(long)]
        batch: Uuid,
    },
    /// Set explicit run dates (also starts a not-started batch)
    SetDates {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Reset a batch to not-started, wiping weekly progress
    RestartBatch {
        #[arg(long)]
        batch: Uuid,
    },
    /// Archive a batch (terminal)
    ArchiveBatch {
        #[arg(long)]
        batch: Uuid,
    },
    /// Soft-delete a batch
    DeactivateBatch {
        #[arg(long)]
        batch: Uuid,
    },
    /// Hard-delete a batch record (enrollments and certificates survive)
    DeleteBatch {
        #[arg(long)]
        batch: Uuid,
    },
    /// Mark the next curriculum week as completed
    CompleteWeek {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        week: i32,
        #[arg(long)]
        teacher: Uuid,
    },
    /// Mark the latest completed week as incomplete
    UncompleteWeek {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        week: i32,
        #[arg(long)]
        teacher: Uuid,
    },
    /// Show a batch's weekly progress
    Progress {
        #[arg(long)]
        batch: Uuid,
    },
    /// Approve a pending enrollment
    Approve {
        #[arg(long)]
        enrollment: Uuid,
    },
    /// Reject a pending enrollment (terminal)
    Reject {
        #[arg(long)]
        enrollment: Uuid,
    },
    /// Mark an approved enrollment as completed
    CompleteEnrollment {
        #[arg(long)]
        enrollment: Uuid,
    },
    /// Record a teacher-entered per-student percentage
    SetStudentProgress {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long)]
        percent: i32,
    },
    /// List students eligible for a certificate
    #[command(group(
        ArgGroup::new("scope")
            .args(["course", "batch"])
            .required(true)
            .multiple(false)
    ))]
    Eligible {
        #[arg(long)]
        course: Option<Uuid>,
        #[arg(long)]
        batch: Option<Uuid>,
    },
    /// Issue a certificate for one enrollment
    Issue {
        #[arg(long)]
        enrollment: Uuid,
        #[arg(long)]
        template: Uuid,
    },
    /// Issue certificates for everyone eligible on a completed batch
    IssueBatch {
        #[arg(long)]
        batch: Uuid,
        #[arg(long)]
        template: Uuid,
    },
    /// Issue certificates for everyone eligible on a course
    IssueCourse {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        template: Uuid,
    },
    /// Re-render the artifact of an existing certificate
    Regenerate {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        template: Uuid,
    },
    /// List certificate templates assigned to a teacher
    Templates {
        #[arg(long)]
        teacher: Uuid,
    },
    /// Generate a markdown report for a batch
    Report {
        #[arg(long)]
        batch: Uuid,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let out_dir = std::env::var("CERTIFICATE_OUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("certificates"));
    let issuer_timeout = std::env::var("ISSUER_TIMEOUT_SECS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(10);

    let store = Arc::new(PgStore::new(pool.clone()));
    let lifecycle = BatchLifecycle::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let tracker = WeeklyProgressTracker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        lifecycle.clone(),
    );
    let workflow = EnrollmentApprovalWorkflow::new(store.clone());
    let renderer = Arc::new(MarkdownRenderer::new(pool.clone(), out_dir));
    let coordinator = IssuanceCoordinator::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        renderer,
        Duration::from_secs(issuer_timeout),
    );

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportEnrollments { csv } => {
            let inserted = db::import_enrollments(&pool, &csv).await?;
            println!("Inserted {inserted} enrollments from {}.", csv.display());
        }
        Commands::CreateBatch { name, course } => {
            let batch_id = db::create_batch(&pool, &name, course).await?;
            println!("Created batch {batch_id}.");
        }
        Commands::AssignCourse { batch, course } => {
            let updated = lifecycle.assign_course(batch, course).await?;
            println!("Batch {} bound to course {course}.", updated.name);
        }
        Commands::AssignStudent { batch, student } => {
            BatchStore::get(store.as_ref(), batch).await?;
            store.assign_student(batch, student).await?;
            println!("Student {student} added to batch {batch}.");
        }
        Commands::RemoveStudent { batch, student } => {
            store.remove_student(batch, student).await?;
            println!("Student {student} removed from batch {batch}.");
        }
        Commands::StartBatch { batch } => {
            let started = lifecycle.start(batch).await?;
            println!(
                "Batch {} started, runs {} to {}.",
                started.name,
                started.start_date.unwrap_or_default(),
                started.end_date.unwrap_or_default()
            );
        }
        Commands::SetDates { batch, start, end } => {
            let updated = lifecycle.set_dates(batch, start, end).await?;
            println!(
                "Batch {} now runs {start} to {end} (status {}).",
                updated.name, updated.status
            );
        }
        Commands::RestartBatch { batch } => {
            let reset = lifecycle.restart(batch).await?;
            println!("Batch {} reset to {}.", reset.name, reset.status);
        }
        Commands::ArchiveBatch { batch } => {
            let archived = lifecycle.archive(batch).await?;
            println!("Batch {} archived.", archived.name);
        }
        Commands::DeactivateBatch { batch } => {
            let updated = lifecycle.deactivate(batch).await?;
            println!("Batch {} deactivated.", updated.name);
        }
        Commands::DeleteBatch { batch } => {
            lifecycle.delete(batch).await?;
            println!("Batch {batch} deleted.");
        }
        Commands::CompleteWeek {
            batch,
            week,
            teacher,
        } => {
            tracker.set_week_status(batch, week, true, teacher).await?;
            let summary = tracker.progress_summary(batch).await?;
            println!(
                "Week {week} completed. Batch at {}% ({} of {} weeks).",
                summary.percentage, summary.completed_weeks, summary.duration_weeks
            );
        }
        Commands::UncompleteWeek {
            batch,
            week,
            teacher,
        } => {
            tracker.set_week_status(batch, week, false, teacher).await?;
            let summary = tracker.progress_summary(batch).await?;
            println!(
                "Week {week} reopened. Batch at {}% ({} of {} weeks).",
                summary.percentage, summary.completed_weeks, summary.duration_weeks
            );
        }
        Commands::Progress { batch } => {
            let summary = tracker.progress_summary(batch).await?;
            println!(
                "{} of {} weeks completed ({}%).",
                summary.completed_weeks, summary.duration_weeks, summary.percentage
            );
            for week in summary.weeks.iter() {
                match week.completed_at {
                    Some(at) => println!(
                        "- Week {}: completed {}",
                        week.week_number,
                        at.date_naive()
                    ),
                    None => println!("- Week {}: pending", week.week_number),
                }
            }
        }
        Commands::Approve { enrollment } => {
            let updated = workflow.approve(enrollment).await?;
            println!("Enrollment {enrollment} is now {}.", updated.status);
        }
        Commands::Reject { enrollment } => {
            let updated = workflow.reject(enrollment).await?;
            println!("Enrollment {enrollment} is now {}.", updated.status);
        }
        Commands::CompleteEnrollment { enrollment } => {
            let updated = workflow.mark_completed(enrollment).await?;
            println!("Enrollment {enrollment} is now {}.", updated.status);
        }
        Commands::SetStudentProgress {
            enrollment,
            percent,
        } => {
            workflow.set_student_progress(enrollment, percent).await?;
            println!("Enrollment {enrollment} progress set to {percent}%.");
        }
        Commands::Eligible { course, batch } => {
            let eligible = if let Some(course_id) = course {
                let enrollments =
                    EnrollmentStore::list_for_course(store.as_ref(), course_id).await?;
                let certificates =
                    CertificateStore::list_for_course(store.as_ref(), course_id).await?;
                eligibility::eligible_for_course(course_id, &enrollments, &certificates)
            } else {
                let batch_id = batch.context("either --course or --batch is required")?;
                let batch = BatchStore::get(store.as_ref(), batch_id).await?;
                let course_id = batch.course_id.context("batch has no course assigned")?;
                let roster = store.roster(batch_id).await?;
                let enrollments =
                    EnrollmentStore::list_for_course(store.as_ref(), course_id).await?;
                let certificates =
                    CertificateStore::list_for_course(store.as_ref(), course_id).await?;
                eligibility::eligible_for_batch(&batch, &roster, &enrollments, &certificates)?
            };

            if eligible.is_empty() {
                println!("No students are awaiting a certificate.");
                return Ok(());
            }
            let student_ids: Vec<Uuid> = eligible.iter().map(|e| e.student_id).collect();
            let students = db::fetch_students(&pool, &student_ids).await?;
            let by_id: HashMap<Uuid, Student> =
                students.into_iter().map(|s| (s.id, s)).collect();
            let mut lines: Vec<(String, Uuid)> = eligible
                .iter()
                .map(|e| {
                    let label = by_id
                        .get(&e.student_id)
                        .map(|s| format!("{} <{}>", s.full_name, s.email))
                        .unwrap_or_else(|| e.student_id.to_string());
                    (label, e.id)
                })
                .collect();
            lines.sort();
            println!("Eligible for a certificate:");
            for (name, enrollment_id) in lines {
                println!("- {name} (enrollment {enrollment_id})");
            }
        }
        Commands::Issue {
            enrollment,
            template,
        } => match coordinator.issue_one(enrollment, template).await? {
            IssueOutcome::Issued(certificate) => {
                println!("Issued: {}", certificate.artifact_url);
            }
            IssueOutcome::Failed(reason) => {
                println!("Not issued: {reason}.");
            }
        },
        Commands::IssueBatch { batch, template } => {
            let report = coordinator.issue_for_batch(batch, template).await?;
            print_issue_report(&report);
            if report.is_full_success() {
                println!("Batch marked as fully certified.");
            }
        }
        Commands::IssueCourse { course, template } => {
            let report = coordinator.issue_for_course(course, template).await?;
            print_issue_report(&report);
        }
        Commands::Regenerate {
            student,
            course,
            template,
        } => {
            let certificate = coordinator.regenerate(student, course, template).await?;
            println!("Regenerated: {}", certificate.artifact_url);
        }
        Commands::Templates { teacher } => {
            let templates = TemplateStore::list_for_teacher(store.as_ref(), teacher).await?;
            if templates.is_empty() {
                println!("No templates assigned.");
            } else {
                for template in templates {
                    println!("- {} ({})", template.name, template.id);
                }
            }
        }
        Commands::Report { batch, out } => {
            let batch_record = BatchStore::get(store.as_ref(), batch).await?;
            let course_id = batch_record
                .course_id
                .context("batch has no course assigned")?;
            let course = CourseStore::get(store.as_ref(), course_id).await?;
            let summary = tracker.progress_summary(batch).await?;
            let roster = store.roster(batch).await?;
            let enrollments = EnrollmentStore::list_for_course(store.as_ref(), course_id).await?;
            let certificates =
                CertificateStore::list_for_course(store.as_ref(), course_id).await?;
            let eligible = if batch_record.status == BatchStatus::Completed {
                eligibility::eligible_for_batch(
                    &batch_record,
                    &roster,
                    &enrollments,
                    &certificates,
                )?
            } else {
                Vec::new()
            };

            let mut ids: Vec<Uuid> = roster.clone();
            ids.extend(certificates.iter().map(|c| c.student_id));
            let names = db::fetch_student_names(&pool, &ids).await?;

            let report = report::build_report(
                &batch_record,
                &course,
                &summary,
                roster.len(),
                &eligible,
                &certificates,
                &names,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn print_issue_report(report: &IssueReport) {
    for result in report.results.iter() {
        match &result.outcome {
            IssueOutcome::Issued(certificate) => {
                println!("- {}: issued {}", result.enrollment_id, certificate.artifact_url);
            }
            IssueOutcome::Failed(reason) => {
                println!("- {}: failed ({reason})", result.enrollment_id);
            }
        }
    }
    println!(
        "{} succeeded, {} failed.",
        report.success_count(),
        report.fail_count()
    );
}
