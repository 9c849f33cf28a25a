use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Batch, BatchStatus, Certificate, CertificateData, CertificateTemplate, Course, Enrollment,
    EnrollmentStatus, Student, WeekProgress,
};
use crate::store::{
    BatchStore, CertificateRenderer, CertificateStore, CourseStore, EnrollmentStore,
    InsertOutcome, ProgressStore, TemplateStore,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed implementation of every store boundary.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_status<T>(raw: String) -> EngineResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>()
        .map_err(|e| EngineError::Store(sqlx::Error::Decode(e.into())))
}

fn batch_from_row(row: &PgRow) -> EngineResult<Batch> {
    Ok(Batch {
        id: row.get("id"),
        name: row.get("name"),
        course_id: row.get("course_id"),
        status: decode_status::<BatchStatus>(row.get("status"))?,
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        progress_percentage: row.get("progress_percentage"),
        certificates_issued: row.get("certificates_issued"),
        is_active: row.get("is_active"),
        updated_at: row.get("updated_at"),
    })
}

fn enrollment_from_row(row: &PgRow) -> EngineResult<Enrollment> {
    Ok(Enrollment {
        id: row.get("id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        status: decode_status::<EnrollmentStatus>(row.get("status"))?,
        progress_percentage: row.get("progress_percentage"),
        updated_at: row.get("updated_at"),
    })
}

fn certificate_from_row(row: &PgRow) -> Certificate {
    Certificate {
        id: row.get("id"),
        student_id: row.get("student_id"),
        course_id: row.get("course_id"),
        enrollment_id: row.get("enrollment_id"),
        template_id: row.get("template_id"),
        artifact_url: row.get("artifact_url"),
        metadata: row.get("metadata"),
        issued_at: row.get("issued_at"),
    }
}

#[async_trait]
impl CourseStore for PgStore {
    async fn get(&self, course_id: Uuid) -> EngineResult<Course> {
        let row = sqlx::query(
            "SELECT id, name, duration_weeks, has_certificate \
             FROM batch_certificates.courses WHERE id = $1",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("course {course_id}")))?;

        Ok(Course {
            id: row.get("id"),
            name: row.get("name"),
            duration_weeks: row.get("duration_weeks"),
            has_certificate: row.get("has_certificate"),
        })
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn get(&self, batch_id: Uuid) -> EngineResult<Batch> {
        let row = sqlx::query(
            "SELECT id, name, course_id, status, start_date, end_date, \
             progress_percentage, certificates_issued, is_active, updated_at \
             FROM batch_certificates.batches WHERE id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("batch {batch_id}")))?;

        batch_from_row(&row)
    }

    async fn update(&self, batch: &Batch) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE batch_certificates.batches \
             SET name = $2, course_id = $3, status = $4, start_date = $5, end_date = $6, \
                 progress_percentage = $7, certificates_issued = $8, is_active = $9, \
                 updated_at = $10 \
             WHERE id = $1",
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.course_id)
        .bind(batch.status.as_str())
        .bind(batch.start_date)
        .bind(batch.end_date)
        .bind(batch.progress_percentage)
        .bind(batch.certificates_issued)
        .bind(batch.is_active)
        .bind(batch.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("batch {}", batch.id)));
        }
        Ok(())
    }

    async fn roster(&self, batch_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT student_id FROM batch_certificates.batch_students \
             WHERE batch_id = $1 ORDER BY student_id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("student_id")).collect())
    }

    async fn assign_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO batch_certificates.batch_students (batch_id, student_id) \
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(batch_id)
        .bind(student_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_student(&self, batch_id: Uuid, student_id: Uuid) -> EngineResult<()> {
        sqlx::query(
            "DELETE FROM batch_certificates.batch_students \
             WHERE batch_id = $1 AND student_id = $2",
        )
        .bind(batch_id)
        .bind(student_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, batch_id: Uuid) -> EngineResult<()> {
        // Roster and week rows go with the batch via ON DELETE CASCADE;
        // enrollments and certificates stay.
        sqlx::query("DELETE FROM batch_certificates.batches WHERE id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn completed_weeks(&self, batch_id: Uuid) -> EngineResult<Vec<WeekProgress>> {
        let rows = sqlx::query(
            "SELECT batch_id, week_number, completed_at, completed_by \
             FROM batch_certificates.week_progress \
             WHERE batch_id = $1 ORDER BY week_number",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| WeekProgress {
                batch_id: row.get("batch_id"),
                week_number: row.get("week_number"),
                completed_at: row.get("completed_at"),
                completed_by: row.get("completed_by"),
            })
            .collect())
    }

    async fn record_completed(&self, progress: &WeekProgress) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO batch_certificates.week_progress \
             (batch_id, week_number, completed_at, completed_by) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (batch_id, week_number) DO UPDATE \
             SET completed_at = EXCLUDED.completed_at, completed_by = EXCLUDED.completed_by",
        )
        .bind(progress.batch_id)
        .bind(progress.week_number)
        .bind(progress.completed_at)
        .bind(progress.completed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_week(&self, batch_id: Uuid, week_number: i32) -> EngineResult<()> {
        sqlx::query(
            "DELETE FROM batch_certificates.week_progress \
             WHERE batch_id = $1 AND week_number = $2",
        )
        .bind(batch_id)
        .bind(week_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_batch(&self, batch_id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM batch_certificates.week_progress WHERE batch_id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn get(&self, enrollment_id: Uuid) -> EngineResult<Enrollment> {
        let row = sqlx::query(
            "SELECT id, student_id, course_id, status, progress_percentage, updated_at \
             FROM batch_certificates.enrollments WHERE id = $1",
        )
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("enrollment {enrollment_id}")))?;

        enrollment_from_row(&row)
    }

    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Enrollment>> {
        let rows = sqlx::query(
            "SELECT id, student_id, course_id, status, progress_percentage, updated_at \
             FROM batch_certificates.enrollments WHERE course_id = $1",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(enrollment_from_row).collect()
    }

    async fn update(&self, enrollment: &Enrollment) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE batch_certificates.enrollments \
             SET status = $2, progress_percentage = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(enrollment.id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.progress_percentage)
        .bind(enrollment.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("enrollment {}", enrollment.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for PgStore {
    async fn list_for_course(&self, course_id: Uuid) -> EngineResult<Vec<Certificate>> {
        let rows = sqlx::query(
            "SELECT id, student_id, course_id, enrollment_id, template_id, \
             artifact_url, metadata, issued_at \
             FROM batch_certificates.certificates WHERE course_id = $1",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(certificate_from_row).collect())
    }

    async fn find(&self, student_id: Uuid, course_id: Uuid) -> EngineResult<Option<Certificate>> {
        let row = sqlx::query(
            "SELECT id, student_id, course_id, enrollment_id, template_id, \
             artifact_url, metadata, issued_at \
             FROM batch_certificates.certificates \
             WHERE student_id = $1 AND course_id = $2",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(certificate_from_row))
    }

    async fn insert(&self, certificate: &Certificate) -> EngineResult<InsertOutcome> {
        // The UNIQUE (student_id, course_id) constraint decides the race;
        // a conflicted insert affects zero rows.
        let result = sqlx::query(
            "INSERT INTO batch_certificates.certificates \
             (id, student_id, course_id, enrollment_id, template_id, \
              artifact_url, metadata, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (student_id, course_id) DO NOTHING",
        )
        .bind(certificate.id)
        .bind(certificate.student_id)
        .bind(certificate.course_id)
        .bind(certificate.enrollment_id)
        .bind(certificate.template_id)
        .bind(&certificate.artifact_url)
        .bind(&certificate.metadata)
        .bind(certificate.issued_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::DuplicatePair)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn replace_artifact(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        artifact_url: &str,
        metadata: &serde_json::Value,
    ) -> EngineResult<Certificate> {
        let row = sqlx::query(
            "UPDATE batch_certificates.certificates \
             SET artifact_url = $3, metadata = $4 \
             WHERE student_id = $1 AND course_id = $2 \
             RETURNING id, student_id, course_id, enrollment_id, template_id, \
                       artifact_url, metadata, issued_at",
        )
        .bind(student_id)
        .bind(course_id)
        .bind(artifact_url)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            EngineError::NotFound(format!("certificate for {student_id}/{course_id}"))
        })?;

        Ok(certificate_from_row(&row))
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn get(&self, template_id: Uuid) -> EngineResult<Option<CertificateTemplate>> {
        let row = sqlx::query(
            "SELECT id, name, body FROM batch_certificates.certificate_templates WHERE id = $1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CertificateTemplate {
            id: row.get("id"),
            name: row.get("name"),
            body: row.get("body"),
        }))
    }

    async fn list_for_teacher(&self, teacher_id: Uuid) -> EngineResult<Vec<CertificateTemplate>> {
        let rows = sqlx::query(
            "SELECT t.id, t.name, t.body \
             FROM batch_certificates.certificate_templates t \
             JOIN batch_certificates.certificate_assignments a ON a.template_id = t.id \
             WHERE a.teacher_id = $1 ORDER BY t.name",
        )
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CertificateTemplate {
                id: row.get("id"),
                name: row.get("name"),
                body: row.get("body"),
            })
            .collect())
    }
}

/// The shipped rendering collaborator: substitutes template placeholders
/// and writes a markdown artifact to disk, returning its path. PDF
/// rendering lives elsewhere; this keeps the boundary exercised end to end.
pub struct MarkdownRenderer {
    pool: PgPool,
    out_dir: PathBuf,
}

impl MarkdownRenderer {
    pub fn new(pool: PgPool, out_dir: PathBuf) -> Self {
        Self { pool, out_dir }
    }
}

#[async_trait]
impl CertificateRenderer for MarkdownRenderer {
    async fn render(
        &self,
        template: &CertificateTemplate,
        data: &CertificateData,
    ) -> Result<String, String> {
        let student_name = sqlx::query(
            "SELECT full_name FROM batch_certificates.students WHERE id = $1",
        )
        .bind(data.student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?
        .map(|row| row.get::<String, _>("full_name"))
        .unwrap_or_else(|| data.student_id.to_string());

        let body = template
            .body
            .replace("{{student_name}}", &student_name)
            .replace("{{course_name}}", &data.course_name)
            .replace("{{issued_on}}", &data.issued_on.to_string());

        std::fs::create_dir_all(&self.out_dir).map_err(|e| e.to_string())?;
        let path = self
            .out_dir
            .join(format!("{}-{}.md", data.student_id, data.course_id));
        std::fs::write(&path, body).map_err(|e| e.to_string())?;
        Ok(path.display().to_string())
    }
}

pub async fn create_batch(
    pool: &PgPool,
    name: &str,
    course_id: Option<Uuid>,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO batch_certificates.batches (id, name, course_id, updated_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(name)
    .bind(course_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to create batch")?;
    Ok(id)
}

pub async fn fetch_students(pool: &PgPool, ids: &[Uuid]) -> anyhow::Result<Vec<Student>> {
    let rows = sqlx::query(
        "SELECT id, full_name, email FROM batch_certificates.students WHERE id = ANY($1)",
    )
    .bind(ids)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Student {
            id: row.get("id"),
            full_name: row.get("full_name"),
            email: row.get("email"),
        })
        .collect())
}

pub async fn fetch_student_names(
    pool: &PgPool,
    ids: &[Uuid],
) -> anyhow::Result<HashMap<Uuid, String>> {
    let students = fetch_students(pool, ids).await?;
    Ok(students.into_iter().map(|s| (s.id, s.full_name)).collect())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let course_id = Uuid::parse_str("7c4a7f46-5ac1-4f41-9a83-2d9a3f6e1b07")?;
    sqlx::query(
        r#"
        INSERT INTO batch_certificates.courses (id, name, duration_weeks, has_certificate)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name, duration_weeks = EXCLUDED.duration_weeks,
            has_certificate = EXCLUDED.has_certificate
        "#,
    )
    .bind(course_id)
    .bind("Data Analytics Foundations")
    .bind(6)
    .bind(true)
    .execute(pool)
    .await?;

    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery Lee",
            "avery.lee@groupscholar.com",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
        ),
    ];

    let batch_id = Uuid::parse_str("9b7a1f0e-6a34-4e5e-8f0a-1d2c3b4a5968")?;
    sqlx::query(
        r#"
        INSERT INTO batch_certificates.batches (id, name, course_id, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(batch_id)
    .bind("2026 spring cohort")
    .bind(course_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    for (student_id, name, email) in students {
        sqlx::query(
            r#"
            INSERT INTO batch_certificates.students (id, full_name, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(student_id)
        .bind(name)
        .bind(email)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO batch_certificates.batch_students (batch_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(batch_id)
        .bind(student_id)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO batch_certificates.enrollments
            (id, student_id, course_id, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id, course_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(course_id)
        .bind(EnrollmentStatus::Approved.as_str())
        .bind(Utc::now())
        .execute(pool)
        .await?;
    }

    let template_id = Uuid::parse_str("5f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0")?;
    sqlx::query(
        r#"
        INSERT INTO batch_certificates.certificate_templates (id, name, body)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(template_id)
    .bind("Completion Certificate")
    .bind(
        "# Certificate of Completion\n\n{{student_name}} has completed \
         {{course_name}} on {{issued_on}}.\n",
    )
    .execute(pool)
    .await?;

    let teacher_id = Uuid::parse_str("11f6c8ad-09a4-4d5b-9f5e-7e2b6c0d8a31")?;
    sqlx::query(
        r#"
        INSERT INTO batch_certificates.certificate_assignments (template_id, teacher_id)
        VALUES ($1, $2)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(template_id)
    .bind(teacher_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn import_enrollments(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        course_id: Uuid,
        status: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let status = match row.status.as_deref() {
            Some(raw) => raw
                .parse::<EnrollmentStatus>()
                .map_err(anyhow::Error::msg)?,
            None => EnrollmentStatus::Pending,
        };

        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO batch_certificates.students (id, full_name, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.full_name)
        .bind(&row.email)
        .fetch_one(pool)
        .await?
        .get("id");

        let result = sqlx::query(
            r#"
            INSERT INTO batch_certificates.enrollments
            (id, student_id, course_id, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id, course_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(row.course_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}
