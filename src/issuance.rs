//! Certificate issuance coordination. Single issuance re-checks
//! eligibility at write time and funnels every bulk flow (per-batch,
//! per-course, ad-hoc lists) through one aggregation path: every requested
//! enrollment gets exactly one outcome and no failure aborts the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::eligibility;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    BatchStatus, Certificate, CertificateData, CertificateTemplate, EnrollmentStatus,
    IssueFailure, IssueOutcome, IssueReport, IssueResult,
};
use crate::store::{
    BatchStore, CertificateRenderer, CertificateStore, CourseStore, EnrollmentStore,
    InsertOutcome, TemplateStore,
};

#[derive(Clone)]
pub struct IssuanceCoordinator {
    enrollments: Arc<dyn EnrollmentStore>,
    certificates: Arc<dyn CertificateStore>,
    courses: Arc<dyn CourseStore>,
    batches: Arc<dyn BatchStore>,
    templates: Arc<dyn TemplateStore>,
    renderer: Arc<dyn CertificateRenderer>,
    issuer_timeout: Duration,
}

impl IssuanceCoordinator {
    pub fn new(
        enrollments: Arc<dyn EnrollmentStore>,
        certificates: Arc<dyn CertificateStore>,
        courses: Arc<dyn CourseStore>,
        batches: Arc<dyn BatchStore>,
        templates: Arc<dyn TemplateStore>,
        renderer: Arc<dyn CertificateRenderer>,
        issuer_timeout: Duration,
    ) -> Self {
        Self {
            enrollments,
            certificates,
            courses,
            batches,
            templates,
            renderer,
            issuer_timeout,
        }
    }

    /// Issue a certificate for one enrollment. Eligibility is re-checked
    /// here at write time; a store-level duplicate on (student, course)
    /// comes back as `AlreadyCertified`, never as a second certificate.
    pub async fn issue_one(
        &self,
        enrollment_id: Uuid,
        template_id: Uuid,
    ) -> EngineResult<IssueOutcome> {
        let enrollment = self.enrollments.get(enrollment_id).await?;
        if enrollment.status != EnrollmentStatus::Completed {
            return Ok(IssueOutcome::Failed(IssueFailure::EnrollmentNotCompleted));
        }
        let course = self.courses.get(enrollment.course_id).await?;
        if !course.has_certificate {
            return Ok(IssueOutcome::Failed(IssueFailure::CourseNotCertifiable));
        }
        let Some(template) = self.templates.get(template_id).await? else {
            return Ok(IssueOutcome::Failed(IssueFailure::TemplateNotFound));
        };
        // Read-time filter only; the insert below carries the guarantee.
        if self
            .certificates
            .find(enrollment.student_id, enrollment.course_id)
            .await?
            .is_some()
        {
            return Ok(IssueOutcome::Failed(IssueFailure::AlreadyCertified));
        }

        let data = CertificateData {
            student_id: enrollment.student_id,
            course_id: course.id,
            course_name: course.name.clone(),
            issued_on: Utc::now().date_naive(),
        };
        let artifact_url = match self.render_with_timeout(&template, &data).await {
            Ok(url) => url,
            Err(detail) => return Ok(IssueOutcome::Failed(IssueFailure::Issuer(detail))),
        };

        let certificate = Certificate {
            id: Uuid::new_v4(),
            student_id: enrollment.student_id,
            course_id: course.id,
            enrollment_id: enrollment.id,
            template_id: template.id,
            artifact_url,
            metadata: serde_json::json!({
                "template": template.name,
                "course": course.name,
            }),
            issued_at: Utc::now(),
        };
        match self.certificates.insert(&certificate).await? {
            InsertOutcome::Inserted => {
                info!(
                    student = %certificate.student_id,
                    course = %certificate.course_id,
                    "certificate issued"
                );
                Ok(IssueOutcome::Issued(certificate))
            }
            InsertOutcome::DuplicatePair => {
                Ok(IssueOutcome::Failed(IssueFailure::AlreadyCertified))
            }
        }
    }

    /// Issue for many enrollments at once. Each enrollment is attempted
    /// independently on its own task; the report carries exactly one
    /// outcome per requested id, in request order. Engine faults for a
    /// single item (lookup or store failure) become that item's failure
    /// outcome rather than aborting the rest, and dispatched items always
    /// run to completion.
    pub async fn issue_many(&self, enrollment_ids: &[Uuid], template_id: Uuid) -> IssueReport {
        let mut handles = Vec::with_capacity(enrollment_ids.len());
        for &enrollment_id in enrollment_ids {
            let coordinator = self.clone();
            handles.push((
                enrollment_id,
                tokio::spawn(async move {
                    coordinator.issue_one(enrollment_id, template_id).await
                }),
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (enrollment_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => IssueOutcome::Failed(IssueFailure::Issuer(err.to_string())),
                Err(err) => {
                    IssueOutcome::Failed(IssueFailure::Issuer(format!("issuance task failed: {err}")))
                }
            };
            results.push(IssueResult {
                enrollment_id,
                outcome,
            });
        }

        let report = IssueReport { results };
        info!(
            requested = enrollment_ids.len(),
            succeeded = report.success_count(),
            failed = report.fail_count(),
            "bulk issuance finished"
        );
        report
    }

    /// Bulk-issue for everyone still eligible on a completed batch. A fully
    /// successful run flips the batch's `certificates_issued` flag.
    pub async fn issue_for_batch(
        &self,
        batch_id: Uuid,
        template_id: Uuid,
    ) -> EngineResult<IssueReport> {
        let mut batch = self.batches.get(batch_id).await?;
        if batch.status != BatchStatus::Completed {
            return Err(EngineError::Precondition(format!(
                "batch {} is {}, certificates can only be issued for completed batches",
                batch.name, batch.status
            )));
        }
        let course_id = batch.course_id.ok_or_else(|| {
            EngineError::Precondition(format!("batch {} has no course assigned", batch.name))
        })?;
        let course = self.courses.get(course_id).await?;
        if !course.has_certificate {
            return Err(EngineError::Precondition(format!(
                "course {} does not award certificates",
                course.name
            )));
        }

        let roster = self.batches.roster(batch_id).await?;
        let enrollments = self.enrollments.list_for_course(course_id).await?;
        let certificates = self.certificates.list_for_course(course_id).await?;
        let eligible =
            eligibility::eligible_for_batch(&batch, &roster, &enrollments, &certificates)?;
        let ids: Vec<Uuid> = eligible.iter().map(|e| e.id).collect();

        let report = self.issue_many(&ids, template_id).await;
        if report.is_full_success() {
            batch.certificates_issued = true;
            batch.updated_at = Utc::now();
            self.batches.update(&batch).await?;
        }
        Ok(report)
    }

    /// Course-wide bulk flow across all batches of the course.
    pub async fn issue_for_course(
        &self,
        course_id: Uuid,
        template_id: Uuid,
    ) -> EngineResult<IssueReport> {
        let course = self.courses.get(course_id).await?;
        if !course.has_certificate {
            return Err(EngineError::Precondition(format!(
                "course {} does not award certificates",
                course.name
            )));
        }
        let enrollments = self.enrollments.list_for_course(course_id).await?;
        let certificates = self.certificates.list_for_course(course_id).await?;
        let eligible = eligibility::eligible_for_course(course_id, &enrollments, &certificates);
        let ids: Vec<Uuid> = eligible.iter().map(|e| e.id).collect();
        Ok(self.issue_many(&ids, template_id).await)
    }

    /// Re-render the artifact of an existing certificate. The (student,
    /// course) identity key never changes; only the artifact is replaced.
    pub async fn regenerate(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        template_id: Uuid,
    ) -> EngineResult<Certificate> {
        let existing = self
            .certificates
            .find(student_id, course_id)
            .await?
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "no certificate exists for student {student_id} on course {course_id}"
                ))
            })?;
        let template = self
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("template {template_id}")))?;
        let course = self.courses.get(course_id).await?;

        let data = CertificateData {
            student_id,
            course_id,
            course_name: course.name.clone(),
            issued_on: Utc::now().date_naive(),
        };
        let artifact_url = self
            .render_with_timeout(&template, &data)
            .await
            .map_err(EngineError::Issuer)?;
        let metadata = serde_json::json!({
            "template": template.name,
            "course": course.name,
            "regenerated": true,
        });
        let updated = self
            .certificates
            .replace_artifact(student_id, course_id, &artifact_url, &metadata)
            .await?;
        info!(certificate = %existing.id, "certificate regenerated");
        Ok(updated)
    }

    /// One bounded attempt per call; retrying is the caller's decision.
    async fn render_with_timeout(
        &self,
        template: &CertificateTemplate,
        data: &CertificateData,
    ) -> Result<String, String> {
        match tokio::time::timeout(self.issuer_timeout, self.renderer.render(template, data)).await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "render timed out after {}ms",
                self.issuer_timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailingRenderer, MemoryStore, SlowRenderer, StaticRenderer};
    use crate::models::{Batch, Course, Enrollment};
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<MemoryStore>,
        course_id: Uuid,
        template_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let course = Course {
            id: Uuid::new_v4(),
            name: "Data Analytics Foundations".to_string(),
            duration_weeks: 6,
            has_certificate: true,
        };
        let template = CertificateTemplate {
            id: Uuid::new_v4(),
            name: "Completion Certificate".to_string(),
            body: "{{student_id}} completed {{course_name}} on {{issued_on}}".to_string(),
        };
        let course_id = course.id;
        let template_id = template.id;
        store.add_course(course);
        store.add_template(template);
        Fixture {
            store,
            course_id,
            template_id,
        }
    }

    fn coordinator(
        store: &Arc<MemoryStore>,
        renderer: Arc<dyn CertificateRenderer>,
    ) -> IssuanceCoordinator {
        IssuanceCoordinator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            renderer,
            Duration::from_secs(5),
        )
    }

    fn enrollment(fixture: &Fixture, status: EnrollmentStatus) -> Enrollment {
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: fixture.course_id,
            status,
            progress_percentage: None,
            updated_at: Utc::now(),
        };
        fixture.store.add_enrollment(enrollment.clone());
        enrollment
    }

    #[tokio::test]
    async fn issuing_removes_the_enrollment_from_the_eligible_set() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let enrollments = EnrollmentStore::list_for_course(fx.store.as_ref(), fx.course_id)
            .await
            .unwrap();
        let certs = CertificateStore::list_for_course(fx.store.as_ref(), fx.course_id)
            .await
            .unwrap();
        let eligible = eligibility::eligible_for_course(fx.course_id, &enrollments, &certs);
        assert_eq!(eligible.len(), 1);

        let outcome = coordinator.issue_one(e1.id, fx.template_id).await.unwrap();
        assert!(outcome.is_issued());

        let certs = CertificateStore::list_for_course(fx.store.as_ref(), fx.course_id)
            .await
            .unwrap();
        let eligible = eligibility::eligible_for_course(fx.course_id, &enrollments, &certs);
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn reissuing_an_already_certified_pair_fails_cleanly() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        assert!(coordinator
            .issue_one(e1.id, fx.template_id)
            .await
            .unwrap()
            .is_issued());
        let second = coordinator.issue_one(e1.id, fx.template_id).await.unwrap();
        assert!(matches!(
            second,
            IssueOutcome::Failed(IssueFailure::AlreadyCertified)
        ));
        assert_eq!(fx.store.certificate_count(), 1);
    }

    #[tokio::test]
    async fn incomplete_enrollments_and_missing_templates_fail_with_reasons() {
        let fx = fixture();
        let approved = enrollment(&fx, EnrollmentStatus::Approved);
        let completed = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let outcome = coordinator
            .issue_one(approved.id, fx.template_id)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IssueOutcome::Failed(IssueFailure::EnrollmentNotCompleted)
        ));

        let outcome = coordinator
            .issue_one(completed.id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IssueOutcome::Failed(IssueFailure::TemplateNotFound)
        ));
    }

    #[tokio::test]
    async fn courses_without_a_certificate_flag_refuse_issuance() {
        let fx = fixture();
        let course = Course {
            id: Uuid::new_v4(),
            name: "Interview Practice".to_string(),
            duration_weeks: 2,
            has_certificate: false,
        };
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            course_id: course.id,
            status: EnrollmentStatus::Completed,
            progress_percentage: None,
            updated_at: Utc::now(),
        };
        fx.store.add_course(course);
        fx.store.add_enrollment(enrollment.clone());
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let outcome = coordinator
            .issue_one(enrollment.id, fx.template_id)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IssueOutcome::Failed(IssueFailure::CourseNotCertifiable)
        ));
    }

    #[tokio::test]
    async fn renderer_failures_become_issuer_outcomes() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(FailingRenderer));

        let outcome = coordinator.issue_one(e1.id, fx.template_id).await.unwrap();
        assert!(matches!(
            outcome,
            IssueOutcome::Failed(IssueFailure::Issuer(_))
        ));
        assert_eq!(fx.store.certificate_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_renderers_hit_the_timeout() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = IssuanceCoordinator::new(
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
            fx.store.clone(),
            Arc::new(SlowRenderer {
                delay: Duration::from_secs(30),
            }),
            Duration::from_millis(50),
        );

        let outcome = coordinator.issue_one(e1.id, fx.template_id).await.unwrap();
        match outcome {
            IssueOutcome::Failed(IssueFailure::Issuer(detail)) => {
                assert!(detail.contains("timed out"), "unexpected detail: {detail}");
            }
            other => panic!("expected issuer timeout, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn parallel_issuance_for_one_pair_yields_exactly_one_certificate() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = Arc::new(coordinator(&fx.store, Arc::new(StaticRenderer)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let template_id = fx.template_id;
            let enrollment_id = e1.id;
            handles.push(tokio::spawn(async move {
                coordinator.issue_one(enrollment_id, template_id).await
            }));
        }

        let mut issued = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                IssueOutcome::Issued(_) => issued += 1,
                IssueOutcome::Failed(IssueFailure::AlreadyCertified) => duplicates += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(issued, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(fx.store.certificate_count(), 1);
    }

    #[tokio::test]
    async fn bulk_issuance_reports_one_outcome_per_enrollment() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let e2 = enrollment(&fx, EnrollmentStatus::Completed);
        let e3 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        // E2 is certified ahead of the bulk run.
        assert!(coordinator
            .issue_one(e2.id, fx.template_id)
            .await
            .unwrap()
            .is_issued());

        let report = coordinator
            .issue_many(&[e1.id, e2.id, e3.id], fx.template_id)
            .await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[0].enrollment_id, e1.id);
        assert!(report.results[0].outcome.is_issued());
        assert!(matches!(
            report.results[1].outcome,
            IssueOutcome::Failed(IssueFailure::AlreadyCertified)
        ));
        assert!(report.results[2].outcome.is_issued());
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.fail_count(), 1);
    }

    #[tokio::test]
    async fn bulk_issuance_is_total_even_for_unknown_ids() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let ghost = Uuid::new_v4();
        let report = coordinator.issue_many(&[e1.id, ghost], fx.template_id).await;
        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].outcome.is_issued());
        assert!(matches!(
            report.results[1].outcome,
            IssueOutcome::Failed(IssueFailure::Issuer(_))
        ));
    }

    fn completed_batch(fx: &Fixture) -> Uuid {
        let batch = Batch {
            id: Uuid::new_v4(),
            name: "2026 spring".to_string(),
            course_id: Some(fx.course_id),
            status: BatchStatus::Completed,
            start_date: None,
            end_date: None,
            progress_percentage: 100,
            certificates_issued: false,
            is_active: true,
            updated_at: Utc::now(),
        };
        let id = batch.id;
        fx.store.add_batch(batch);
        id
    }

    #[tokio::test]
    async fn batch_issuance_requires_a_completed_batch() {
        let fx = fixture();
        let batch_id = completed_batch(&fx);
        let mut batch = BatchStore::get(fx.store.as_ref(), batch_id).await.unwrap();
        batch.status = BatchStatus::InProgress;
        BatchStore::update(fx.store.as_ref(), &batch).await.unwrap();

        let err = coordinator(&fx.store, Arc::new(StaticRenderer))
            .issue_for_batch(batch_id, fx.template_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }

    #[tokio::test]
    async fn full_batch_success_flips_the_issued_flag() {
        let fx = fixture();
        let batch_id = completed_batch(&fx);
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let e2 = enrollment(&fx, EnrollmentStatus::Completed);
        fx.store.assign_student(batch_id, e1.student_id).await.unwrap();
        fx.store.assign_student(batch_id, e2.student_id).await.unwrap();

        let report = coordinator(&fx.store, Arc::new(StaticRenderer))
            .issue_for_batch(batch_id, fx.template_id)
            .await
            .unwrap();
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.fail_count(), 0);

        let batch = BatchStore::get(fx.store.as_ref(), batch_id).await.unwrap();
        assert!(batch.certificates_issued);
    }

    /// Renderer that refuses one specific student, for partial-failure runs.
    struct RejectStudent(Uuid);

    #[async_trait]
    impl CertificateRenderer for RejectStudent {
        async fn render(
            &self,
            template: &CertificateTemplate,
            data: &CertificateData,
        ) -> Result<String, String> {
            if data.student_id == self.0 {
                return Err("render rejected".to_string());
            }
            StaticRenderer.render(template, data).await
        }
    }

    #[tokio::test]
    async fn partial_batch_failure_leaves_the_issued_flag_unset() {
        let fx = fixture();
        let batch_id = completed_batch(&fx);
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let e2 = enrollment(&fx, EnrollmentStatus::Completed);
        fx.store.assign_student(batch_id, e1.student_id).await.unwrap();
        fx.store.assign_student(batch_id, e2.student_id).await.unwrap();

        let report = coordinator(&fx.store, Arc::new(RejectStudent(e2.student_id)))
            .issue_for_batch(batch_id, fx.template_id)
            .await
            .unwrap();
        assert_eq!(report.success_count(), 1);
        assert_eq!(report.fail_count(), 1);

        let batch = BatchStore::get(fx.store.as_ref(), batch_id).await.unwrap();
        assert!(!batch.certificates_issued);
    }

    #[tokio::test]
    async fn course_wide_issuance_covers_every_eligible_enrollment() {
        let fx = fixture();
        let _pending = enrollment(&fx, EnrollmentStatus::Pending);
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let e2 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let report = coordinator
            .issue_for_course(fx.course_id, fx.template_id)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.success_count(), 2);
        let issued_for: Vec<Uuid> = report.results.iter().map(|r| r.enrollment_id).collect();
        assert!(issued_for.contains(&e1.id));
        assert!(issued_for.contains(&e2.id));
    }

    #[tokio::test]
    async fn regenerate_replaces_the_artifact_but_keeps_the_identity() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let issued = match coordinator.issue_one(e1.id, fx.template_id).await.unwrap() {
            IssueOutcome::Issued(certificate) => certificate,
            other => panic!("expected issuance, got {other:?}"),
        };

        let regenerated = coordinator
            .regenerate(e1.student_id, fx.course_id, fx.template_id)
            .await
            .unwrap();
        assert_eq!(regenerated.id, issued.id);
        assert_eq!(regenerated.metadata["regenerated"], true);
        assert_eq!(fx.store.certificate_count(), 1);
    }

    #[tokio::test]
    async fn regenerate_without_an_existing_certificate_is_rejected() {
        let fx = fixture();
        let e1 = enrollment(&fx, EnrollmentStatus::Completed);
        let coordinator = coordinator(&fx.store, Arc::new(StaticRenderer));

        let err = coordinator
            .regenerate(e1.student_id, fx.course_id, fx.template_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }
}
