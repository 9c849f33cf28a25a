use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Batch, BatchStatus, Certificate, Enrollment, EnrollmentStatus};

/// Read-time existence check. UI convenience only; the write-time guarantee
/// is the store's (student_id, course_id) uniqueness constraint.
pub fn has_certificate(student_id: Uuid, course_id: Uuid, certificates: &[Certificate]) -> bool {
    certificates
        .iter()
        .any(|c| c.student_id == student_id && c.course_id == course_id)
}

/// Enrollments that qualify for a certificate on this course: completed,
/// and no certificate exists yet for the (student, course) pair. Order is
/// unspecified; callers sort for display.
pub fn eligible_for_course(
    course_id: Uuid,
    enrollments: &[Enrollment],
    certificates: &[Certificate],
) -> Vec<Enrollment> {
    let certified: HashSet<(Uuid, Uuid)> = certificates
        .iter()
        .map(|c| (c.student_id, c.course_id))
        .collect();

    enrollments
        .iter()
        .filter(|e| {
            e.course_id == course_id
                && e.status == EnrollmentStatus::Completed
                && !certified.contains(&(e.student_id, e.course_id))
        })
        .cloned()
        .collect()
}

/// Course eligibility restricted to a batch roster. The batch must have
/// finished its run before anyone on it can be certified.
pub fn eligible_for_batch(
    batch: &Batch,
    roster: &[Uuid],
    enrollments: &[Enrollment],
    certificates: &[Certificate],
) -> EngineResult<Vec<Enrollment>> {
    if batch.status != BatchStatus::Completed {
        return Err(EngineError::Precondition(format!(
            "batch {} is {}, certificates can only be issued for completed batches",
            batch.name, batch.status
        )));
    }
    let course_id = batch.course_id.ok_or_else(|| {
        EngineError::Precondition(format!("batch {} has no course assigned", batch.name))
    })?;

    let members: HashSet<Uuid> = roster.iter().copied().collect();
    Ok(eligible_for_course(course_id, enrollments, certificates)
        .into_iter()
        .filter(|e| members.contains(&e.student_id))
        .collect())
}
