use std::collections::HashMap;
use std::fmt::Write;

use uuid::Uuid;

use crate::models::{Batch, Certificate, Course, Enrollment, ProgressSummary};

pub fn build_report(
    batch: &Batch,
    course: &Course,
    summary: &ProgressSummary,
    roster_size: usize,
    eligible: &[Enrollment],
    certificates: &[Certificate],
    student_names: &HashMap<Uuid, String>,
) -> String {
    let display = |id: Uuid| {
        student_names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    };
    let mut output = String::new();

    let _ = writeln!(output, "# Batch Report: {}", batch.name);
    let _ = writeln!(
        output,
        "Course: {} ({} weeks, status {})",
        course.name, course.duration_weeks, batch.status
    );
    match (batch.start_date, batch.end_date) {
        (Some(start), Some(end)) => {
            let _ = writeln!(output, "Runs {start} to {end}.");
        }
        _ => {
            let _ = writeln!(output, "No run dates set.");
        }
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Progress");
    let _ = writeln!(
        output,
        "{} of {} weeks completed ({}%).",
        summary.completed_weeks, summary.duration_weeks, summary.percentage
    );

    for week in summary.weeks.iter() {
        match week.completed_at {
            Some(at) => {
                let _ = writeln!(
                    output,
                    "- Week {}: completed {}",
                    week.week_number,
                    at.date_naive()
                );
            }
            None => {
                let _ = writeln!(output, "- Week {}: pending", week.week_number);
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Certificates");
    let _ = writeln!(
        output,
        "{} students on roster, {} issued, {} still eligible.",
        roster_size,
        certificates.len(),
        eligible.len()
    );

    let mut recent: Vec<&Certificate> = certificates.iter().collect();
    recent.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
    if recent.is_empty() {
        let _ = writeln!(output, "No certificates issued yet.");
    } else {
        for certificate in recent.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} issued {} ({})",
                display(certificate.student_id),
                certificate.issued_at.date_naive(),
                certificate.artifact_url
            );
        }
    }

    if !eligible.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Awaiting Issuance");
        for enrollment in eligible.iter() {
            let _ = writeln!(output, "- {}", display(enrollment.student_id));
        }
    }

    if batch.certificates_issued {
        let _ = writeln!(output);
        let _ = writeln!(output, "All eligible certificates have been issued.");
    }

    output
}
