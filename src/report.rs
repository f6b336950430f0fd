use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{Patient, Prediction, RiskCategory};

#[derive(Debug, Clone, PartialEq)]
pub struct CategorySummary {
    /// `None` groups patients that were never scored.
    pub category: Option<RiskCategory>,
    pub count: usize,
    pub avg_risk: f64,
}

pub fn summarize_by_category(patients: &[Patient]) -> Vec<CategorySummary> {
    let mut map: HashMap<Option<RiskCategory>, (usize, i32)> = HashMap::new();

    for patient in patients {
        let entry = map.entry(patient.risk_category).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += patient.risk_score.unwrap_or(0);
    }

    let mut summaries: Vec<CategorySummary> = map
        .into_iter()
        .map(|(category, (count, total_risk))| CategorySummary {
            category,
            count,
            avg_risk: if count == 0 {
                0.0
            } else {
                total_risk as f64 / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| b.category.cmp(&a.category)));
    summaries
}

pub fn build_report(
    patients: &[Patient],
    high_risk: &[Prediction],
    generated_at: DateTime<Utc>,
) -> String {
    let summaries = summarize_by_category(patients);
    let names: HashMap<_, _> = patients
        .iter()
        .map(|patient| (patient.id, patient.full_name.as_str()))
        .collect();

    let mut output = String::new();

    let _ = writeln!(output, "# Clinic Early Warning Report");
    let _ = writeln!(
        output,
        "Generated {} across {} patients",
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        patients.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No patients on record.");
    } else {
        for summary in summaries.iter() {
            let label = summary
                .category
                .map(RiskCategory::as_str)
                .unwrap_or("UNSCORED");
            let _ = writeln!(
                output,
                "- {}: {} patients (avg risk {:.1})",
                label, summary.count, summary.avg_risk
            );
        }
    }

    let mut scored: Vec<&Patient> = patients
        .iter()
        .filter(|patient| patient.risk_score.is_some())
        .collect();
    scored.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Patients");

    if scored.is_empty() {
        let _ = writeln!(output, "No patients have been scored yet.");
    } else {
        for patient in scored.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) risk {} [{}]",
                patient.full_name,
                patient.email,
                patient.risk_score.unwrap_or(0),
                patient
                    .risk_category
                    .map(RiskCategory::as_str)
                    .unwrap_or("UNSCORED")
            );
        }
    }

    let mut recent = high_risk.to_vec();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent High-Risk Predictions");

    if recent.is_empty() {
        let _ = writeln!(output, "No high-risk predictions recorded.");
    } else {
        for prediction in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} on {}: {} (risk {}, {} {}, confidence {:.2})",
                names
                    .get(&prediction.patient_id)
                    .copied()
                    .unwrap_or("unknown patient"),
                prediction.created_at.format("%Y-%m-%d"),
                prediction.recommendation,
                prediction.risk_level.unwrap_or(0),
                prediction.algorithm,
                prediction.model_version,
                prediction.confidence
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use crate::models::{Factors, PredictionType};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 8, 30, 0).unwrap()
    }

    fn patient(name: &str, risk: Option<(i32, RiskCategory)>) -> Patient {
        Patient {
            id: Uuid::new_v4(),
            full_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            date_of_birth: None,
            risk_score: risk.map(|(score, _)| score),
            risk_category: risk.map(|(_, category)| category),
            created_at: now(),
        }
    }

    #[test]
    fn groups_patients_by_cached_category() {
        let patients = vec![
            patient("Ada", Some((80, RiskCategory::Critical))),
            patient("Ben", Some((10, RiskCategory::Low))),
            patient("Cleo", Some((20, RiskCategory::Low))),
            patient("Dan", None),
        ];
        let summaries = summarize_by_category(&patients);

        assert_eq!(summaries[0].category, Some(RiskCategory::Low));
        assert_eq!(summaries[0].count, 2);
        assert!((summaries[0].avg_risk - 15.0).abs() < 1e-9);
        assert!(summaries
            .iter()
            .any(|summary| summary.category.is_none() && summary.count == 1));
    }

    #[test]
    fn report_lists_riskiest_patients_and_recent_alerts() {
        let ada = patient("Ada", Some((80, RiskCategory::Critical)));
        let ben = patient("Ben", Some((10, RiskCategory::Low)));
        let alert = Prediction {
            id: Uuid::new_v4(),
            patient_id: ada.id,
            prediction_type: PredictionType::DropoutRisk,
            summary: "Dropout risk: CRITICAL".to_string(),
            confidence: 0.7,
            factors: Factors::new(),
            recommendation: "Immediate intervention recommended".to_string(),
            risk_level: Some(80),
            risk_category: Some(RiskCategory::Critical),
            predicted_for: None,
            algorithm: "HeuristicFallback".to_string(),
            model_version: "fallback".to_string(),
            created_at: now() - Duration::hours(2),
        };

        let report = build_report(&[ben, ada], &[alert], now());

        assert!(report.starts_with("# Clinic Early Warning Report"));
        assert!(report.contains("## Risk Mix"));
        let ada_line = report.find("- Ada (ada@example.com) risk 80 [CRITICAL]").unwrap();
        let ben_line = report.find("- Ben (ben@example.com) risk 10 [LOW]").unwrap();
        assert!(ada_line < ben_line);
        assert!(report.contains("- Ada on 2026-10-01: Immediate intervention recommended"));
    }

    #[test]
    fn empty_clinic_reports_placeholders() {
        let report = build_report(&[], &[], now());
        assert!(report.contains("No patients on record."));
        assert!(report.contains("No patients have been scored yet."));
        assert!(report.contains("No high-risk predictions recorded."));
    }
}
