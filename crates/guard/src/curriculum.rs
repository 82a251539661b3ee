//! Curriculum-structuring hallucination detector.
//!
//! Model output references verified resources by 1-based index into a list
//! of size N. Anything outside that list, or any URL not in the verified
//! set, is a fabrication.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::url::{canonicalize_url, extract_urls};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationType {
    FabricatedIndex,
    FabricatedUrl,
    SuspiciousClaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationFinding {
    pub kind: HallucinationType,
    pub severity: HallucinationSeverity,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationReport {
    pub has_hallucinations: bool,
    pub has_critical: bool,
    pub findings: Vec<HallucinationFinding>,
    pub count_by_type: HashMap<HallucinationType, u32>,
    pub count_by_severity: HashMap<HallucinationSeverity, u32>,
}

/// One section of structured curriculum output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumSection {
    pub title: String,
    pub narrative: String,
    /// Primary resource references, 1-based.
    #[serde(default)]
    pub resource_indices: Vec<u32>,
    /// Supplementary references, 1-based.
    #[serde(default)]
    pub related_resources: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumOutput {
    pub sections: Vec<CurriculumSection>,
}

/// Phrases that read like invented citations or statistics.
const CLAIM_CUES: &[&str] = &[
    "studies show",
    "research proves",
    "et al",
    "according to a study",
    "experts agree",
    "statistics indicate",
];

pub fn detect_hallucinations(
    output: &CurriculumOutput,
    verified_count: u32,
    verified_urls: &[String],
) -> HallucinationReport {
    let verified: HashSet<String> = verified_urls.iter().map(|u| canonicalize_url(u)).collect();
    let mut findings = Vec::new();

    for (i, section) in output.sections.iter().enumerate() {
        for &idx in &section.resource_indices {
            if idx == 0 || idx > verified_count {
                findings.push(HallucinationFinding {
                    kind: HallucinationType::FabricatedIndex,
                    severity: HallucinationSeverity::Critical,
                    detail: format!("section {i} references resource {idx} of {verified_count}"),
                });
            }
        }
        for &idx in &section.related_resources {
            if idx == 0 || idx > verified_count {
                findings.push(HallucinationFinding {
                    kind: HallucinationType::FabricatedIndex,
                    severity: HallucinationSeverity::High,
                    detail: format!("section {i} relates resource {idx} of {verified_count}"),
                });
            }
        }

        for field in [&section.title, &section.narrative] {
            for url in extract_urls(field) {
                let canon = canonicalize_url(&url);
                if !verified.contains(&canon) {
                    findings.push(HallucinationFinding {
                        kind: HallucinationType::FabricatedUrl,
                        severity: HallucinationSeverity::Critical,
                        detail: format!("unverified url {canon}"),
                    });
                }
            }

            let lowered = field.to_lowercase();
            for cue in CLAIM_CUES {
                if lowered.contains(cue) {
                    findings.push(HallucinationFinding {
                        kind: HallucinationType::SuspiciousClaim,
                        severity: HallucinationSeverity::Low,
                        detail: format!("citation-shaped phrase \"{cue}\" in section {i}"),
                    });
                }
            }
        }
    }

    let mut count_by_type: HashMap<HallucinationType, u32> = HashMap::new();
    let mut count_by_severity: HashMap<HallucinationSeverity, u32> = HashMap::new();
    for f in &findings {
        *count_by_type.entry(f.kind).or_default() += 1;
        *count_by_severity.entry(f.severity).or_default() += 1;
    }

    HallucinationReport {
        has_hallucinations: !findings.is_empty(),
        has_critical: findings.iter().any(|f| f.severity == HallucinationSeverity::Critical),
        findings,
        count_by_type,
        count_by_severity,
    }
}
