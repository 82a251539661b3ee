//! nova_guard
//!
//! Post-generation checks. Nothing here calls the network; both guards are
//! pure functions over model output plus the evidence pack, so they can run
//! on every turn without budget concerns.
//!
//! - curriculum guard: fabricated resource indices / URLs / claims
//! - numeric leak guard: no numeric literal leaves the system unless it is
//!   traceable to a verified token or explicitly exempted

pub mod curriculum;
pub mod leak;
pub mod url;

pub use curriculum::{
    detect_hallucinations, CurriculumOutput, CurriculumSection, HallucinationFinding,
    HallucinationReport, HallucinationSeverity, HallucinationType,
};
pub use leak::{lex_numbers, scan_answer, strip_violations, LeakFinding, LeakScan, LeakVerdict, NumericLiteral};
pub use url::canonicalize_url;
