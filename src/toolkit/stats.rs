//! Noise statistics extraction.
//!
//! Runs the toolkit's `stats` command over a target (optionally restricted
//! to a velocity section) and parses the free-text report into a
//! [`NoiseStatsRecord`]. The report format is owned by the external toolkit
//! and drifts across versions, so the parser is a versioned adapter: it
//! accepts the two observed label dialects and fails loudly, naming every
//! field it could not locate, rather than ever defaulting a value.

use crate::error::{PipelineError, Result};
use crate::toolkit::ToolkitRunner;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// NDF array component the statistics are computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsComponent {
    /// The data array itself.
    Data,
    /// The per-pixel error array.
    Error,
}

/// Parsed statistics for one target, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoiseStatsRecord {
    pub mean: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    /// Some report variants omit the pixel sum.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sum: Option<f64>,
    /// Full report text, kept for forensic comparison when the toolkit's
    /// output format drifts.
    pub raw: String,
}

impl NoiseStatsRecord {
    /// Persist the record as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!("Saved stats to {}", path.display());
        Ok(())
    }
}

/// Label grammar: per field, long-dialect pattern first, compact second.
/// Anchored at line starts so a compact label never matches the tail of a
/// long one.
static FIELD_PATTERNS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    let num = r"([-+0-9.eE]+)";
    let patterns = |sources: &[String]| {
        sources
            .iter()
            .map(|s| Regex::new(s).expect("static stats pattern"))
            .collect::<Vec<_>>()
    };
    vec![
        (
            "mean",
            patterns(&[
                format!(r"(?m)^\s*Pixel mean\s*:\s*{num}"),
                format!(r"(?m)^\s*Mean\s*:\s*{num}"),
            ]),
        ),
        (
            "stdev",
            patterns(&[format!(r"(?m)^\s*Standard deviation\s*:\s*{num}")]),
        ),
        (
            "min",
            patterns(&[
                format!(r"(?m)^\s*Minimum pixel value\s*:\s*{num}"),
                format!(r"(?m)^\s*Minimum\s*:\s*{num}"),
            ]),
        ),
        (
            "max",
            patterns(&[
                format!(r"(?m)^\s*Maximum pixel value\s*:\s*{num}"),
                format!(r"(?m)^\s*Maximum\s*:\s*{num}"),
            ]),
        ),
        (
            "count",
            patterns(&[
                r"(?m)^\s*Number of pixels used\s*:\s*(\d+)".to_string(),
                r"(?m)^\s*Number of pixels\s*:\s*(\d+)".to_string(),
            ]),
        ),
        (
            "sum",
            patterns(&[
                format!(r"(?m)^\s*Pixel sum\s*:\s*{num}"),
                format!(r"(?m)^\s*Sum\s*:\s*{num}"),
            ]),
        ),
    ]
});

fn find_field(report: &str, field: &str) -> Option<f64> {
    let (_, patterns) = FIELD_PATTERNS.iter().find(|(name, _)| *name == field)?;
    for pattern in patterns {
        if let Some(captures) = pattern.captures(report) {
            if let Ok(value) = captures[1].parse::<f64>() {
                return Some(value);
            }
        }
    }
    None
}

/// Parse a statistics report into a record. Every required field must be
/// located or the parse fails with the sorted list of missing field names.
pub fn parse_stats_report(report: &str) -> Result<NoiseStatsRecord> {
    let mut missing = Vec::new();
    let mut required = |field: &'static str| -> f64 {
        match find_field(report, field) {
            Some(value) => value,
            None => {
                missing.push(field.to_string());
                0.0
            }
        }
    };

    let mean = required("mean");
    let stdev = required("stdev");
    let min = required("min");
    let max = required("max");
    let count = required("count");

    if !missing.is_empty() {
        missing.sort();
        return Err(PipelineError::StatsParse {
            missing,
            raw: report.to_string(),
        });
    }

    Ok(NoiseStatsRecord {
        mean,
        stdev,
        min,
        max,
        count: count as u64,
        sum: find_field(report, "sum"),
        raw: report.to_string(),
    })
}

/// Invokes `stats` and parses its report.
pub struct NoiseStatsExtractor {
    toolkit: Arc<dyn ToolkitRunner>,
    timeout: Duration,
}

impl NoiseStatsExtractor {
    pub fn new(toolkit: Arc<dyn ToolkitRunner>, timeout: Duration) -> Self {
        Self { toolkit, timeout }
    }

    /// Compute statistics for `target`, optionally restricted to a velocity
    /// `section` on the spectral axis, over the chosen array component.
    pub async fn extract(
        &self,
        target: &Path,
        section: Option<[f64; 2]>,
        component: StatsComponent,
    ) -> Result<NoiseStatsRecord> {
        let ndf = match section {
            Some([low, high]) => format!("'{}(,,{}:{})'", target.display(), low, high),
            None => target.display().to_string(),
        };
        let mut command = format!("stats {ndf}");
        if component == StatsComponent::Error {
            command.push_str(" comp=ERROR");
        }

        let output = self.toolkit.run(&command, self.timeout).await?;
        parse_stats_report(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolkit::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const COMPACT_REPORT: &str = "\
Mean: 0.0023
Standard deviation: 0.00045
Maximum: 0.0512
Minimum: -0.0488
Number of pixels: 10240
";

    /// Report dialect emitted by the KAPPA stats command.
    const KAPPA_REPORT: &str = "
   Pixel statistics for the NDF structure /data/M09BC12_CO/noisemap

      Title                     : CO cube
      NDF array analysed        : DATA

         Pixel sum              : 153.8
         Pixel mean             : 0.015
         Standard deviation     : 0.0043
         Skewness               : 0.1
         Kurtosis               : -0.4
         Minimum pixel value    : -0.0488
         Maximum pixel value    : 0.0512
         Total number of pixels : 12000
         Number of pixels used  : 10240 (85.3%)
         No. of pixels excluded : 1760 (14.7%)
";

    #[test]
    fn test_parse_compact_report() {
        let record = parse_stats_report(COMPACT_REPORT).unwrap();
        assert_eq!(record.mean, 0.0023);
        assert_eq!(record.stdev, 0.00045);
        assert_eq!(record.max, 0.0512);
        assert_eq!(record.min, -0.0488);
        assert_eq!(record.count, 10240);
        assert_eq!(record.sum, None);
    }

    #[test]
    fn test_parse_kappa_report() {
        let record = parse_stats_report(KAPPA_REPORT).unwrap();
        assert_eq!(record.mean, 0.015);
        assert_eq!(record.stdev, 0.0043);
        assert_eq!(record.min, -0.0488);
        assert_eq!(record.max, 0.0512);
        // Used count, not the total.
        assert_eq!(record.count, 10240);
        assert_eq!(record.sum, Some(153.8));
    }

    #[test]
    fn test_missing_stdev_is_reported_not_defaulted() {
        let report = COMPACT_REPORT.replace("Standard deviation: 0.00045\n", "");
        let err = parse_stats_report(&report).unwrap_err();
        match err {
            PipelineError::StatsParse { missing, raw } => {
                assert_eq!(missing, vec!["stdev".to_string()]);
                assert_eq!(raw, report);
            }
            other => panic!("expected StatsParse, got {other:?}"),
        }
    }

    #[test]
    fn test_all_missing_fields_listed_sorted() {
        let err = parse_stats_report("nothing useful here").unwrap_err();
        match err {
            PipelineError::StatsParse { missing, .. } => {
                assert_eq!(missing, vec!["count", "max", "mean", "min", "stdev"]);
            }
            other => panic!("expected StatsParse, got {other:?}"),
        }
    }

    #[test]
    fn test_exponent_notation_values() {
        let report = COMPACT_REPORT.replace("0.00045", "4.5e-4");
        let record = parse_stats_report(&report).unwrap();
        assert_eq!(record.stdev, 4.5e-4);
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = parse_stats_report(COMPACT_REPORT).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let reparsed: NoiseStatsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed, record);
        // Absent sum stays absent rather than becoming zero.
        assert!(!json.contains("\"sum\""));
    }

    struct CannedToolkit {
        commands: Mutex<Vec<String>>,
        stdout: &'static str,
    }

    #[async_trait]
    impl ToolkitRunner for CannedToolkit {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<ToolOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(ToolOutput {
                stdout: self.stdout.to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_extract_builds_section_and_component() {
        let toolkit = Arc::new(CannedToolkit {
            commands: Mutex::new(Vec::new()),
            stdout: KAPPA_REPORT,
        });
        let extractor = NoiseStatsExtractor::new(toolkit.clone(), Duration::from_secs(60));

        let record = extractor
            .extract(
                Path::new("1kms.sdf"),
                Some([-50.0, 50.0]),
                StatsComponent::Error,
            )
            .await
            .unwrap();
        assert_eq!(record.count, 10240);
        assert_eq!(record.raw, KAPPA_REPORT);

        let commands = toolkit.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0], "stats '1kms.sdf(,,-50:50)' comp=ERROR");
    }

    #[tokio::test]
    async fn test_extract_plain_target() {
        let toolkit = Arc::new(CannedToolkit {
            commands: Mutex::new(Vec::new()),
            stdout: COMPACT_REPORT,
        });
        let extractor = NoiseStatsExtractor::new(toolkit.clone(), Duration::from_secs(60));

        extractor
            .extract(Path::new("noisemap.sdf"), None, StatsComponent::Data)
            .await
            .unwrap();

        let commands = toolkit.commands.lock().unwrap();
        assert_eq!(commands[0], "stats noisemap.sdf");
    }
}
