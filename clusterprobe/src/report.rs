//! Console summary and on-disk dumps of scenario results

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ReportConfig;
use crate::runner::ScenarioResult;

/// Writes what a run saw where a human can look at it
pub struct ScenarioReporter {
    output_dir: PathBuf,
    write_dump: bool,
}

impl ScenarioReporter {
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            write_dump: true,
        }
    }

    pub fn from_config(config: &ReportConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            write_dump: config.write_snapshot_dump,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Print results to console
    pub fn print_summary(&self, result: &ScenarioResult) {
        let verdict = if result.passed { "✅ PASSED" } else { "❌ FAILED" };
        println!("\n🔬 Scenario: {} {}", result.scenario_name, verdict);
        println!("═══════════════════════════════════════════════════════");

        println!("\n📊 Overview:");
        println!("  Duration: {:.1}s", result.elapsed_ms as f64 / 1000.0);
        println!(
            "  Phases: {}",
            result
                .phases
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" → ")
        );
        println!("  Polls: {}", result.polls);

        if let Some(trigger) = &result.trigger {
            println!("\n⚡ Trigger:");
            println!("  {}", trigger.description);
            println!("  Completed: {} in {}ms", trigger.completed, trigger.elapsed_ms);
            for note in &trigger.notes {
                println!("  Note: {}", note);
            }
        }

        if let Some(snapshot) = &result.final_snapshot {
            println!("\n📈 Metrics (captured {}):", snapshot.captured_at().format("%H:%M:%S"));
            for (node, key, reading) in snapshot.iter() {
                match reading.value() {
                    Some(value) => println!("  {} {} = {}", node, key, value),
                    None => println!("  {} {} = (absent)", node, key),
                }
            }
        }

        if let Some(check) = &result.check {
            println!("\n🧪 Rules:");
            println!("  Evaluated: {}", check.evaluated.join(", "));
            if !check.skipped.is_empty() {
                println!("  Not applicable: {}", check.skipped.join(", "));
            }
        }

        if !result.failure_reasons.is_empty() {
            println!("\n⚠️  Failures:");
            for reason in &result.failure_reasons {
                println!("  - {}", reason);
            }
        }
        println!();
    }

    /// YAML dump of every metric in the final snapshot.
    ///
    /// Returns `None` when dumps are switched off or the run ended before
    /// any snapshot was taken.
    pub fn write_dump(&self, result: &ScenarioResult) -> Result<Option<PathBuf>> {
        let Some(snapshot) = &result.final_snapshot else {
            return Ok(None);
        };
        if !self.write_dump {
            return Ok(None);
        }

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        let file_path = self
            .output_dir
            .join(format!("{}_metrics.yaml", result.scenario_name));
        let yaml = serde_yaml::to_string(&snapshot.dump()).context("serializing snapshot dump")?;
        fs::write(&file_path, yaml).with_context(|| format!("writing {}", file_path.display()))?;

        Ok(Some(file_path))
    }

    /// Full result as pretty JSON, one timestamped file per run
    pub fn write_result(&self, result: &ScenarioResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        let filename = format!(
            "{}_{}.json",
            result.scenario_name,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let file_path = self.output_dir.join(filename);
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&file_path, json).with_context(|| format!("writing {}", file_path.display()))?;

        Ok(file_path)
    }
}
