use serde::Serialize;

use crate::config::{PipelineConfig, ToolCommand};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.export_only && config.skip_export {
        report
            .errors
            .push("--export-only and --skip-export cannot be combined".into());
    }
    if config.export_only && config.skip_deploy {
        report
            .warnings
            .push("--skip-deploy has no effect with --export-only".into());
    }

    if config.epochs == 0 {
        report.errors.push("epochs must be at least 1".into());
    }
    if config.batch_size == 0 {
        report.errors.push("batch size must be at least 1".into());
    }
    if config.health_attempts == 0 {
        report
            .errors
            .push("health_check.attempts must be at least 1".into());
    }
    if config.dataset_prefix.is_empty() || config.run_prefix.is_empty() {
        report
            .errors
            .push("dataset_prefix and run_prefix cannot be empty".into());
    }
    if config.manifest_name.trim().is_empty() {
        report.errors.push("manifest_name cannot be empty".into());
    }

    if !config.project_root.is_dir() {
        report.errors.push(format!(
            "project root does not exist: {}",
            config.project_root.display()
        ));
    }
    if config.skip_export && !config.datasets_root.is_dir() {
        report.warnings.push(format!(
            "export is skipped but the datasets root does not exist: {}",
            config.datasets_root.display()
        ));
    }
    if config.production_model.is_dir() {
        report.errors.push(format!(
            "production model path is a directory: {}",
            config.production_model.display()
        ));
    }

    if !config.skip_export {
        report.merge(validate_tool("export", &config.export));
    }
    if !config.export_only {
        report.merge(validate_tool("train", &config.train));
    }

    report
}

fn validate_tool(label: &str, tool: &ToolCommand) -> ValidationReport {
    let mut report = ValidationReport::default();
    if tool.program.trim().is_empty() {
        report
            .errors
            .push(format!("{label} tool program cannot be empty"));
    }
    report
}
