//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, StackConfig, ValidationResult};
use crate::lifecycle::LifecycleState;
use crate::planner::{ActionType, StackPlan};
use crate::reconciler::{DriftReport, ReconciliationResult, RefreshReport};
use crate::state::{LockInfo, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Tracked resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &StackPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &StackPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - resources are up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan");
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            ConfigHasher::short_hash(&plan.config_hash)
        );

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.resource_name.clone(),
                resource_type: a.resource_type.clone(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in plan.changes().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "   {}:", action.resource_name.bold());
                for change in &action.changes {
                    let _ = writeln!(output, "     {change}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().yellow(),
            plan.count(ActionType::Delete).to_string().red()
        );
        output
    }

    /// Formats the outcome of validation.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &StackConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        let errors: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resources.len(),
                "errors": errors,
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid\n", "✓".green())
                } else {
                    let mut out = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &errors {
                        let _ = writeln!(out, "   - {error}");
                    }
                    out
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted_resources {
                        let _ = write!(output, "   - {} ({})", resource.name, resource.action);
                        if !resource.reason.is_empty() {
                            let _ = write!(output, ": {}", resource.reason);
                        }
                        output.push('\n');
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted_resources.len(),
                        report.total_resources
                    );
                    output
                }
            }
        }
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_reconciliation(&self, title: &str, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => Self::json(result),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} {title} successful", "✓".green())
                } else {
                    format!("{} {title} failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Replaced: {}", result.replaced);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);

                if !result.pending.is_empty() {
                    let _ = write!(
                        output,
                        "\n{} Not yet applied: {}\n",
                        "⚠".yellow(),
                        result.pending.join(", ")
                    );
                }
                if !result.skipped.is_empty() {
                    let _ = writeln!(output, "\n   Skipped: {}", result.skipped.join(", "));
                }
                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                output
            }
        }
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Refreshed {} resource(s)\n",
                    "✓".green(),
                    report.refreshed.len()
                );
                for name in &report.gone {
                    let _ = writeln!(output, "   {} {name} no longer exists", "-".red());
                }
                for error in &report.errors {
                    let _ = writeln!(output, "   {} {error}", "✗".red());
                }
                output
            }
        }
    }

    /// Formats stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    ConfigHasher::short_hash(&state.config_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);

                if state.resources.is_empty() {
                    output.push_str("\n   No resources tracked.\n");
                } else {
                    let rows: Vec<ResourceRow> = state
                        .newest_first()
                        .into_iter()
                        .rev()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.instance.resource_type.clone(),
                            state: Self::format_lifecycle_state(r.instance.state),
                            status: r.instance.remote_status.clone().unwrap_or_default(),
                            id: r.instance.id().unwrap_or("-").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {:?} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => format!(
                "{} State locked: {} (holder {}, expires in {}s)\n",
                "✓".green(),
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line message.
    #[must_use]
    pub fn message(&self, level: MessageLevel, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "status": level.as_str(),
                "message": message,
            })),
            OutputFormat::Text => {
                let marker = match level {
                    MessageLevel::Success => "✓".green(),
                    MessageLevel::Warning => "⚠".yellow(),
                    MessageLevel::Error => "✗".red(),
                };
                format!("{marker} {message}")
            }
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Replace => "-/+replace".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::Noop => "noop".dimmed().to_string(),
        }
    }

    /// Formats a lifecycle state with color.
    fn format_lifecycle_state(state: LifecycleState) -> String {
        let text = state.to_string();
        match state {
            LifecycleState::Active => text.green().to_string(),
            LifecycleState::Failed => text.red().to_string(),
            LifecycleState::Absent | LifecycleState::Deleted => text.dimmed().to_string(),
            LifecycleState::Creating | LifecycleState::Updating | LifecycleState::Deleting => {
                text.yellow().to_string()
            }
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// Severity of a one-line message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// Something worked.
    Success,
    /// Something needs attention.
    Warning,
    /// Something failed.
    Error,
}

impl MessageLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson {
    config_hash: String,
    created_at: String,
    creates: usize,
    updates: usize,
    replaces: usize,
    deletes: usize,
    actions: Vec<ActionJson>,
}

#[derive(Serialize)]
struct ActionJson {
    action_type: String,
    resource: String,
    resource_type: String,
    remote_id: Option<String>,
    reason: String,
    changes: Vec<String>,
}

impl From<&StackPlan> for PlanJson {
    fn from(plan: &StackPlan) -> Self {
        Self {
            config_hash: plan.config_hash.clone(),
            created_at: plan.created_at.to_rfc3339(),
            creates: plan.count(ActionType::Create),
            updates: plan.count(ActionType::Update),
            replaces: plan.count(ActionType::Replace),
            deletes: plan.count(ActionType::Delete),
            actions: plan
                .actions
                .iter()
                .map(|a| ActionJson {
                    action_type: a.action_type.to_string(),
                    resource: a.resource_name.clone(),
                    resource_type: a.resource_type.clone(),
                    remote_id: a.remote_id.clone(),
                    reason: a.reason.clone(),
                    changes: a.changes.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannedAction;

    fn plan() -> StackPlan {
        let mut plan = StackPlan::new("0123456789abcdef");
        plan.actions.push(PlannedAction {
            action_type: ActionType::Create,
            resource_name: String::from("net"),
            resource_type: String::from("network"),
            remote_id: None,
            reason: String::from("not yet created"),
            changes: Vec::new(),
        });
        plan.actions.push(PlannedAction {
            action_type: ActionType::Noop,
            resource_name: String::from("sub"),
            resource_type: String::from("subnet"),
            remote_id: Some(String::from("sub-a")),
            reason: String::new(),
            changes: Vec::new(),
        });
        plan
    }

    #[test]
    fn test_plan_json() {
        let out = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["creates"], 1);
        assert_eq!(value["actions"][1]["remote_id"], "sub-a");
    }

    #[test]
    fn test_plan_text_lists_changes_only() {
        colored::control::set_override(false);
        let out = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), false);
        assert!(out.contains("+create"));
        assert!(out.contains("0123456789ab"));
        assert!(!out.contains("noop"));
        assert!(out.contains("Plan: 1 to create, 0 to update, 0 to replace, 0 to destroy"));
    }

    #[test]
    fn test_empty_plan_text() {
        let out = OutputFormatter::new(OutputFormat::Text).format_plan(&StackPlan::new("h"), false);
        assert!(out.contains("No changes required"));
    }

    #[test]
    fn test_message_json() {
        let out = OutputFormatter::new(OutputFormat::Json).message(MessageLevel::Warning, "careful");
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["status"], "warning");
        assert_eq!(value["message"], "careful");
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }
}
