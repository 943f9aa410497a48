//! Colored progress and summary output on stderr.
//!
//! Stdout is reserved for the exported report, so everything here goes to
//! stderr.

use colored::Colorize;
use rigour_core::events::EventReceiver;
use rigour_core::{PhaseEvent, PipelineState, Report, SceneReport};
use rigour_proto::ExecutionStatus;
use tokio::task::JoinHandle;

/// Verbosity level for terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Only the final summary.
    Quiet,
    /// One line per finished scene.
    #[default]
    Normal,
    /// Every phase transition.
    Verbose,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalReporter {
    verbosity: Verbosity,
}

impl TerminalReporter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    /// Drains `rx` on a background task until every sender is dropped.
    pub fn spawn(self, mut rx: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(line) = self.format_event(&event) {
                    eprintln!("{line}");
                }
            }
        })
    }

    /// Renders one event, or `None` when this verbosity hides it.
    pub fn format_event(&self, event: &PhaseEvent) -> Option<String> {
        match event {
            PhaseEvent::BatchStarted { total, concurrent } => {
                if self.verbosity == Verbosity::Quiet {
                    return None;
                }
                let mode = if *concurrent { "concurrently" } else { "sequentially" };
                Some(format!(
                    "\n{}\n",
                    format!(
                        "Running {total} scene{} {mode}...",
                        if *total == 1 { "" } else { "s" }
                    )
                    .bold()
                ))
            }
            PhaseEvent::Transition(t) => {
                if self.verbosity != Verbosity::Verbose {
                    return None;
                }
                let from = t.from.map_or("start", PipelineState::as_str);
                let detail = t
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({d})").dimmed().to_string())
                    .unwrap_or_default();
                Some(format!(
                    "  {} {} {} {}{detail}",
                    t.scene_id.dimmed(),
                    from.dimmed(),
                    "→".dimmed(),
                    t.to
                ))
            }
            PhaseEvent::SceneFinished {
                scene_id,
                state,
                status,
                healed,
                children,
                duration_ms,
                ..
            } => {
                if self.verbosity == Verbosity::Quiet {
                    return None;
                }
                let icon = match status {
                    Some(ExecutionStatus::Passed) => "✅",
                    Some(ExecutionStatus::Skipped) => "⏭️",
                    Some(ExecutionStatus::Failed) => "❌",
                    Some(ExecutionStatus::Error) | None => "⚠️",
                };
                let mut notes = Vec::new();
                if *healed {
                    notes.push("healed".green().to_string());
                }
                if *children > 0 {
                    notes.push(format!("+{children} edge cases").cyan().to_string());
                }
                if *state == PipelineState::Error {
                    notes.push("error".yellow().to_string());
                }
                let notes = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", notes.join(", "))
                };
                let duration = format!("({:.1}s)", *duration_ms as f64 / 1000.0).dimmed();
                Some(format!("  {icon} {scene_id} {duration}{notes}"))
            }
            PhaseEvent::BatchFinished { .. } => None,
        }
    }

    /// Prints the verdict line and counts.
    pub fn print_summary(&self, report: &Report) {
        let s = &report.summary;
        eprintln!("\n{}", "━".repeat(40).dimmed());

        let bad = s.failed + s.errored;
        if self.verbosity == Verbosity::Quiet {
            if bad == 0 {
                eprintln!("{}", format!("✓ {}/{} passed", s.passed, s.total).green());
            } else {
                eprintln!("{}", format!("✗ {bad}/{} failed", s.total).red());
            }
            return;
        }

        let (emoji, verdict, color) = if bad == 0 {
            ("🟢", "PASSED", colored::Color::Green)
        } else if s.passed > 0 {
            ("🟡", "MIXED", colored::Color::Yellow)
        } else {
            ("🔴", "FAILED", colored::Color::Red)
        };

        let mut parts = vec![];
        if s.passed > 0 {
            parts.push(format!("{} passed", s.passed).green().to_string());
        }
        if s.failed > 0 {
            parts.push(format!("{} failed", s.failed).red().to_string());
        }
        if s.errored > 0 {
            parts.push(format!("{} errored", s.errored).yellow().to_string());
        }
        if s.skipped > 0 {
            parts.push(format!("{} skipped", s.skipped).dimmed().to_string());
        }
        if s.healed > 0 {
            parts.push(format!("{} healed", s.healed).green().to_string());
        }
        if s.edge_cases_generated > 0 {
            parts.push(format!("{} edge cases", s.edge_cases_generated).cyan().to_string());
        }

        let verdict_text = format!("{verdict}: {} of {} scenes", s.passed, s.total);
        eprintln!("{emoji} {}", verdict_text.color(color).bold());
        if !parts.is_empty() {
            eprintln!("   {}", parts.join(", "));
        }
        eprintln!(
            "\n   {}",
            format!("Completed in {:.1}s", s.duration_ms as f64 / 1000.0).dimmed()
        );
    }

    /// Prints details for scenes that count against the exit code.
    pub fn print_failures(&self, report: &Report) {
        let failures: Vec<_> = report.failures().collect();
        if failures.is_empty() || self.verbosity == Verbosity::Quiet {
            return;
        }

        eprintln!("\n{}\n", "Failed Scenes:".red().bold());
        for scene in failures {
            print_failed_scene(report, scene);
        }
    }
}

fn print_failed_scene(report: &Report, scene: &SceneReport) {
    eprintln!("  {} {}", "❌".red(), scene.scene_id.red().bold());
    eprintln!("     {}", scene.title.dimmed());
    if let (Some(phase), Some(error)) = (scene.error_phase, &scene.error) {
        eprintln!("     {} {error}", format!("{phase} error:").yellow());
    }
    if let Some(strategy) = &scene.healing_strategy {
        eprintln!("     {} {strategy}", "healing:".dimmed());
    }

    let result = report
        .results
        .iter()
        .zip(report.scenes.iter().filter(|s| s.status.is_some()))
        .find(|(_, s)| s.scene_id == scene.scene_id)
        .map(|(r, _)| r);
    if let Some(message) = result.and_then(|r| r.error_message.as_deref()) {
        eprintln!("     {} {}", "✗".red(), message);
    }
    eprintln!();
}
