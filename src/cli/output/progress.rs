//! Spinner utilities using indicatif
//!
//! The run command shows one spinner for the whole request. A
//! [`SpinnerEventSink`] keeps its message in step with lifecycle events.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::domain::models::{PhaseStatus, PipelineEvent};
use crate::domain::ports::EventSink;

const SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:.green} {msg}";
const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Create a spinner for indeterminate operations
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template(SPINNER_TEMPLATE) {
        spinner.set_style(style.tick_chars(SPINNER_CHARS));
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Extension trait for ProgressBar to add common utility methods
pub trait ProgressBarExt {
    /// Finish with a success message (green checkmark)
    fn finish_success(&self, message: impl Into<String>);

    /// Finish with an error message (red X)
    fn finish_error(&self, message: impl Into<String>);

    /// Finish with a warning message (yellow !)
    fn finish_warning(&self, message: impl Into<String>);
}

impl ProgressBarExt for ProgressBar {
    fn finish_success(&self, message: impl Into<String>) {
        self.finish_with_message(format!("✓ {}", message.into()));
    }

    fn finish_error(&self, message: impl Into<String>) {
        self.finish_with_message(format!("✗ {}", message.into()));
    }

    fn finish_warning(&self, message: impl Into<String>) {
        self.finish_with_message(format!("! {}", message.into()));
    }
}

/// Renders lifecycle events as the spinner message.
pub struct SpinnerEventSink {
    spinner: ProgressBar,
}

impl SpinnerEventSink {
    pub fn new(spinner: ProgressBar) -> Self {
        Self { spinner }
    }
}

/// Spinner text for an event, or `None` if the event changes nothing.
pub fn spinner_message(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::PhaseChanged { to, .. } => Some(format!("{to}...")),
        PipelineEvent::Stage {
            stage,
            status: PhaseStatus::Retrying,
            attempt,
            ..
        } => Some(format!("{stage}: retrying after attempt {attempt}")),
        PipelineEvent::Stage {
            stage,
            status: PhaseStatus::Started,
            steps_completed,
            steps_total,
            ..
        } if *steps_total > 0 => Some(format!("{stage} ({steps_completed}/{steps_total} steps)")),
        PipelineEvent::FixIteration {
            iteration, step_id, ..
        } => Some(format!("fix iteration {iteration} on {step_id}")),
        _ => None,
    }
}

impl EventSink for SpinnerEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Some(message) = spinner_message(&event) {
            self.spinner.set_message(message);
        }
    }
}
