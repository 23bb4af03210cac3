//! Human-readable texts for commits, change requests and status updates.

use crate::pipeline::PipelineResult;
use crate::task::{StepResult, Task, TaskState};

/// Aggregate view over a task's recorded steps.
fn steps_of(task: &Task) -> PipelineResult {
    PipelineResult {
        steps: task.step_results.clone(),
        interrupted: false,
    }
}

fn title_suffix(task: &Task) -> String {
    let title = task.origin.title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        String::new()
    } else {
        format!(": {}", title)
    }
}

fn step_line(step: &StepResult) -> String {
    match (&step.error, step.success) {
        (_, true) => format!("- ✅ **{}** ({:.1}s)\n", step.name, step.duration.as_secs_f64()),
        (Some(error), false) => format!("- ❌ **{}**: {}\n", step.name, error),
        (None, false) => format!("- ❌ **{}**\n", step.name),
    }
}

fn file_list(heading: &str, files: &[String], body: &mut String) {
    if files.is_empty() {
        return;
    }
    body.push_str(heading);
    body.push_str("\n\n");
    for file in files {
        body.push_str(&format!("- `{}`\n", file));
    }
    body.push('\n');
}

/// Commit message for the task's changes. Passed to git on stdin.
pub fn commit_message(task: &Task) -> String {
    let result = steps_of(task);
    let mut message = format!("Resolve #{}{}\n\n", task.origin.issue, title_suffix(task));
    message.push_str(&format!("Resolves #{}\n\n", task.origin.issue));
    for step in &result.steps {
        message.push_str(&format!(
            "- {}: {}\n",
            step.name,
            if step.success { "ok" } else { "failed" }
        ));
    }
    message.push_str(&format!("\n{}\n\nTask: {}\n", result.summary(), task.id));
    message
}

/// Title of the change request.
pub fn change_title(task: &Task) -> String {
    format!("Resolve #{}{}", task.origin.issue, title_suffix(task))
}

/// Body of the change request. An empty `summary` falls back to the step tally.
pub fn change_body(task: &Task, summary: &str, branch: &str) -> String {
    let result = steps_of(task);
    let mut body = String::new();

    body.push_str("## Summary\n\n");
    if summary.trim().is_empty() {
        body.push_str(&result.summary());
    } else {
        body.push_str(summary.trim());
    }
    body.push_str("\n\n");

    if let Some(issue_body) = task.origin.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        body.push_str("<details>\n");
        body.push_str("<summary>Original Issue</summary>\n\n");
        for line in issue_body.lines() {
            body.push_str(&format!("> {}\n", line));
        }
        body.push_str("\n</details>\n\n");
    }

    body.push_str("### Steps\n\n");
    for step in &result.steps {
        body.push_str(&step_line(step));
    }
    body.push('\n');

    file_list("### Files Changed", &result.files_changed(), &mut body);
    file_list("### Tests Added", &result.tests_added(), &mut body);

    body.push_str(&format!("Closes #{}\n\n", task.origin.issue));
    body.push_str("---\n");
    body.push_str(&format!("**Task ID:** `{}`\n", task.id));
    body.push_str(&format!("**Branch:** `{}`\n", branch));
    body
}

/// Terminal status update posted back to the origin.
///
/// Returns `None` for non-terminal tasks.
pub fn status_message(task: &Task) -> Option<String> {
    let result = steps_of(task);
    let duration = match (task.started_at, task.finished_at) {
        (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
        _ => None,
    };

    let mut message = match task.state {
        TaskState::Completed if result.failed() == 0 => "## ✅ Task completed\n\n".to_string(),
        TaskState::Completed => "## ⚠️ Task completed with failures\n\n".to_string(),
        TaskState::Failed => "## ❌ Task failed\n\n".to_string(),
        _ => return None,
    };

    if let Some(error) = &task.error {
        message.push_str(&format!("**Error:** {}\n\n", error));
    }

    message.push_str(&format!("- **Task:** `{}`\n", task.id));
    message.push_str(&format!("- **Steps:** {}\n", result.summary()));
    if let Some(secs) = duration {
        message.push_str(&format!("- **Duration:** {}s\n", secs));
    }
    message.push('\n');

    if result.failed() > 0 {
        message.push_str("### Failed steps\n\n");
        for step in result.steps.iter().filter(|s| !s.success) {
            message.push_str(&step_line(step));
        }
        message.push('\n');
    }

    match (&task.published_reference, task.state) {
        (Some(reference), TaskState::Completed) => {
            message.push_str(&format!("Changes published: {}\n", reference));
        }
        (Some(reference), _) => {
            message.push_str(&format!("Partial changes were pushed: {}\n", reference));
        }
        (None, TaskState::Completed) => message.push_str("No changes to publish.\n"),
        (None, _) => {}
    }

    Some(message)
}
