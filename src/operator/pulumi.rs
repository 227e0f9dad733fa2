//! Pulumi backend: drives the `pulumi` CLI.
//!
//! Every call runs one `pulumi` subcommand in the project directory with the
//! stack passed explicitly. Output is captured; a non-zero exit becomes
//! [`BackendError::Command`] carrying stderr. While a command runs, the child
//! is polled so a cancellation can kill it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use jiff::Timestamp;
use serde::Deserialize;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::model::{DeploymentRecord, ResourceChanges, StateSnapshot, UpdateKind, UpdateResult};

use super::{
    ApplyOptions, ApplyResult, BackendError, PreviewOptions, PreviewResult, RefreshOptions,
    RefreshResult, RollbackStack, StackOperator,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stack operator backed by the `pulumi` CLI.
#[derive(Debug, Clone)]
pub struct PulumiOperator {
    binary: PathBuf,
}

impl PulumiOperator {
    /// Use the `pulumi` binary at `binary` (a bare name is looked up on `PATH`).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PulumiOperator {
    fn default() -> Self {
        Self::new("pulumi")
    }
}

impl StackOperator for PulumiOperator {
    type Stack = PulumiStack;

    fn select_stack(
        &self,
        stack_name: &str,
        project_path: &Path,
        cancel: &Cancellation,
    ) -> Result<PulumiStack, BackendError> {
        let cli = Cli {
            binary: self.binary.clone(),
            cwd: project_path.to_path_buf(),
        };
        cli.run(
            &["stack", "select", stack_name, "--non-interactive"],
            None,
            cancel,
        )?;
        Ok(PulumiStack {
            cli,
            stack: stack_name.to_string(),
        })
    }
}

/// A stack selected through the `pulumi` CLI.
#[derive(Debug)]
pub struct PulumiStack {
    cli: Cli,
    stack: String,
}

impl PulumiStack {
    fn export_with(
        &self,
        extra: &[&str],
        cancel: &Cancellation,
    ) -> Result<StateSnapshot, BackendError> {
        let mut args = vec!["stack", "export", "--stack", self.stack.as_str()];
        args.extend_from_slice(extra);
        let output = self.cli.run(&args, None, cancel)?;
        StateSnapshot::from_export_json(&output.stdout).map_err(|source| BackendError::Output {
            command: self.cli.describe(&args),
            source,
        })
    }
}

impl RollbackStack for PulumiStack {
    fn export(&self, cancel: &Cancellation) -> Result<StateSnapshot, BackendError> {
        self.export_with(&[], cancel)
    }

    fn export_version(
        &self,
        version: u64,
        cancel: &Cancellation,
    ) -> Result<StateSnapshot, BackendError> {
        let version = version.to_string();
        self.export_with(&["--version", version.as_str()], cancel)
    }

    fn import(&self, snapshot: &StateSnapshot, cancel: &Cancellation) -> Result<(), BackendError> {
        let args = ["stack", "import", "--stack", self.stack.as_str()];
        let document = snapshot
            .to_export_json()
            .map_err(|source| BackendError::Output {
                command: self.cli.describe(&args),
                source,
            })?;
        self.cli.run(&args, Some(document), cancel)?;
        Ok(())
    }

    fn history(
        &self,
        page_size: u32,
        page: u32,
        cancel: &Cancellation,
    ) -> Result<Vec<DeploymentRecord>, BackendError> {
        let page_size_arg = page_size.to_string();
        let page_arg = page.max(1).to_string();
        let mut args = vec![
            "stack",
            "history",
            "--json",
            "--show-secrets=false",
            "--stack",
            self.stack.as_str(),
        ];
        if page_size > 0 {
            args.extend([
                "--page-size",
                page_size_arg.as_str(),
                "--page",
                page_arg.as_str(),
            ]);
        }

        let output = self.cli.run(&args, None, cancel)?;
        parse_history(&output.stdout).map_err(|source| BackendError::Output {
            command: self.cli.describe(&args),
            source,
        })
    }

    fn preview(
        &self,
        options: &PreviewOptions,
        cancel: &Cancellation,
    ) -> Result<PreviewResult, BackendError> {
        let args = [
            "preview",
            "--json",
            "--non-interactive",
            "--stack",
            self.stack.as_str(),
            "--message",
            options.message.as_str(),
        ];
        let output = self.cli.run(&args, None, cancel)?;
        let change_summary =
            parse_change_summary(&output.stdout).map_err(|source| BackendError::Output {
                command: self.cli.describe(&args),
                source,
            })?;

        Ok(PreviewResult {
            change_summary,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn refresh(
        &self,
        options: &RefreshOptions,
        cancel: &Cancellation,
    ) -> Result<RefreshResult, BackendError> {
        let output = self.cli.run(
            &[
                "refresh",
                "--yes",
                "--skip-preview",
                "--non-interactive",
                "--stack",
                self.stack.as_str(),
                "--message",
                options.message.as_str(),
            ],
            None,
            cancel,
        )?;

        Ok(RefreshResult {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn apply(
        &self,
        options: &ApplyOptions,
        cancel: &Cancellation,
    ) -> Result<ApplyResult, BackendError> {
        let output = self.cli.run(
            &[
                "up",
                "--yes",
                "--skip-preview",
                "--non-interactive",
                "--stack",
                self.stack.as_str(),
                "--message",
                options.message.as_str(),
            ],
            None,
            cancel,
        )?;

        // `up` has no machine-readable summary; the update it just recorded does.
        // The update already happened, so a failed lookup only loses the summary.
        let resource_changes = match self.history(1, 1, &Cancellation::never()) {
            Ok(records) => records.into_iter().next().map(|r| r.resource_changes),
            Err(e) => {
                tracing::warn!("could not read the update summary: {e}");
                None
            }
        };

        Ok(ApplyResult {
            resource_changes,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

// ── Process runner ──

/// Captured output of a successful command.
#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
}

/// How to invoke the CLI for one project.
#[derive(Debug, Clone)]
struct Cli {
    binary: PathBuf,
    cwd: PathBuf,
}

impl Cli {
    /// Run the CLI with `args`, feeding `stdin` if given, and return its output on success.
    fn run(
        &self,
        args: &[&str],
        stdin: Option<String>,
        cancel: &Cancellation,
    ) -> Result<CommandOutput, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let command = self.describe(args);
        debug!(cwd = %self.cwd.display(), "running {command}");

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.cwd)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.binary.display().to_string(),
                source,
            })?;

        // Feed stdin and drain both pipes on their own threads so a chatty
        // child never blocks on a full pipe while we poll it.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                Some(thread::spawn(move || pipe.write_all(input.as_bytes())))
            }
            _ => None,
        };
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = wait(&mut child, cancel);

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(e)) => debug!("stdin for {command} closed early: {e}"),
                Ok(Ok(())) | Err(_) => {}
            }
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        let status = status?;
        if !status.success() {
            return Err(BackendError::Command {
                command,
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    /// The command line as a human would type it.
    fn describe(&self, args: &[&str]) -> String {
        let binary = self
            .binary
            .file_name()
            .map_or_else(
                || self.binary.display().to_string(),
                |n| n.to_string_lossy().into_owned(),
            );
        format!("{binary} {}", args.join(" "))
    }
}

/// Wait for `child` to exit, killing it if `cancel` fires first.
///
/// A child that already exited reports its status even when `cancel` has fired.
fn wait(child: &mut Child, cancel: &Cancellation) -> Result<ExitStatus, BackendError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if cancel.is_cancelled() => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::Cancelled);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                return Err(BackendError::Spawn {
                    program: "child process".to_string(),
                    source,
                });
            }
        }
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("could not read child output: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

// ── Wire formats ──

/// JSON shape of one entry from `pulumi stack history --json`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    version: u64,
    #[serde(default)]
    kind: UpdateKind,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    result: UpdateResult,
    #[serde(default)]
    message: String,
    #[serde(default)]
    resource_changes: Option<ResourceChanges>,
}

impl From<HistoryEntry> for DeploymentRecord {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            version: entry.version,
            kind: entry.kind,
            start_time: parse_time(entry.start_time.as_deref()),
            end_time: parse_time(entry.end_time.as_deref()),
            result: entry.result,
            message: entry.message,
            resource_changes: entry.resource_changes.unwrap_or_default(),
        }
    }
}

/// Parse `stack history --json` output. Empty output means no history.
fn parse_history(json: &str) -> Result<Vec<DeploymentRecord>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<HistoryEntry>> = serde_json::from_str(json)?;
    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(DeploymentRecord::from)
        .collect())
}

/// JSON shape of `pulumi preview --json`, reduced to what we read.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewDocument {
    #[serde(default)]
    change_summary: Option<ResourceChanges>,
}

fn parse_change_summary(json: &str) -> Result<Option<ResourceChanges>, serde_json::Error> {
    let doc: PreviewDocument = serde_json::from_str(json)?;
    Ok(doc.change_summary)
}

/// Timestamps the backend cannot express as RFC 3339 are dropped, not fatal.
fn parse_time(value: Option<&str>) -> Option<Timestamp> {
    value
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env;
    use std::time::Instant;

    #[test]
    fn parses_history_entries() {
        let json = r#"[
            {
                "version": 7,
                "kind": "update",
                "startTime": "2026-03-01T10:00:00Z",
                "endTime": "2026-03-01T10:02:30Z",
                "message": "add bucket",
                "environment": {"exec.kind": "cli"},
                "result": "succeeded",
                "resourceChanges": {"create": 1, "same": 4}
            },
            {
                "version": 6,
                "kind": "refresh",
                "startTime": "not a time",
                "message": "",
                "result": "failed"
            }
        ]"#;

        let records = parse_history(json).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version, 7);
        assert_eq!(records[0].kind, UpdateKind::Update);
        assert_eq!(
            records[0].start_time,
            Some("2026-03-01T10:00:00Z".parse::<Timestamp>().unwrap())
        );
        assert!(records[0].end_time.is_some());
        assert_eq!(records[0].resource_changes.get("create"), Some(&1));
        assert_eq!(records[1].kind, UpdateKind::Refresh);
        assert_eq!(records[1].result, UpdateResult::Failed);
        assert!(records[1].start_time.is_none());
        assert!(records[1].resource_changes.is_empty());
    }

    #[test]
    fn empty_history_output() {
        assert!(parse_history("").unwrap().is_empty());
        assert!(parse_history("null").unwrap().is_empty());
        assert!(parse_history("[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_history_fails() {
        assert!(parse_history("{").is_err());
    }

    #[test]
    fn parses_preview_change_summary() {
        let json = r#"{"steps": [], "changeSummary": {"create": 2, "delete": 1}, "duration": 123}"#;
        let summary = parse_change_summary(json).unwrap().unwrap();

        assert_eq!(summary.get("create"), Some(&2));
        assert_eq!(summary.get("delete"), Some(&1));
    }

    #[test]
    fn preview_without_summary() {
        assert!(parse_change_summary(r#"{"steps": []}"#).unwrap().is_none());
    }

    #[test]
    fn describe_uses_binary_file_name() {
        let cli = Cli {
            binary: PathBuf::from("/opt/pulumi/bin/pulumi"),
            cwd: PathBuf::from("."),
        };
        assert_eq!(
            cli.describe(&["stack", "export", "--stack", "dev"]),
            "pulumi stack export --stack dev"
        );
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let cli = Cli {
            binary: PathBuf::from("definitely-not-a-real-binary-4b1d"),
            cwd: PathBuf::from("."),
        };
        let err = cli.run(&["version"], None, &Cancellation::never()).unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_command_error() {
        let cli = Cli {
            binary: PathBuf::from("sh"),
            cwd: PathBuf::from("."),
        };
        let err = cli
            .run(&["-c", "echo boom >&2; exit 3"], None, &Cancellation::never())
            .unwrap_err();

        match err {
            BackendError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn stdin_is_fed_to_the_child() {
        let cli = Cli {
            binary: PathBuf::from("cat"),
            cwd: PathBuf::from("."),
        };
        let output = cli
            .run(&[], Some("hello".to_string()), &Cancellation::never())
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_the_child() {
        let cli = Cli {
            binary: PathBuf::from("sleep"),
            cwd: PathBuf::from("."),
        };
        let token = Cancellation::new();
        let canceller = token.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = cli.run(&["30"], None, &token).unwrap_err();
        trigger.join().unwrap();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn finished_child_reports_status_after_cancellation() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        child.wait().unwrap();
        let token = Cancellation::new();
        token.cancel();

        let status = wait(&mut child, &token).unwrap();

        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn unreadable_output_is_collected_as_empty() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("pipe closed"))
            }
        }

        assert_eq!(collect(Some(drain(Failing))), "");
    }

    /// Per-version export against a real backend.
    ///
    /// Needs a stack with at least two updates that changed resources:
    /// `ROLLBACK_CONFORMANCE_STACK=dev ROLLBACK_CONFORMANCE_CWD=path/to/project
    ///  cargo test -- --ignored conformance`
    #[test]
    #[ignore = "needs a pulumi backend"]
    fn conformance_export_version_returns_historical_state() {
        let stack_name = env::var("ROLLBACK_CONFORMANCE_STACK").unwrap();
        let cwd = env::var("ROLLBACK_CONFORMANCE_CWD").unwrap();
        let never = Cancellation::never();

        let operator = PulumiOperator::default();
        let stack = operator
            .select_stack(&stack_name, Path::new(&cwd), &never)
            .unwrap();
        let history = stack.history(0, 0, &never).unwrap();
        let latest = &history[0];

        let current: serde_json::Value =
            serde_json::from_str(&stack.export(&never).unwrap().deployment).unwrap();
        let at_latest: serde_json::Value = serde_json::from_str(
            &stack
                .export_version(latest.version, &never)
                .unwrap()
                .deployment,
        )
        .unwrap();
        assert_eq!(current["resources"], at_latest["resources"]);

        // Consecutive versions where the newer one changed resources must export different states.
        let changed = history.windows(2).find(|pair| {
            pair[0]
                .resource_changes
                .iter()
                .any(|(kind, n)| kind != "same" && *n > 0)
        });
        if let Some(pair) = changed {
            let export = |version| -> serde_json::Value {
                serde_json::from_str(&stack.export_version(version, &never).unwrap().deployment)
                    .unwrap()
            };
            assert_ne!(export(pair[0].version)["resources"], export(pair[1].version)["resources"]);
        }
    }
}
