use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use validator_protocol::{RunEvent, RunRequest, ValidatorCommand};

use crate::args::launch_args;
use crate::error::RunError;
use crate::process::{apply_process_group, terminate_child};
use crate::stream::{emit, relay_lines};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// The validator script. Its directory becomes the working directory of every run.
    pub script: PathBuf,
    /// Program used to run the script (e.g. `bash`); the script is executed directly when unset.
    pub interpreter: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Where stdout capture files are created; the OS temp dir when unset.
    pub temp_dir: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            interpreter: None,
            timeout: None,
            temp_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `-1` when the script was terminated by a signal.
    pub exit_code: i32,
    pub primary_output: String,
    pub log_lines: Vec<String>,
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
    Failed(RunError),
}

#[derive(Debug, Clone)]
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs one request, sending its events to `events` as they happen.
    ///
    /// Returns the terminal event, which is also the last event sent. Dropping the
    /// receiver or firing `cancel` terminates the script's process group.
    pub async fn run(
        &self,
        request: &RunRequest,
        events: &mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> RunEvent {
        let command = match request.validated_command() {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(command = %request.command, "rejected run request");
                let terminal = RunEvent::failed(err.to_string(), None);
                let _ = events.send(terminal.clone()).await;
                return terminal;
            }
        };

        let args = launch_args(command, request);
        let terminal = match self.execute(&args, events, cancel).await {
            Ok(outcome) => match report_outcome(command, outcome, events).await {
                Ok(terminal) => terminal,
                Err(err) => failure_event(command, err),
            },
            Err(err) => failure_event(command, err),
        };
        let _ = events.send(terminal.clone()).await;
        terminal
    }

    /// Launches the script with `args` and relays stderr until it exits.
    pub async fn execute(
        &self,
        args: &[String],
        events: &mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, RunError> {
        let script = self.config.script.as_path();
        if !is_file(script).await {
            return Err(RunError::ScriptNotFound {
                path: script.to_path_buf(),
            });
        }

        let capture = self.capture_file()?;
        let stdout = capture.as_file().try_clone().map_err(RunError::Capture)?;

        let (program, mut cmd) = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                (interpreter.as_path(), cmd)
            }
            None => (script, Command::new(script)),
        };
        cmd.args(args);
        cmd.current_dir(script_dir(script));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        apply_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|err| RunError::spawn(program.to_path_buf(), err))?;
        // The parent's copy of the capture handle is released with `cmd`.
        drop(cmd);
        tracing::info!(pid = ?child.id(), args = ?args, "validator started");

        let started = RunEvent::log(format!("[UI] Starting: {}", command_line(script, args)));
        if let Err(err) = emit(events, started).await {
            terminate_child(&mut child).await;
            return Err(err);
        }

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Diagnostics(std::io::ErrorKind::BrokenPipe.into()))?;
        let mut log_lines = Vec::new();
        let waited = tokio::select! {
            result = relay_until_exit(&mut child, stderr, events, &mut log_lines) => {
                result.map_err(Interrupt::Failed)
            }
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            after = expire(self.config.timeout) => Err(Interrupt::TimedOut(after)),
        };

        let status = match waited {
            Ok(status) => status,
            Err(interrupt) => {
                let status = terminate_child(&mut child).await;
                tracing::warn!(pid = ?child.id(), status = ?status, "validator terminated");
                return Err(match interrupt {
                    Interrupt::Cancelled => RunError::Cancelled,
                    Interrupt::TimedOut(after) => RunError::TimedOut {
                        after,
                        partial_output: read_capture(&capture).await.unwrap_or_default(),
                    },
                    Interrupt::Failed(err) => err,
                });
            }
        };

        let primary_output = read_capture(&capture).await?;
        release_capture(capture);
        Ok(ExecutionOutcome {
            exit_code: exit_code(status),
            primary_output,
            log_lines,
        })
    }

    fn capture_file(&self) -> Result<NamedTempFile, RunError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("validator-stdout-").suffix(".out");
        let capture = match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        capture.map_err(RunError::Capture)
    }
}

async fn relay_until_exit(
    child: &mut Child,
    stderr: tokio::process::ChildStderr,
    events: &mpsc::Sender<RunEvent>,
    log_lines: &mut Vec<String>,
) -> Result<ExitStatus, RunError> {
    relay_lines(stderr, events, log_lines).await?;
    child.wait().await.map_err(RunError::Wait)
}

async fn expire(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}

async fn report_outcome(
    command: ValidatorCommand,
    outcome: ExecutionOutcome,
    events: &mpsc::Sender<RunEvent>,
) -> Result<RunEvent, RunError> {
    tracing::info!(
        command = %command,
        exit_code = outcome.exit_code,
        log_lines = outcome.log_lines.len(),
        output_bytes = outcome.primary_output.len(),
        "validator finished"
    );
    if outcome.exit_code == 0 {
        emit(
            events,
            RunEvent::log(format!("[UI] Command '{command}' completed successfully.")),
        )
        .await?;
        return Ok(RunEvent::completed(outcome.primary_output));
    }
    emit(
        events,
        RunEvent::log(format!(
            "[UI] Command '{command}' failed (exit code {}).",
            outcome.exit_code
        )),
    )
    .await?;
    Ok(RunEvent::failed(
        format!("Exit code {}", outcome.exit_code),
        Some(outcome.primary_output),
    ))
}

fn failure_event(command: ValidatorCommand, err: RunError) -> RunEvent {
    if err.is_cancellation() {
        tracing::info!(command = %command, reason = %err, "validator run abandoned");
    } else {
        tracing::error!(command = %command, error = ?err, "validator run failed");
    }
    let partial_output = err.partial_output();
    RunEvent::failed(err.to_string(), partial_output)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn script_dir(script: &Path) -> &Path {
    match script.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn command_line(script: &Path, args: &[String]) -> String {
    let name = script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string());
    std::iter::once(name)
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn read_capture(capture: &NamedTempFile) -> Result<String, RunError> {
    let bytes = tokio::fs::read(capture.path())
        .await
        .map_err(RunError::ReadOutput)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn release_capture(capture: NamedTempFile) {
    let path = capture.path().to_path_buf();
    if let Err(err) = capture.close() {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove capture file");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        capture_dir: PathBuf,
        runner: Runner,
    }

    fn fixture(script_body: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("validator.sh");
        fs::write(&script, script_body).expect("write script");
        let capture_dir = dir.path().join("captures");
        fs::create_dir_all(&capture_dir).expect("capture dir");
        let runner = Runner::new(RunnerConfig {
            script,
            interpreter: Some(PathBuf::from("/bin/sh")),
            timeout: None,
            temp_dir: Some(capture_dir.clone()),
        });
        Fixture {
            _dir: dir,
            capture_dir,
            runner,
        }
    }

    impl Fixture {
        fn with_interpreter(mut self, interpreter: Option<PathBuf>) -> Self {
            self.runner.config.interpreter = interpreter;
            self
        }

        fn with_timeout(mut self, timeout: Duration) -> Self {
            self.runner.config.timeout = Some(timeout);
            self
        }

        async fn run(&self, request: RunRequest) -> (Vec<RunEvent>, RunEvent) {
            let (tx, mut rx) = mpsc::channel(64);
            let terminal = self
                .runner
                .run(&request, &tx, CancellationToken::new())
                .await;
            drop(tx);
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            (events, terminal)
        }

        fn leftover_captures(&self) -> usize {
            fs::read_dir(&self.capture_dir).expect("read dir").count()
        }
    }

    #[tokio::test]
    async fn robots_success_scenario() {
        let fixture = fixture("echo 'checking robots.txt' >&2\nexit 0\n");
        let (events, terminal) = fixture.run(RunRequest::new("robots")).await;
        assert_eq!(
            events,
            vec![
                RunEvent::log("[UI] Starting: validator.sh robots"),
                RunEvent::log("checking robots.txt"),
                RunEvent::log("[UI] Command 'robots' completed successfully."),
                RunEvent::completed(""),
            ]
        );
        assert_eq!(terminal, RunEvent::completed(""));
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn failure_carries_exit_code_and_partial_output() {
        let fixture = fixture("echo 'ERR: timeout' >&2\nprintf 'partial-data'\nexit 2\n");
        let (events, terminal) = fixture.run(RunRequest::new("crawl")).await;
        assert_eq!(
            events,
            vec![
                RunEvent::log("[UI] Starting: validator.sh crawl"),
                RunEvent::log("ERR: timeout"),
                RunEvent::log("[UI] Command 'crawl' failed (exit code 2)."),
                RunEvent::failed("Exit code 2", Some("partial-data".to_string())),
            ]
        );
        assert_eq!(events.last(), Some(&terminal));
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn invalid_command_never_launches() {
        let fixture = fixture("touch launched\nexit 0\n");
        let (events, terminal) = fixture.run(RunRequest::new("bogus")).await;
        assert_eq!(
            events,
            vec![RunEvent::failed("Invalid command: bogus", None)]
        );
        assert_eq!(terminal, events[0]);
        assert_eq!(fixture.leftover_captures(), 0);
        let script_dir = fixture.runner.config.script.parent().expect("dir");
        assert!(!script_dir.join("launched").exists());
    }

    #[tokio::test]
    async fn completed_output_matches_stdout_exactly() {
        let body = "i=0\nwhile [ $i -lt 2000 ]; do echo \"<p>row $i</p>\"; i=$((i+1)); done\necho done >&2\n";
        let fixture = fixture(body);
        let (events, terminal) = fixture.run(RunRequest::new("html")).await;
        let expected: String = (0..2000).map(|i| format!("<p>row {i}</p>\n")).collect();
        assert_eq!(terminal, RunEvent::completed(expected));
        assert_eq!(
            events.iter().filter(|event| event.is_terminal()).count(),
            1
        );
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn log_lines_keep_write_order() {
        let body = "for i in 1 2 3 4 5 6 7 8 9 10; do echo \"line $i\" >&2; done\n";
        let fixture = fixture(body);
        let (events, _) = fixture.run(RunRequest::new("all")).await;
        let logs: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Log { line } if line.starts_with("line ") => Some(line.clone()),
                _ => None,
            })
            .collect();
        let expected: Vec<_> = (1..=10).map(|i| format!("line {i}")).collect();
        assert_eq!(logs, expected);
    }

    #[tokio::test]
    async fn passes_translated_flags_and_runs_in_script_dir() {
        let fixture = fixture("echo \"$*\"\npwd >&2\n");
        let request = RunRequest {
            url: Some("https://example.com".to_string()),
            verbose: true,
            save: true,
            page: Some("/about".to_string()),
            ..RunRequest::new("analytics")
        };
        let (events, terminal) = fixture.run(request).await;
        assert_eq!(
            terminal,
            RunEvent::completed("analytics https://example.com --verbose --page /about\n")
        );
        let script_dir = fixture.runner.config.script.parent().expect("dir");
        let script_dir = fs::canonicalize(script_dir).expect("canonicalize");
        assert!(events.contains(&RunEvent::log(script_dir.display().to_string())));
    }

    #[tokio::test]
    async fn missing_script_is_a_single_failure() {
        let fixture = fixture("exit 0\n");
        let mut runner = fixture.runner.clone();
        runner.config.script = fixture.capture_dir.join("nope.sh");
        let (tx, mut rx) = mpsc::channel(8);
        let terminal = runner
            .run(&RunRequest::new("robots"), &tx, CancellationToken::new())
            .await;
        drop(tx);
        let expected = format!(
            "Script not found: {}",
            fixture.capture_dir.join("nope.sh").display()
        );
        assert_eq!(terminal, RunEvent::failed(expected, None));
        assert_eq!(rx.recv().await, Some(terminal));
        assert_eq!(rx.recv().await, None);
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn missing_interpreter_reports_script_not_found() {
        let fixture = fixture("exit 0\n")
            .with_interpreter(Some(PathBuf::from("/nonexistent/interpreter")));
        let (events, terminal) = fixture.run(RunRequest::new("robots")).await;
        let expected = RunEvent::failed("Script not found: /nonexistent/interpreter", None);
        assert_eq!(events, vec![expected.clone()]);
        assert_eq!(terminal, expected);
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn non_executable_script_is_a_single_failure() {
        use std::os::unix::fs::PermissionsExt;

        let fixture = fixture("#!/bin/sh\ntouch launched\nexit 0\n").with_interpreter(None);
        let script = fixture.runner.config.script.clone();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod");

        let (events, terminal) = fixture.run(RunRequest::new("robots")).await;
        let expected = RunEvent::failed(format!("Script not found: {}", script.display()), None);
        assert_eq!(events, vec![expected.clone()]);
        assert_eq!(terminal, expected);
        assert!(!script.with_file_name("launched").exists());
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn timeout_terminates_and_keeps_partial_output() {
        let fixture = fixture("printf 'half'\necho working >&2\nsleep 30\n")
            .with_timeout(Duration::from_secs(1));
        let started = std::time::Instant::now();
        let (events, terminal) = fixture.run(RunRequest::new("performance")).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            terminal,
            RunEvent::failed("Timed out after 1s", Some("half".to_string()))
        );
        assert!(events.contains(&RunEvent::log("working")));
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_script() {
        let fixture = fixture("echo started >&2\nsleep 30\n");
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let runner = fixture.runner.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(&RunRequest::new("crawl"), &tx, task_cancel)
                .await
        });

        assert_eq!(
            rx.recv().await,
            Some(RunEvent::log("[UI] Starting: validator.sh crawl"))
        );
        assert_eq!(rx.recv().await, Some(RunEvent::log("started")));
        cancel.cancel();

        let terminal = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run finished")
            .expect("join");
        assert_eq!(terminal, RunEvent::failed("Cancelled", None));
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_script() {
        let fixture = fixture("while true; do echo tick >&2; sleep 0.1; done\n");
        let (tx, mut rx) = mpsc::channel(1);
        let runner = fixture.runner.clone();
        let handle = tokio::spawn(async move {
            runner
                .run(&RunRequest::new("crawl"), &tx, CancellationToken::new())
                .await
        });

        assert_eq!(
            rx.recv().await,
            Some(RunEvent::log("[UI] Starting: validator.sh crawl"))
        );
        drop(rx);

        let terminal = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run finished")
            .expect("join");
        assert_eq!(terminal, RunEvent::failed("Event receiver disconnected", None));
        assert_eq!(fixture.leftover_captures(), 0);
    }

    #[test]
    fn command_line_uses_script_file_name() {
        let line = command_line(
            Path::new("/srv/site-validations/validator.sh"),
            &["robots".to_string(), "--verbose".to_string()],
        );
        assert_eq!(line, "validator.sh robots --verbose");
    }

    #[test]
    fn bare_script_name_runs_in_current_dir() {
        assert_eq!(script_dir(Path::new("validator.sh")), Path::new("."));
        assert_eq!(script_dir(Path::new("/srv/v.sh")), Path::new("/srv"));
    }
}
