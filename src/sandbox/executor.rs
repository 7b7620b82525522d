//! Drives the external sandbox tool (an nsjail-style jailer) through one or
//! two phases per job and classifies the outcome.

use std::fs::{self, File};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::cancel::CancellationToken;
use crate::domain::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, Result, WorkerError, KILLED_EXIT_CODE,
};
use crate::judge::adapter::LanguageAdapter;
use crate::judge::{registry, SANDBOX_WORK_DIR};
use crate::sandbox::output::{capture_stream, join_capture, CapturedOutput, MAX_OUTPUT_BYTES};
use crate::sandbox::{cgroup, Executor};

/// File the job's stdin is staged into inside the scratch directory.
const STDIN_FILE: &str = "stdin.txt";

/// Outer rescue deadline past the per-phase wall budget. If the sandbox tool
/// itself hangs, this is what gets the worker back.
const OUTER_GRACE_MS: u64 = 2_000;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 128 + SIGKILL: the exit code the tool reports when the cgroup OOM killer
/// took the child down.
const OOM_EXIT_CODE: i32 = 137;

/// Executes jobs via the external sandbox tool configured per language.
pub struct SandboxExecutor {
    tool_path: PathBuf,
    profile_dir: PathBuf,
}

impl SandboxExecutor {
    pub fn new(tool_path: impl Into<PathBuf>, profile_dir: impl Into<PathBuf>) -> Self {
        SandboxExecutor {
            tool_path: tool_path.into(),
            profile_dir: profile_dir.into(),
        }
    }

    fn run_jail(
        &self,
        token: &CancellationToken,
        req: &ExecutionRequest,
        profile: &Path,
        workdir: &Path,
        exec_args: &[String],
        limit_ms: u64,
    ) -> Result<ExecutionResult> {
        let mut cmd = Command::new(&self.tool_path);
        cmd.args(sandbox_args(profile, workdir, limit_ms, req.memory_limit_kb));
        cmd.args(exec_args);

        let stdin = File::open(workdir.join(STDIN_FILE))
            .map_err(|e| WorkerError::Sandbox(format!("open staged stdin: {e}")))?;
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so one signal reaches the tool and every
        // descendant it spawned.
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            WorkerError::Sandbox(format!(
                "spawn sandbox tool {}: {e}",
                self.tool_path.display()
            ))
        })?;

        let stdout_capture = child
            .stdout
            .take()
            .map(|stream| capture_stream(stream, MAX_OUTPUT_BYTES));
        let stderr_capture = child
            .stderr
            .take()
            .map(|stream| capture_stream(stream, MAX_OUTPUT_BYTES));

        let wait = wait_for_exit(token, &mut child, started, limit_ms)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let stdout = stdout_capture.map(join_capture).unwrap_or_default();
        let stderr_raw = stderr_capture.map(join_capture).unwrap_or_default();
        let (program_stderr, tool_log) = split_tool_log(&stderr_raw.text);

        let phase = PhaseOutcome {
            exit_code: wait.exit_code,
            timed_out: wait.timed_out,
            cancelled: wait.cancelled,
            elapsed_ms,
            limit_ms,
            tool_wall_limit_ms: tool_wall_secs(limit_ms) * 1000,
            tool_log: &tool_log,
        };
        let status = classify(&phase);

        log::debug!(
            "sandbox phase done: job_id={} status={} exit={} elapsed_ms={} tool_log_bytes={}",
            req.job_id,
            status,
            wait.exit_code,
            elapsed_ms,
            tool_log.len()
        );

        let exit_code = if status == ExecutionStatus::Timeout {
            KILLED_EXIT_CODE
        } else {
            wait.exit_code
        };

        let stderr = if wait.cancelled && status == ExecutionStatus::InternalError {
            "execution aborted by worker shutdown".to_string()
        } else {
            CapturedOutput {
                text: program_stderr,
                truncated: stderr_raw.truncated,
            }
            .into_bounded_string()
        };

        Ok(ExecutionResult {
            stdout: stdout.into_bounded_string(),
            stderr,
            exit_code,
            status,
            time_used_ms: elapsed_ms,
            memory_used_kb: cgroup::read_memory_peak_kb(),
        })
    }
}

impl Executor for SandboxExecutor {
    fn execute(&self, token: &CancellationToken, req: &ExecutionRequest) -> Result<ExecutionResult> {
        let adapter: &dyn LanguageAdapter = registry::adapter_for(req.language);

        // Scratch directory is removed on every exit path when the guard
        // drops, including the error returns below.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("sentinel-{}-", req.job_id))
            .tempdir()
            .map_err(|e| WorkerError::Sandbox(format!("create scratch dir: {e}")))?;

        fs::write(scratch.path().join(adapter.source_file()), &req.source_code)
            .map_err(|e| WorkerError::Sandbox(format!("write source: {e}")))?;
        fs::write(scratch.path().join(STDIN_FILE), &req.stdin)
            .map_err(|e| WorkerError::Sandbox(format!("write stdin: {e}")))?;

        let profile = self.profile_dir.join(adapter.profile_file());

        if let Some(compile_args) = adapter.compile_command() {
            let compile = self.run_jail(
                token,
                req,
                &profile,
                scratch.path(),
                &compile_args,
                adapter.compile_time_limit_ms(),
            )?;

            // A shutdown abort must not be mislabelled as the user's fault.
            if compile.status == ExecutionStatus::InternalError {
                return Ok(compile);
            }
            if compile.exit_code != 0 {
                return Ok(ExecutionResult {
                    status: ExecutionStatus::CompilationError,
                    ..compile
                });
            }
        }

        self.run_jail(
            token,
            req,
            &profile,
            scratch.path(),
            &adapter.run_command(),
            req.time_limit_ms,
        )
    }
}

/// Wall budget handed to the sandbox tool, in whole seconds.
fn tool_wall_secs(limit_ms: u64) -> u64 {
    limit_ms / 1000 + 1
}

/// Fixed argument prefix for one tool invocation; the target command line is
/// appended after the `--` separator.
fn sandbox_args(profile: &Path, workdir: &Path, limit_ms: u64, memory_limit_kb: u64) -> Vec<String> {
    vec![
        "--config".to_string(),
        profile.display().to_string(),
        "--bindmount".to_string(),
        format!("{}:{}", workdir.display(), SANDBOX_WORK_DIR),
        "--time_limit".to_string(),
        tool_wall_secs(limit_ms).to_string(),
        "--cgroup_mem_max".to_string(),
        (memory_limit_kb * 1024).to_string(),
        "--".to_string(),
    ]
}

struct WaitOutcome {
    exit_code: i32,
    timed_out: bool,
    cancelled: bool,
}

/// Poll the child until it exits, the outer deadline fires, or the token
/// cancels. The latter two SIGKILL the whole process group before reaping.
fn wait_for_exit(
    token: &CancellationToken,
    child: &mut Child,
    started: Instant,
    limit_ms: u64,
) -> Result<WaitOutcome> {
    let deadline = Duration::from_millis(limit_ms + OUTER_GRACE_MS);
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| WorkerError::Sandbox(format!("wait for sandbox child: {e}")))?
        {
            return Ok(WaitOutcome {
                exit_code: exit_code_of(&status),
                timed_out: false,
                cancelled: false,
            });
        }

        if started.elapsed() >= deadline {
            kill_process_group(child);
            let status = reap(child)?;
            return Ok(WaitOutcome {
                exit_code: exit_code_of(&status),
                timed_out: true,
                cancelled: false,
            });
        }

        if token.is_cancelled() {
            kill_process_group(child);
            let status = reap(child)?;
            return Ok(WaitOutcome {
                exit_code: exit_code_of(&status),
                timed_out: false,
                cancelled: true,
            });
        }

        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn reap(child: &mut Child) -> Result<ExitStatus> {
    child
        .wait()
        .map_err(|e| WorkerError::Sandbox(format!("reap sandbox child: {e}")))
}

fn kill_process_group(child: &Child) {
    let pid = child.id() as i32;
    if let Err(e) = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        // The group may already be gone; fall back to the direct pid.
        log::debug!("group SIGKILL fallback for pid {pid}: {e}");
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(KILLED_EXIT_CODE)
}

/// Evidence from one tool invocation, input to [`classify`].
struct PhaseOutcome<'a> {
    exit_code: i32,
    timed_out: bool,
    cancelled: bool,
    elapsed_ms: u64,
    limit_ms: u64,
    tool_wall_limit_ms: u64,
    tool_log: &'a str,
}

/// Deterministic verdict derivation for a single phase.
fn classify(phase: &PhaseOutcome) -> ExecutionStatus {
    if phase.timed_out {
        return ExecutionStatus::Timeout;
    }

    // The tool enforces its own wall limit a step below the outer deadline;
    // a non-zero exit at or past it is a time-limit kill even when the log
    // line does not match.
    let tool_limit_hit = log_mentions_time_limit(phase.tool_log)
        || (phase.exit_code != 0 && phase.elapsed_ms >= phase.tool_wall_limit_ms);
    if tool_limit_hit {
        return ExecutionStatus::Timeout;
    }

    if phase.cancelled {
        return if phase.elapsed_ms >= phase.limit_ms {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::InternalError
        };
    }

    if phase.exit_code == 0 {
        ExecutionStatus::Success
    } else if phase.exit_code == OOM_EXIT_CODE || log_mentions_oom(phase.tool_log) {
        ExecutionStatus::MemoryLimitExceeded
    } else {
        ExecutionStatus::RuntimeError
    }
}

/// Split the tool's diagnostic lines from the user program's stderr.
///
/// The tool prefixes its log lines with bracketed single-letter tags. The
/// split is conservative: any line with an unknown prefix belongs to the
/// user.
fn split_tool_log(raw_stderr: &str) -> (String, String) {
    if raw_stderr.is_empty() {
        return (String::new(), String::new());
    }

    let mut program_lines = Vec::new();
    let mut tool_lines = Vec::new();
    for line in raw_stderr.split('\n') {
        if is_tool_log_line(line.trim_start()) {
            tool_lines.push(line);
        } else {
            program_lines.push(line);
        }
    }
    (program_lines.join("\n"), tool_lines.join("\n"))
}

fn is_tool_log_line(line: &str) -> bool {
    const TOOL_PREFIXES: [&str; 5] = ["[I]", "[W]", "[E]", "[F]", "[D]"];
    TOOL_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
}

fn log_mentions_oom(tool_log: &str) -> bool {
    let lower = tool_log.to_lowercase();
    lower.contains("oom") || lower.contains("memory cgroup") || lower.contains("cgroup_mem")
}

fn log_mentions_time_limit(tool_log: &str) -> bool {
    let lower = tool_log.to_lowercase();
    lower.contains("time limit") || lower.contains("run time")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Language;
    use uuid::Uuid;

    fn request(language: Language) -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            language,
            source_code: "print('hello')".to_string(),
            stdin: String::new(),
            time_limit_ms: 5_000,
            memory_limit_kb: 262_144,
        }
    }

    fn phase<'a>(tool_log: &'a str) -> PhaseOutcome<'a> {
        PhaseOutcome {
            exit_code: 0,
            timed_out: false,
            cancelled: false,
            elapsed_ms: 100,
            limit_ms: 5_000,
            tool_wall_limit_ms: 6_000,
            tool_log,
        }
    }

    #[test]
    fn args_encode_tool_wall_seconds_and_memory_bytes() {
        let args = sandbox_args(
            Path::new("/etc/sandbox/python.cfg"),
            Path::new("/tmp/scratch"),
            5_000,
            262_144,
        );
        assert_eq!(
            args,
            vec![
                "--config",
                "/etc/sandbox/python.cfg",
                "--bindmount",
                "/tmp/scratch:/tmp/work",
                "--time_limit",
                "6",
                "--cgroup_mem_max",
                "268435456",
                "--",
            ]
        );
    }

    #[test]
    fn args_round_tight_limits_up() {
        let args = sandbox_args(Path::new("p.cfg"), Path::new("/w"), 1_000, 65_536);
        assert!(args.contains(&"2".to_string()));
        assert!(args.contains(&"67108864".to_string()));
    }

    #[test]
    fn clean_exit_is_success() {
        assert_eq!(classify(&phase("")), ExecutionStatus::Success);
    }

    #[test]
    fn nonzero_exit_is_runtime_error() {
        let mut p = phase("");
        p.exit_code = 1;
        assert_eq!(classify(&p), ExecutionStatus::RuntimeError);
    }

    #[test]
    fn outer_deadline_is_timeout() {
        let mut p = phase("");
        p.timed_out = true;
        p.exit_code = KILLED_EXIT_CODE;
        assert_eq!(classify(&p), ExecutionStatus::Timeout);
    }

    #[test]
    fn tool_reported_time_limit_beats_oom_exit_code() {
        let mut p = phase("[I] run time >= time limit (3 >= 3), terminating");
        p.exit_code = 137;
        p.elapsed_ms = 3_050;
        p.tool_wall_limit_ms = 3_000;
        assert_eq!(classify(&p), ExecutionStatus::Timeout);
    }

    #[test]
    fn nonzero_exit_past_tool_wall_is_timeout_without_log_match() {
        let mut p = phase("");
        p.exit_code = 137;
        p.elapsed_ms = 6_200;
        assert_eq!(classify(&p), ExecutionStatus::Timeout);
    }

    #[test]
    fn clean_exit_just_past_tool_wall_stays_success() {
        let mut p = phase("");
        p.elapsed_ms = 6_050;
        assert_eq!(classify(&p), ExecutionStatus::Success);
    }

    #[test]
    fn oom_exit_code_is_memory_limit() {
        let mut p = phase("");
        p.exit_code = 137;
        assert_eq!(classify(&p), ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn oom_log_hint_is_memory_limit() {
        let mut p = phase("[E] process hit memory cgroup limit");
        p.exit_code = 1;
        assert_eq!(classify(&p), ExecutionStatus::MemoryLimitExceeded);
    }

    #[test]
    fn cancellation_before_the_budget_is_internal_error() {
        let mut p = phase("");
        p.cancelled = true;
        p.exit_code = 128 + 9;
        p.elapsed_ms = 1_000;
        assert_eq!(classify(&p), ExecutionStatus::InternalError);
    }

    #[test]
    fn cancellation_after_the_budget_is_timeout() {
        let mut p = phase("");
        p.cancelled = true;
        p.exit_code = KILLED_EXIT_CODE;
        p.elapsed_ms = 5_500;
        assert_eq!(classify(&p), ExecutionStatus::Timeout);
    }

    #[test]
    fn tool_log_lines_are_separated_from_program_stderr() {
        let raw = "[I] mount: /tmp/work\nTraceback (most recent call last):\n[W] cgroup setup degraded\n  ValueError: boom";
        let (program, tool) = split_tool_log(raw);
        assert_eq!(
            program,
            "Traceback (most recent call last):\n  ValueError: boom"
        );
        assert_eq!(tool, "[I] mount: /tmp/work\n[W] cgroup setup degraded");
    }

    #[test]
    fn unknown_prefixes_belong_to_the_user() {
        let raw = "[X] looks official but is not\n[info] also user";
        let (program, tool) = split_tool_log(raw);
        assert_eq!(program, raw);
        assert!(tool.is_empty());
    }

    #[test]
    fn empty_stderr_splits_to_empty() {
        let (program, tool) = split_tool_log("");
        assert!(program.is_empty() && tool.is_empty());
    }

    #[test]
    fn exit_code_maps_signals_to_128_plus() {
        let killed = ExitStatus::from_raw(9); // raw wait status: SIGKILL
        assert_eq!(exit_code_of(&killed), 137);
        let clean = ExitStatus::from_raw(0);
        assert_eq!(exit_code_of(&clean), 0);
    }

    #[test]
    fn cancellation_kills_the_whole_process_group() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30 & exec sleep 30"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.process_group(0);
        let mut child = cmd.spawn().expect("spawn sh");
        let pgid = Pid::from_raw(child.id() as i32);

        let token = CancellationToken::new();
        let killer = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            killer.cancel();
        });

        let started = Instant::now();
        let wait = wait_for_exit(&token, &mut child, started, 30_000).expect("wait");
        assert!(wait.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Every member of the group must die, including the backgrounded
        // grandchild; poll briefly while the reaper collects them.
        let deadline = Instant::now() + Duration::from_secs(2);
        while signal::killpg(pgid, None).is_ok() {
            assert!(
                Instant::now() < deadline,
                "process group {pgid} still has live members"
            );
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn outer_deadline_kills_a_hung_child() {
        let mut cmd = Command::new("/bin/sleep");
        cmd.arg("30");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.process_group(0);
        let mut child = cmd.spawn().expect("spawn sleep");

        let token = CancellationToken::new();
        let started = Instant::now();
        // Outer deadline is limit + 2000 ms.
        let wait = wait_for_exit(&token, &mut child, started, 100).expect("wait");

        assert!(wait.timed_out);
        assert!(!wait.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_tool_is_an_infrastructure_error() {
        let executor = SandboxExecutor::new("/nonexistent/sandbox-tool", "/nonexistent/profiles");
        let token = CancellationToken::new();
        let req = request(Language::Python);

        let err = executor
            .execute(&token, &req)
            .expect_err("missing tool must not produce a verdict");
        assert!(matches!(err, WorkerError::Sandbox(_)));
    }

    #[test]
    fn scratch_directory_is_removed_on_failure_paths() {
        let executor = SandboxExecutor::new("/nonexistent/sandbox-tool", "/nonexistent/profiles");
        let token = CancellationToken::new();
        let req = request(Language::Cpp);

        let _ = executor.execute(&token, &req);

        let leftover: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("sentinel-{}-", req.job_id))
            })
            .collect();
        assert!(leftover.is_empty(), "scratch dirs leaked: {leftover:?}");
    }
}
