//! Native backend behaviour against real child processes.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jedi_common::{ExecRequest, RuntimeError, StdStream};
use jedi_process_state::{ProcessState, SpawnOutcome};
use jedi_runtime::{
    AdmissionController, Backend, ProcessEvent, ProcessEventKind, UnixBackend,
};
use nix::unistd::Uid;

const SIGKILL: i32 = 9;

fn backend_with_limit(limit: usize) -> (UnixBackend, Arc<AdmissionController>) {
    let admission = Arc::new(AdmissionController::new(limit, Duration::from_millis(10)));
    (UnixBackend::with_admission(Arc::clone(&admission)), admission)
}

fn backend() -> UnixBackend {
    backend_with_limit(64).0
}

#[test]
fn test_exit_code_is_recorded_once() {
    let process = backend().exec(ExecRequest::new(["sh", "-c", "exit 3"])).unwrap();
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Exited(3));
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Exited(3));
    assert_eq!(process.exit_value().unwrap(), 3);
    assert!(!process.is_running());
    assert!(process.pid().is_some());
    assert_eq!(process.backend(), "unix");
}

#[test]
fn test_state_history_records_lifecycle() {
    let process = backend().exec(ExecRequest::new("true")).unwrap();
    process.wait().unwrap();

    let history = process.state_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to_state, ProcessState::Running);
    assert_eq!(
        history[1].to_state,
        ProcessState::Completed(SpawnOutcome::Exited(0))
    );
}

#[test]
fn test_missing_executable_completes_with_exec_failure() {
    let process = backend()
        .exec(ExecRequest::new("/no/such/program --version"))
        .unwrap();
    let outcome = process.wait().unwrap();
    assert!(matches!(outcome, SpawnOutcome::ExecFailed(_)));
    assert_ne!(outcome, SpawnOutcome::Exited(0));
    assert_eq!(process.pid(), None);

    let err = process.exit_value().unwrap_err();
    assert!(matches!(err, RuntimeError::ExecFailed { .. }));
    assert!(err.is_spawn_failure());
}

#[test]
fn test_stdout_redirect_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let process = backend()
        .exec(ExecRequest::new(["sh", "-c", "printf 'alpha\\nbeta\\n'"]).stdout_to(&out))
        .unwrap();
    process.wait().unwrap();

    let stdout = process.stdout().unwrap();
    assert_eq!(stdout.read_all().unwrap(), "alpha\nbeta\n");
    assert!(stdout.same_stream(&process.stdout().unwrap()));
}

#[test]
fn test_stderr_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let err = dir.path().join("err.txt");
    let process = backend()
        .exec(ExecRequest::new(["sh", "-c", "echo oops >&2"]).stderr_to(&err))
        .unwrap();
    process.wait().unwrap();
    assert_eq!(process.stderr().unwrap().read_all().unwrap(), "oops\n");
}

#[test]
fn test_stdin_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    std::fs::write(&input, "fed from a file\n").unwrap();

    let process = backend()
        .exec(ExecRequest::new("cat").stdin_from(&input).stdout_to(&output))
        .unwrap();
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Exited(0));
    assert_eq!(
        process.stdout().unwrap().read_all().unwrap(),
        "fed from a file\n"
    );

    let mut stdin = process.stdin().unwrap();
    stdin.write_all(b"appended\n").unwrap();
    stdin.close().unwrap();
    assert_eq!(
        std::fs::read_to_string(&input).unwrap(),
        "fed from a file\nappended\n"
    );
}

#[test]
fn test_streams_without_redirect_are_unavailable() {
    let process = backend().exec(ExecRequest::new("true")).unwrap();
    process.wait().unwrap();

    assert!(matches!(
        process.stdout(),
        Err(RuntimeError::StreamUnavailable {
            stream: StdStream::Stdout
        })
    ));
    assert!(matches!(
        process.stderr(),
        Err(RuntimeError::StreamUnavailable { .. })
    ));
    assert!(matches!(
        process.stdin(),
        Err(RuntimeError::StreamUnavailable { .. })
    ));
}

#[test]
fn test_missing_stdin_file_is_exec_failure() {
    let dir = tempfile::tempdir().unwrap();
    let process = backend()
        .exec(ExecRequest::new("cat").stdin_from(dir.path().join("absent")))
        .unwrap();
    assert!(matches!(
        process.wait().unwrap(),
        SpawnOutcome::ExecFailed(_)
    ));
}

#[test]
fn test_destroy_records_signal_and_is_idempotent() {
    let process = backend().exec(ExecRequest::new("sleep 30")).unwrap();
    assert_eq!(process.wait_timeout(Duration::from_millis(50)).unwrap(), None);
    assert!(matches!(
        process.exit_value(),
        Err(RuntimeError::IllegalState { .. })
    ));

    process.destroy().unwrap();
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Signaled(SIGKILL));
    assert!(matches!(
        process.exit_value(),
        Err(RuntimeError::Signaled { signal: SIGKILL })
    ));

    process.destroy().unwrap();
}

#[test]
fn test_destroy_waits_for_pid_while_queued() {
    let (backend, admission) = backend_with_limit(1);
    let slot = admission.acquire();

    let process = Arc::new(backend.exec(ExecRequest::new("sleep 30")).unwrap());
    assert_eq!(process.state(), ProcessState::Created);

    let destroyer = {
        let process = Arc::clone(&process);
        thread::spawn(move || process.destroy())
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(process.pid(), None);
    assert!(!destroyer.is_finished());

    slot.release();
    destroyer.join().unwrap().unwrap();
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Signaled(SIGKILL));
    assert_eq!(admission.running(), 0);
}

#[test]
fn test_native_signal_is_ignored() {
    let process = backend().exec(ExecRequest::new("sleep 30")).unwrap();
    process.signal(15).unwrap();
    assert_eq!(process.wait_timeout(Duration::from_millis(100)).unwrap(), None);
    process.destroy().unwrap();
    process.wait().unwrap();
}

#[test]
fn test_listener_receives_exactly_one_completion() {
    let (backend, admission) = backend_with_limit(1);
    let slot = admission.acquire();
    let process = backend.exec(ExecRequest::new(["sh", "-c", "exit 4"])).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    process
        .add_listener(Arc::new(move |event: &ProcessEvent| {
            assert_eq!(event.kind, ProcessEventKind::Completed);
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    let events = process.subscribe().unwrap();

    slot.release();
    let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(event.source, process.id());
    assert_eq!(event.outcome, Some(SpawnOutcome::Exited(4)));
    assert_eq!(event.pid, process.pid());

    // The set is closed after dispatch, dropping the sender.
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let late = process.add_listener(Arc::new(|_: &ProcessEvent| {}));
    assert!(matches!(late, Err(RuntimeError::IllegalState { .. })));
}

#[test]
fn test_panicking_listener_does_not_starve_others() {
    let (backend, admission) = backend_with_limit(1);
    let slot = admission.acquire();
    let process = backend.exec(ExecRequest::new("true")).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    process
        .add_listener(Arc::new(|_: &ProcessEvent| panic!("listener failed")))
        .unwrap();
    process
        .add_listener(Arc::new(move |_: &ProcessEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    let events = process.subscribe().unwrap();

    slot.release();
    let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(event.outcome, Some(SpawnOutcome::Exited(0)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(process.wait().unwrap(), SpawnOutcome::Exited(0));
}

#[test]
fn test_wait_timeout_without_practical_bound() {
    let process = backend().exec(ExecRequest::new("true")).unwrap();
    assert_eq!(
        process.wait_timeout(Duration::MAX).unwrap(),
        Some(SpawnOutcome::Exited(0))
    );
}

#[test]
fn test_removed_listener_is_not_notified() {
    let (backend, admission) = backend_with_limit(1);
    let slot = admission.acquire();
    let process = backend.exec(ExecRequest::new("true")).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = process
        .add_listener(Arc::new(move |_: &ProcessEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    let events = process.subscribe().unwrap();
    assert!(process.remove_listener(id));

    slot.release();
    events.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_admission_cap_holds_for_many_children() {
    let (backend, admission) = backend_with_limit(64);
    let processes: Vec<_> = (0..200)
        .map(|_| backend.exec(ExecRequest::new("true")).unwrap())
        .collect();

    for process in &processes {
        assert_eq!(process.wait().unwrap(), SpawnOutcome::Exited(0));
    }
    assert!(admission.peak() <= 64);
    assert!(admission.peak() >= 1);
    assert_eq!(admission.running(), 0);
}

#[test]
fn test_identity_override() {
    let process = backend()
        .exec(ExecRequest::new("true").uid(65534))
        .unwrap();
    let outcome = process.wait().unwrap();
    if Uid::effective().is_root() {
        assert_eq!(outcome, SpawnOutcome::Exited(0));
    } else {
        assert_eq!(outcome, SpawnOutcome::SetUidFailed { uid: 65534 });
        assert!(matches!(
            process.exit_value(),
            Err(RuntimeError::SetUidFailed { uid: 65534 })
        ));
    }
}

#[test]
fn test_sentinel_uid_is_rejected() {
    let err = backend()
        .exec(ExecRequest::new("true").uid(u32::MAX))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { .. }));
}

#[test]
fn test_system() {
    let backend = backend();
    assert_eq!(backend.system("true").unwrap(), 0);
    assert_eq!(backend.system("false").unwrap(), 1);
    assert!(matches!(
        backend.system("/no/such/program"),
        Err(RuntimeError::ExecFailed { .. })
    ));
}

#[test]
fn test_file_operations() {
    let backend = backend();
    let file = tempfile::NamedTempFile::new().unwrap();
    backend.chmod(file.path(), 0o600).unwrap();

    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    let meta = std::fs::metadata(file.path()).unwrap();
    assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    backend.chgrp(file.path(), meta.gid()).unwrap();
    backend.chown(file.path(), meta.uid(), None).unwrap();
}

#[test]
fn test_kill_unknown_pid() {
    let backend = backend();
    let process = backend.exec(ExecRequest::new("true")).unwrap();
    process.wait().unwrap();
    let pid = process.pid().unwrap();
    assert!(matches!(
        backend.kill_process(pid),
        Err(RuntimeError::NoSuchProcess { .. })
    ));
}

#[tokio::test]
async fn test_wait_async() {
    let process = backend()
        .exec(ExecRequest::new(["sh", "-c", "sleep 0.1; exit 6"]))
        .unwrap();
    assert_eq!(process.wait_async().await.unwrap(), SpawnOutcome::Exited(6));
    assert_eq!(process.wait_async().await.unwrap(), SpawnOutcome::Exited(6));
}
