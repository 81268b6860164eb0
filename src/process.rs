use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One OS process owned exclusively by its creator.
pub trait Subprocess {
    fn start(&mut self, program: &Path, args: &[OsString]) -> Result<(), ProcessError>;

    /// Non-blocking liveness check.
    fn is_running(&mut self) -> bool;

    /// SIGTERM, then SIGKILL once `deadline` passes. Never waits past the
    /// deadline for the process to go away.
    fn terminate(&mut self, deadline: Duration);

    fn pid(&self) -> Option<u32>;
}

pub trait ProcessFactory {
    fn create_process(&self) -> Box<dyn Subprocess>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessFactory;

impl ProcessFactory for OsProcessFactory {
    fn create_process(&self) -> Box<dyn Subprocess> {
        Box::new(OsSubprocess::default())
    }
}

#[derive(Debug, Default)]
pub struct OsSubprocess {
    child: Option<Child>,
    program: String,
}

impl Subprocess for OsSubprocess {
    fn start(&mut self, program: &Path, args: &[OsString]) -> Result<(), ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyStarted);
        }
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.to_path_buf(),
                source,
            })?;
        self.program = program.display().to_string();
        info!(program = %self.program, pid = child.id(), "process started");
        self.child = Some(child);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(program = %self.program, %status, "process exited");
                false
            }
            Err(err) => {
                warn!(program = %self.program, "failed to poll process: {}", err);
                false
            }
        }
    }

    fn terminate(&mut self, deadline: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(program = %self.program, %status, "process already exited");
            return;
        }

        let pid = Pid::from_raw(child.id() as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                let _ = child.try_wait();
                return;
            }
            Err(err) => warn!(program = %self.program, "failed to send SIGTERM: {}", err),
        }

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(program = %self.program, %status, "process terminated");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(program = %self.program, "failed to poll process: {}", err);
                    break;
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL.min(deadline - elapsed));
        }

        warn!(
            program = %self.program,
            timeout_ms = deadline.as_millis() as u64,
            "process ignored SIGTERM, sending SIGKILL"
        );
        if let Err(err) = child.kill() {
            warn!(program = %self.program, "failed to send SIGKILL: {}", err);
        }
        // Reap if already gone; otherwise leave it, the deadline has passed.
        let _ = child.try_wait();
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl Drop for OsSubprocess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub(crate) struct FakeProcessState {
        pub program: PathBuf,
        pub args: Vec<OsString>,
        pub running: bool,
        pub terminated_with: Option<Duration>,
    }

    pub(crate) struct FakeProcess {
        state: Rc<RefCell<FakeProcessState>>,
        fail_spawn: bool,
    }

    impl Subprocess for FakeProcess {
        fn start(&mut self, program: &Path, args: &[OsString]) -> Result<(), ProcessError> {
            if self.fail_spawn {
                return Err(ProcessError::Spawn {
                    program: program.to_path_buf(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            let mut state = self.state.borrow_mut();
            state.program = program.to_path_buf();
            state.args = args.to_vec();
            state.running = true;
            Ok(())
        }

        fn is_running(&mut self) -> bool {
            self.state.borrow().running
        }

        fn terminate(&mut self, deadline: Duration) {
            let mut state = self.state.borrow_mut();
            state.running = false;
            state.terminated_with = Some(deadline);
        }

        fn pid(&self) -> Option<u32> {
            self.state.borrow().running.then_some(4242)
        }
    }

    /// Hands out fake processes and keeps a handle on each for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct FakeProcessFactory {
        pub fail_spawn: Rc<Cell<bool>>,
        pub processes: Rc<RefCell<Vec<Rc<RefCell<FakeProcessState>>>>>,
    }

    impl FakeProcessFactory {
        pub fn running_count(&self) -> usize {
            self.processes
                .borrow()
                .iter()
                .filter(|p| p.borrow().running)
                .count()
        }

        pub fn last(&self) -> Option<Rc<RefCell<FakeProcessState>>> {
            self.processes.borrow().last().cloned()
        }
    }

    impl ProcessFactory for FakeProcessFactory {
        fn create_process(&self) -> Box<dyn Subprocess> {
            let state = Rc::new(RefCell::new(FakeProcessState::default()));
            self.processes.borrow_mut().push(Rc::clone(&state));
            Box::new(FakeProcess {
                state,
                fail_spawn: self.fail_spawn.get(),
            })
        }
    }

    fn sh(script: &str) -> OsSubprocess {
        let mut process = OsSubprocess::default();
        process
            .start(Path::new("/bin/sh"), &["-c".into(), script.into()])
            .expect("spawn /bin/sh");
        process
    }

    #[test]
    fn missing_binary_fails_to_start() {
        let mut process = OsSubprocess::default();
        let err = process
            .start(Path::new("/nonexistent/hostapd"), &[])
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!process.is_running());
        assert!(process.pid().is_none());
    }

    #[test]
    fn cannot_start_twice() {
        let mut process = sh("sleep 30");
        let err = process.start(Path::new("/bin/true"), &[]).unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyStarted));
        process.terminate(Duration::from_secs(2));
    }

    #[test]
    fn graceful_terminate_stops_process() {
        let mut process = sh("sleep 30");
        assert!(process.is_running());

        let started = Instant::now();
        process.terminate(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!process.is_running());
        assert!(process.pid().is_none());
    }

    #[test]
    fn terminate_escalates_after_deadline() {
        // Ignored dispositions survive exec, so sleep itself ignores SIGTERM.
        let mut process = sh("trap '' TERM; exec sleep 30");
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        process.terminate(Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!process.is_running());
    }

    #[test]
    fn exited_process_is_not_running() {
        let mut process = sh("exit 3");
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!process.is_running());
        process.terminate(Duration::from_secs(1));
    }

    #[test]
    fn terminate_without_start_is_noop() {
        let mut process = OsSubprocess::default();
        process.terminate(Duration::from_millis(10));
        assert!(!process.is_running());
    }
}
