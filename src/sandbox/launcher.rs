use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

/// A fully resolved command line, ready to be started in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl Invocation {
    /// Splits a resolved command template into program and arguments.
    pub fn from_words(words: Vec<String>, working_dir: PathBuf) -> Option<Self> {
        let mut words = words.into_iter();
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
            working_dir,
        })
    }
}

/// Capability to start untrusted processes.
///
/// Everything that runs submitted code, compilers included, goes through this
/// trait, so a resource-limited implementation (cgroups, seccomp, containers)
/// can replace [`LocalLauncher`] without touching the judging logic.
pub trait ProcessLauncher: Send + Sync {
    /// Starts the process with stdin, stdout and stderr piped.
    fn launch(&self, invocation: &Invocation) -> io::Result<Child>;

    /// Forcibly stops the process tree rooted at `pid`.
    fn terminate(&self, pid: u32) {
        kill_process_group(pid);
    }
}

/// Plain OS process spawning. Each child leads its own process group so the
/// whole tree can be killed at once. Provides no isolation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLauncher;

impl ProcessLauncher for LocalLauncher {
    fn launch(&self, invocation: &Invocation) -> io::Result<Child> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only delivers a signal; an already empty group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        log::trace!(
            "killpg({pgid}) failed: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Resolves once the child has exited, leaving it unreaped where the platform
/// allows.
///
/// An unreaped leader keeps its pid, and so its process group id, from being
/// reused. Call [`ProcessLauncher::terminate`] after this and only then
/// collect the status with [`Child::wait`].
pub async fn exited(child: &mut Child) {
    if let Some(pid) = child.id() {
        let waited = tokio::task::spawn_blocking(move || wait_exited_unreaped(pid)).await;
        match waited {
            Ok(Ok(())) => return,
            Ok(Err(e)) => log::debug!("waitid({pid}) failed, reaping instead: {e}"),
            Err(e) => log::warn!("Exit watcher for {pid} failed: {e}"),
        }
    }
    let _ = child.wait().await;
}

/// Blocks until `pid` has exited without reaping it.
#[cfg(unix)]
pub fn wait_exited_unreaped(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data and a zeroed value is valid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call; WNOWAIT leaves the child waitable.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                libc::id_t::from(pid),
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
pub fn wait_exited_unreaped(_pid: u32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_from_words() {
        let inv = Invocation::from_words(
            vec!["java".into(), "-cp".into(), "/w".into(), "Main".into()],
            PathBuf::from("/w"),
        )
        .unwrap();
        assert_eq!(inv.program, "java");
        assert_eq!(inv.args, vec!["-cp", "/w", "Main"]);
        assert!(Invocation::from_words(vec![], PathBuf::from("/w")).is_none());
    }

    #[tokio::test]
    async fn test_terminate_kills_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30 & sleep 30; wait".to_string()],
            working_dir: dir.path().to_path_buf(),
        };
        let launcher = LocalLauncher;
        let mut child = launcher.launch(&inv).unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        launcher.terminate(pid);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exited_keeps_the_leader_unreaped() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            working_dir: dir.path().to_path_buf(),
        };
        let mut child = LocalLauncher.launch(&inv).unwrap();
        let pid = child.id().unwrap();

        exited(&mut child).await;
        // a zombie still owns its pid until it is reaped
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        let state = stat.rsplit(')').next().unwrap().trim_start();
        assert!(state.starts_with('Z'), "{stat}");

        let status = child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
