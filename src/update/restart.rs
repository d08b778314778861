//! Restart strategies and the process-control seam they act through.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::info;

/// What happens after an update installed a new binary. Fixed at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Spawn the new binary as a child with inherited stdio, then exit
    #[serde(alias = "restart_popen")]
    RestartViaNewProcess,
    /// Replace the process image in place
    #[default]
    #[serde(alias = "restart_exec")]
    RestartViaReplace,
    /// Only env and schema are updated; the binary is never touched
    EnvSchemaOnly,
    /// Install everything, keep running the old image
    NoRestart,
}

impl RestartMode {
    pub fn restarter(&self) -> Option<Restarter> {
        match self {
            RestartMode::RestartViaNewProcess => Some(Restarter::NewProcess),
            RestartMode::RestartViaReplace => Some(Restarter::ReplaceImage),
            RestartMode::EnvSchemaOnly | RestartMode::NoRestart => None,
        }
    }

    pub fn touches_binary(&self) -> bool {
        *self != RestartMode::EnvSchemaOnly
    }
}

/// Operations on the running process. The real implementation never
/// returns from `terminate`, nor from a successful `replace_image`.
pub trait ProcessControl: Send + Sync {
    fn spawn_detached(&self, exe: &Path, args: &[String]) -> io::Result<()>;

    fn terminate(&self);

    /// Returns only on failure.
    fn replace_image(&self, exe: &Path, args: &[String]) -> io::Error;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn spawn_detached(&self, exe: &Path, args: &[String]) -> io::Result<()> {
        Command::new(exe)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map(|child| info!("Spawned replacement process {}", child.id()))
    }

    fn terminate(&self) {
        std::process::exit(0);
    }

    #[cfg(unix)]
    fn replace_image(&self, exe: &Path, args: &[String]) -> io::Error {
        use std::os::unix::process::CommandExt;
        Command::new(exe).args(args).exec()
    }

    #[cfg(not(unix))]
    fn replace_image(&self, _exe: &Path, _args: &[String]) -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "process image replacement needs a unix platform",
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restarter {
    NewProcess,
    ReplaceImage,
}

impl Restarter {
    /// Hands control to the freshly installed binary.
    pub fn restart(
        &self,
        process: &dyn ProcessControl,
        exe: &Path,
        args: &[String],
    ) -> Result<(), String> {
        match self {
            Restarter::NewProcess => {
                process
                    .spawn_detached(exe, args)
                    .map_err(|e| format!("spawning {} failed: {}", exe.display(), e))?;
                process.terminate();
                Ok(())
            }
            Restarter::ReplaceImage => {
                let e = process.replace_image(exe, args);
                Err(format!("replacing image with {} failed: {}", exe.display(), e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum ProcessCall {
        Spawn(PathBuf, Vec<String>),
        Terminate,
        Replace(PathBuf, Vec<String>),
    }

    /// Records calls instead of touching the process.
    #[derive(Default)]
    pub(crate) struct FakeProcess {
        pub calls: Mutex<Vec<ProcessCall>>,
    }

    impl FakeProcess {
        pub fn calls(&self) -> Vec<ProcessCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessControl for FakeProcess {
        fn spawn_detached(&self, exe: &Path, args: &[String]) -> io::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(ProcessCall::Spawn(exe.to_path_buf(), args.to_vec()));
            Ok(())
        }

        fn terminate(&self) {
            self.calls.lock().unwrap().push(ProcessCall::Terminate);
        }

        fn replace_image(&self, exe: &Path, args: &[String]) -> io::Error {
            self.calls
                .lock()
                .unwrap()
                .push(ProcessCall::Replace(exe.to_path_buf(), args.to_vec()));
            io::Error::new(io::ErrorKind::Other, "exec is faked")
        }
    }
}
