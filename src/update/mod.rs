//! # Update Orchestrator
//!
//! Turns an `update/pepeunit` command into a new env, a new schema and,
//! when a firmware link is present, a new program image.
//!
//! ## Cycle
//!
//! ```text
//! Idle ──► Downloading ──► Applying ──► Restarting(mode) ──► Terminated
//!  ▲            │              │               │
//!  └────────────┴──────────────┴───────────────┘
//!            (failure, or a mode that keeps running)
//! ```
//!
//! The cycle is an `UpdateCycle<S>` typestate: each stage can only be
//! entered from the previous one. The current stage is mirrored into an
//! [`UpdatePhase`] for observers.
//!
//! ## Safety of the running unit
//!
//! Everything is downloaded and extracted into a private staging directory
//! first. Env and schema are installed (and topics resubscribed) before any
//! binary step, so a unit always ends up with the newest configuration even
//! if the firmware download fails. The program directory and executable are
//! only touched once extraction fully succeeded. Any failure returns to
//! `Idle` with the old binary still running.

pub mod restart;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use statum::{machine, state};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::cycle::MainCycle;
use crate::error::{PepeunitError, Result};
use crate::files;
use crate::logger::UnitLogger;
use crate::mqtt::RetryingExecutor;
use crate::rest::RestClient;
use crate::schema::SchemaStore;
use crate::settings::SettingsStore;

pub use restart::{ProcessControl, RestartMode, Restarter, SystemProcessControl};

const ARCHIVE_NAME: &str = "update.tgz";
const EXTRACT_DIR: &str = "extracted";
const FIRMWARE_NAME: &str = "firmware.bin";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePhase {
    #[default]
    Idle,
    Downloading,
    Applying,
    Restarting(RestartMode),
}

/// Payload of `update/pepeunit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateCommand {
    #[serde(default, rename = "firmwareLink", alias = "COMPILED_FIRMWARE_LINK")]
    pub firmware_link: Option<String>,
}

impl UpdateCommand {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| PepeunitError::DownloadFailed(format!("malformed update command: {e}")))
    }

    /// The link, unless absent or blank.
    pub fn link(&self) -> Option<&str> {
        self.firmware_link
            .as_deref()
            .map(str::trim)
            .filter(|link| !link.is_empty())
    }
}

/// Replaces the built-in update cycle entirely when registered.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, payload: &str) -> color_eyre::Result<()>;
}

/// Where the program lives and how to start it again.
#[derive(Debug, Clone)]
pub struct UpdateTargets {
    /// Receives the extracted archive tree when set
    pub program_dir: Option<PathBuf>,
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl UpdateTargets {
    /// The running executable and its arguments.
    pub fn current(program_dir: Option<PathBuf>) -> Result<Self> {
        let executable = std::env::current_exe()
            .map_err(|e| PepeunitError::Config(format!("cannot resolve executable: {e}")))?;
        Ok(Self {
            program_dir,
            executable,
            args: std::env::args().skip(1).collect(),
        })
    }
}

/// Collaborators the orchestrator drives.
pub struct UpdateDeps {
    pub rest: Arc<dyn RestClient>,
    pub settings: Arc<SettingsStore>,
    pub schema: Arc<SchemaStore>,
    pub executor: RetryingExecutor,
    pub cycle: Arc<MainCycle>,
    pub logger: Arc<UnitLogger>,
    pub process: Arc<dyn ProcessControl>,
}

#[state]
#[derive(Debug, Clone)]
pub enum UpdateStage {
    Idle,
    Downloading,
    Applying,
    Restarting,
}

#[machine]
pub struct UpdateCycle<S: UpdateStage> {
    link: Option<String>,
    staging: Option<TempDir>,
    binary: Option<PathBuf>,
    installed: bool,
}

impl UpdateCycle<Idle> {
    pub fn create(link: Option<String>) -> Self {
        Self::new(link, None, None, false)
    }

    pub fn begin(self) -> UpdateCycle<Downloading> {
        self.transition()
    }
}

impl UpdateCycle<Downloading> {
    /// Stages the archive, installs env and schema, and stages the firmware.
    pub async fn download(mut self, o: &UpdateOrchestrator) -> Result<UpdateCycle<Applying>> {
        let staging = tempfile::Builder::new()
            .prefix("pepeunit_update_")
            .tempdir()
            .map_err(|e| PepeunitError::io(std::env::temp_dir(), e))?;

        let archive = staging.path().join(ARCHIVE_NAME);
        o.deps.rest.download_update_archive(&archive).await?;
        o.logger().info("Update archive downloaded");

        let extracted = staging.path().join(EXTRACT_DIR);
        let target = extracted.clone();
        tokio::task::spawn_blocking(move || files::extract_tar_gz(&archive, &target))
            .await
            .map_err(|e| PepeunitError::ApplyFailed(format!("extraction task failed: {e}")))??;
        o.logger().info("Update archive extracted");

        o.install_env_and_schema(&extracted)?;
        if let Err(e) = o.resubscribe().await {
            o.logger().error(format!("Resubscribe after update failed: {e}"));
        }

        if o.mode.touches_binary() {
            if let Some(link) = self.link.as_deref() {
                let binary = staging.path().join(FIRMWARE_NAME);
                o.deps.rest.download_binary(link, &binary).await?;
                o.logger().info("Firmware downloaded");
                self.binary = Some(binary);
            }
        }

        self.staging = Some(staging);
        Ok(self.transition())
    }
}

impl UpdateCycle<Applying> {
    /// Writes the staged tree and binary over the live program.
    pub async fn apply(mut self, o: &UpdateOrchestrator) -> Result<UpdateCycle<Restarting>> {
        let Some(staging) = self.staging.as_ref() else {
            return Err(PepeunitError::ApplyFailed("nothing staged".into()));
        };

        if o.mode.touches_binary() {
            if let Some(program_dir) = o.targets.program_dir.clone() {
                let extracted = staging.path().join(EXTRACT_DIR);
                tokio::task::spawn_blocking(move || {
                    files::copy_dir_contents(&extracted, &program_dir)
                })
                .await
                .map_err(|e| PepeunitError::ApplyFailed(format!("copy task failed: {e}")))??;
                o.logger().info("Program directory updated");
            }
        }

        if let Some(binary) = self.binary.as_deref() {
            install_executable(binary, &o.targets.executable)?;
            o.logger().info("Binary file installed");
            self.installed = true;
        }
        Ok(self.transition())
    }
}

impl UpdateCycle<Restarting> {
    /// Restarts into the new binary when one was installed.
    pub fn restart(self, o: &UpdateOrchestrator) -> Result<UpdateCycle<Idle>> {
        if !self.installed {
            debug!("No binary installed, staying on the running image");
            return Ok(self.transition());
        }
        let Some(restarter) = o.mode.restarter() else {
            o.logger()
                .info(format!("Restart mode {:?} keeps the current process", o.mode));
            return Ok(self.transition());
        };

        o.deps.cycle.stop();
        o.logger().info(format!("Restarting via {:?}", restarter));
        match restarter.restart(o.deps.process.as_ref(), &o.targets.executable, &o.targets.args) {
            Ok(()) => Ok(self.transition()),
            Err(cause) => {
                o.logger().critical(cause.clone());
                Err(PepeunitError::RestartFailed(cause))
            }
        }
    }
}

/// Copies `staged` next to `exe` as `<exe>.new`, marks it executable and
/// renames it over `exe`.
pub fn install_executable(staged: &Path, exe: &Path) -> Result<()> {
    let file_name = exe
        .file_name()
        .ok_or_else(|| PepeunitError::ApplyFailed(format!("{} has no file name", exe.display())))?;
    let mut next_name = file_name.to_os_string();
    next_name.push(".new");
    let next = exe.with_file_name(next_name);

    files::copy_file(staged, &next)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&next, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| PepeunitError::io(&next, e))?;
    }
    if std::fs::rename(&next, exe).is_err() {
        // Some platforms refuse to rename over a busy executable.
        let _ = std::fs::remove_file(exe);
        std::fs::rename(&next, exe).map_err(|e| PepeunitError::io(exe, e))?;
    }
    Ok(())
}

pub struct UpdateOrchestrator {
    deps: UpdateDeps,
    mode: RestartMode,
    targets: UpdateTargets,
    custom: RwLock<Option<Arc<dyn UpdateHandler>>>,
    phase: RwLock<UpdatePhase>,
    busy: AtomicBool,
}

/// Releases the single-cycle slot and reports `Idle` on every exit path.
struct CycleSlot<'a>(&'a UpdateOrchestrator);

impl Drop for CycleSlot<'_> {
    fn drop(&mut self) {
        self.0.set_phase(UpdatePhase::Idle);
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

impl UpdateOrchestrator {
    pub fn new(deps: UpdateDeps, mode: RestartMode, targets: UpdateTargets) -> Self {
        Self {
            deps,
            mode,
            targets,
            custom: RwLock::new(None),
            phase: RwLock::new(UpdatePhase::Idle),
            busy: AtomicBool::new(false),
        }
    }

    fn logger(&self) -> &UnitLogger {
        &self.deps.logger
    }

    pub fn mode(&self) -> RestartMode {
        self.mode
    }

    pub fn phase(&self) -> UpdatePhase {
        match self.phase.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_phase(&self, phase: UpdatePhase) {
        match self.phase.write() {
            Ok(mut guard) => *guard = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
    }

    pub fn set_custom_handler(&self, handler: Arc<dyn UpdateHandler>) {
        match self.custom.write() {
            Ok(mut guard) => *guard = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    fn custom_handler(&self) -> Option<Arc<dyn UpdateHandler>> {
        match self.custom.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Subscribes every input topic of the current schema.
    pub async fn resubscribe(&self) -> Result<()> {
        let topics = self.deps.schema.snapshot().subscription_topics();
        self.deps.executor.subscribe_topics(&topics).await
    }

    /// Copies env and schema files found in `root` over the live ones and
    /// reloads both. The configured file names win over the generic ones.
    fn install_env_and_schema(&self, root: &Path) -> Result<()> {
        let env = Self::locate(root, self.deps.settings.path(), "env.json");
        let schema = Self::locate(root, self.deps.schema.path(), "schema.json");

        match env {
            Some(env) => {
                self.deps.settings.update_env_file(&env)?;
                self.logger().info("Environment updated");
            }
            None => self.logger().warning("Update archive carries no env file"),
        }
        match schema {
            Some(schema) => {
                files::copy_file(&schema, self.deps.schema.path())?;
                self.deps.schema.update_from_file()?;
                self.logger().info("Schema updated");
            }
            None => self.logger().warning("Update archive carries no schema file"),
        }
        Ok(())
    }

    fn locate(root: &Path, live: &Path, generic: &str) -> Option<PathBuf> {
        live.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| files::find_file(root, name))
            .or_else(|| files::find_file(root, generic))
    }

    /// Entry point for `update/pepeunit`.
    ///
    /// A trigger arriving while a cycle runs is dropped. Failures are logged
    /// through the unit logger and returned.
    pub async fn handle_update(&self, payload: &str) -> Result<()> {
        self.logger().info("Update request received");

        if let Some(handler) = self.custom_handler() {
            if let Err(e) = handler.handle_update(payload).await {
                self.logger().error(format!("Custom update failed: {e}"));
            }
            return Ok(());
        }

        let command = UpdateCommand::parse(payload).map_err(|e| {
            self.logger().error(e.to_string());
            e
        })?;

        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.logger()
                .warning("Update already in progress, trigger dropped");
            return Ok(());
        }
        let _slot = CycleSlot(self);

        let result = self.run_cycle(command.link().map(str::to_string)).await;
        match &result {
            Ok(()) => info!("Update cycle finished"),
            Err(e) => self.logger().error(format!("Update failed: {e}")),
        }
        result
    }

    async fn run_cycle(&self, link: Option<String>) -> Result<()> {
        self.set_phase(UpdatePhase::Downloading);
        let cycle = UpdateCycle::create(link).begin().download(self).await?;

        self.set_phase(UpdatePhase::Applying);
        let cycle = cycle.apply(self).await?;

        self.set_phase(UpdatePhase::Restarting(self.mode));
        cycle.restart(self).map(|_idle| ())
    }
}
