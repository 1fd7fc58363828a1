use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

pub mod body;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod gate;
pub mod host;
pub mod instruction;
pub mod manifest;
pub mod pattern;
pub mod report;
pub mod rewrite;
pub mod session;
pub mod sim;

pub use body::{BodyError, MethodBody, RawInstruction, RawMethodBody, RawOperand};
pub use config::SessionConfig;
pub use descriptor::{PatchAction, PatchDescriptor, PatchId, PatchKind};
pub use gate::{Capabilities, HostVersion};
pub use host::{CallContext, Host, HostError, MethodHandle, MethodInfo, Redirect};
pub use instruction::{Constant, FieldRef, InstrId, Instruction, MethodRef, Opcode, Operand};
pub use manifest::{HookRegistry, ManifestError, ModuleManifest};
pub use pattern::{Matcher, Pattern};
pub use report::{FailureReason, OutcomeSummary, PatchOutcome, PatchState, SkipReason};
pub use rewrite::{Edit, RewriteError};
pub use session::{ApplicationSession, PatchModule};
pub use sim::{HostImage, SimHost};

#[derive(Debug, Error)]
pub enum PatchworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

pub type Result<T> = std::result::Result<T, PatchworkError>;

/// Everything one command-line run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub host_image: PathBuf,
    pub mods_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Overrides both the image and the config file.
    pub host_version: Option<HostVersion>,
    pub capabilities: BTreeSet<String>,
}

/// Result of a run: the session with its outcomes and the patched host.
pub struct RunReport {
    pub session: ApplicationSession,
    pub host: SimHost,
}

impl RunReport {
    /// True once any patch failed. Skips do not count.
    pub fn has_failures(&self) -> bool {
        self.session.summary().failed > 0
    }
}

/// Loads the host image and every manifest under the mods directory, then
/// runs one installation pass.
///
/// Only loading problems are errors here. Per-patch failures end up in the
/// session's outcomes.
pub fn run(settings: RunSettings) -> Result<RunReport> {
    let image = HostImage::load(&settings.host_image)?;
    let mut host = SimHost::from_image(image);
    tracing::debug!(
        path = %settings.host_image.display(),
        methods = host.methods().count(),
        "loaded host image"
    );

    let mut config = match &settings.config_path {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    if let Some(version) = settings.host_version {
        config.host_version = Some(version);
    }
    config
        .extra_capabilities
        .extend(settings.capabilities.iter().cloned());

    let mut session = ApplicationSession::for_host(&host, config);
    let hooks = HookRegistry::with_builtins();
    for (path, manifest) in manifest::discover(&settings.mods_dir)? {
        let module = manifest.into_module(&hooks)?;
        let count = session.register_module(&module);
        tracing::debug!(path = %path.display(), module = module.id(), count, "loaded manifest");
    }

    if session.pending() == 0 {
        tracing::warn!(path = %settings.mods_dir.display(), "no patches found");
    }
    session.install(&mut host);
    Ok(RunReport { session, host })
}
