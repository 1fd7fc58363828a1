use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::SessionConfig;
use crate::descriptor::{PatchDescriptor, PatchId};
use crate::engine;
use crate::gate::{Capabilities, HostVersion};
use crate::host::{Host, MethodHandle};
use crate::report::{OutcomeSummary, PatchOutcome};

type RegisterFn = Box<dyn Fn(&str) -> Vec<PatchDescriptor>>;

/// A mod module: an id plus the entry point that yields its descriptors.
pub struct PatchModule {
    id: String,
    register: RegisterFn,
}

impl PatchModule {
    pub fn new<F>(id: &str, register: F) -> Self
    where
        F: Fn(&str) -> Vec<PatchDescriptor> + 'static,
    {
        PatchModule {
            id: id.to_string(),
            register: Box::new(register),
        }
    }

    /// A module whose descriptors are already built.
    pub fn from_descriptors(id: &str, descriptors: Vec<PatchDescriptor>) -> Self {
        Self::new(id, move |_| descriptors.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for PatchModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchModule({})", self.id)
    }
}

/// Process-wide installation state, constructed explicitly and handed to
/// the engine.
///
/// Descriptors are consumed exactly once: each `install` pass takes the
/// descriptors registered since the previous pass. Outcomes accumulate for
/// the lifetime of the session.
pub struct ApplicationSession {
    host_version: HostVersion,
    capabilities: Capabilities,
    config: SessionConfig,
    descriptors: Vec<PatchDescriptor>,
    consumed: usize,
    outcomes: Vec<PatchOutcome>,
    installed: HashSet<PatchId>,
    /// Patches carried by the redirect installed on each method.
    redirects: HashMap<MethodHandle, Vec<PatchId>>,
}

impl ApplicationSession {
    pub fn new(host_version: HostVersion, config: SessionConfig) -> Self {
        let host_version = config.host_version.unwrap_or(host_version);
        ApplicationSession {
            host_version,
            capabilities: config.extra_capabilities.clone(),
            config,
            descriptors: Vec::new(),
            consumed: 0,
            outcomes: Vec::new(),
            installed: HashSet::new(),
            redirects: HashMap::new(),
        }
    }

    /// Session for a live host, taking its reported version unless the
    /// config overrides it.
    pub fn for_host<H: Host + ?Sized>(host: &H, config: SessionConfig) -> Self {
        Self::new(host.version(), config)
    }

    pub fn register(&mut self, descriptor: PatchDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Invokes the module's entry point once and queues what it yields.
    /// Calling this again for a reloaded module queues fresh descriptors.
    pub fn register_module(&mut self, module: &PatchModule) -> usize {
        let descriptors = (module.register)(&module.id);
        let count = descriptors.len();
        tracing::debug!(module = %module.id, count, "registered module");
        self.descriptors.extend(descriptors);
        count
    }

    /// Runs one installation pass against `host`. See [`engine::install`].
    pub fn install<H: Host + ?Sized>(&mut self, host: &mut H) -> OutcomeSummary {
        engine::install(self, host)
    }

    pub fn host_version(&self) -> HostVersion {
        self.host_version
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        self.descriptors.len() - self.consumed
    }

    pub fn outcomes(&self) -> &[PatchOutcome] {
        &self.outcomes
    }

    pub fn is_installed(&self, id: &PatchId) -> bool {
        self.installed.contains(id)
    }

    /// The reporting surface: every outcome recorded so far, in order.
    pub fn for_each_outcome<F>(&self, mut callback: F)
    where
        F: FnMut(&PatchOutcome),
    {
        for outcome in &self.outcomes {
            callback(outcome);
        }
    }

    /// Outcomes that should reach the user.
    pub fn failures(&self) -> impl Iterator<Item = &PatchOutcome> {
        self.outcomes.iter().filter(|o| o.is_reportable())
    }

    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary::tally(&self.outcomes)
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PatchDescriptor> {
        let pending = self.descriptors[self.consumed..].to_vec();
        self.consumed = self.descriptors.len();
        pending
    }

    pub(crate) fn add_capability(&mut self, name: &str) {
        self.capabilities.insert(name.to_string());
    }

    pub(crate) fn mark_installed(&mut self, id: PatchId) {
        self.installed.insert(id);
    }

    pub(crate) fn redirect_on(&self, method: MethodHandle) -> Option<&[PatchId]> {
        self.redirects.get(&method).map(Vec::as_slice)
    }

    pub(crate) fn record_redirect(&mut self, method: MethodHandle, patches: Vec<PatchId>) {
        self.redirects.insert(method, patches);
    }

    pub(crate) fn record(&mut self, outcomes: impl IntoIterator<Item = PatchOutcome>) {
        self.outcomes.extend(outcomes);
    }
}
