use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::body::MethodBody;
use crate::gate::HostVersion;
use crate::host::{CallContext, HookFn};
use crate::instruction::MethodRef;
use crate::rewrite::RewriteError;

/// Identity of a patch unit: owning module plus a name unique within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchId {
    pub module: String,
    pub name: String,
}

impl PatchId {
    pub fn new(module: &str, name: &str) -> Self {
        PatchId {
            module: module.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Replace,
    Before,
    After,
    StreamRewrite,
}

impl PatchKind {
    pub fn is_redirect(self) -> bool {
        !matches!(self, PatchKind::StreamRewrite)
    }
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchKind::Replace => "replace",
            PatchKind::Before => "before",
            PatchKind::After => "after",
            PatchKind::StreamRewrite => "rewrite",
        };
        f.write_str(s)
    }
}

pub type RewriteFn = Arc<dyn Fn(&mut MethodBody) -> Result<(), RewriteError> + Send + Sync>;

#[derive(Clone)]
pub enum PatchAction {
    Replace(HookFn),
    Before(HookFn),
    After(HookFn),
    StreamRewrite(RewriteFn),
}

impl PatchAction {
    pub fn kind(&self) -> PatchKind {
        match self {
            PatchAction::Replace(_) => PatchKind::Replace,
            PatchAction::Before(_) => PatchKind::Before,
            PatchAction::After(_) => PatchKind::After,
            PatchAction::StreamRewrite(_) => PatchKind::StreamRewrite,
        }
    }
}

/// One declared modification to one target method.
///
/// Built once while modules register, then only read. The builder methods
/// consume and return the descriptor so a module can declare a patch in a
/// single expression.
#[derive(Clone)]
pub struct PatchDescriptor {
    pub id: PatchId,
    pub target: MethodRef,
    pub action: PatchAction,
    pub min_version: Option<HostVersion>,
    /// Inclusive upper bound.
    pub max_version: Option<HostVersion>,
    pub required_capability: Option<String>,
    /// Lower runs first; for `Replace`, the lowest wins.
    pub priority: i32,
}

impl PatchDescriptor {
    pub fn new(module: &str, name: &str, target: MethodRef, action: PatchAction) -> Self {
        PatchDescriptor {
            id: PatchId::new(module, name),
            target,
            action,
            min_version: None,
            max_version: None,
            required_capability: None,
            priority: 0,
        }
    }

    pub fn replace<F>(module: &str, name: &str, target: MethodRef, hook: F) -> Self
    where
        F: Fn(&mut CallContext) + Send + Sync + 'static,
    {
        Self::new(module, name, target, PatchAction::Replace(Arc::new(hook)))
    }

    pub fn before<F>(module: &str, name: &str, target: MethodRef, hook: F) -> Self
    where
        F: Fn(&mut CallContext) + Send + Sync + 'static,
    {
        Self::new(module, name, target, PatchAction::Before(Arc::new(hook)))
    }

    pub fn after<F>(module: &str, name: &str, target: MethodRef, hook: F) -> Self
    where
        F: Fn(&mut CallContext) + Send + Sync + 'static,
    {
        Self::new(module, name, target, PatchAction::After(Arc::new(hook)))
    }

    pub fn rewrite<F>(module: &str, name: &str, target: MethodRef, rewrite: F) -> Self
    where
        F: Fn(&mut MethodBody) -> Result<(), RewriteError> + Send + Sync + 'static,
    {
        Self::new(module, name, target, PatchAction::StreamRewrite(Arc::new(rewrite)))
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn min_version(mut self, version: HostVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    pub fn max_version(mut self, version: HostVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn requires(mut self, capability: &str) -> Self {
        self.required_capability = Some(capability.to_string());
        self
    }

    pub fn kind(&self) -> PatchKind {
        self.action.kind()
    }

    pub fn module(&self) -> &str {
        &self.id.module
    }
}

impl fmt::Debug for PatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchDescriptor")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("kind", &self.kind())
            .field("min_version", &self.min_version)
            .field("max_version", &self.max_version)
            .field("required_capability", &self.required_capability)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_gating_fields() {
        let d = PatchDescriptor::before("ui", "tooltip", MethodRef::new("Tooltip", "Draw"), |_| {})
            .priority(-3)
            .min_version(HostVersion::new(1, 4, 0))
            .requires("Royalty");
        assert_eq!(d.kind(), PatchKind::Before);
        assert_eq!(d.priority, -3);
        assert_eq!(d.module(), "ui");
        assert_eq!(d.id.to_string(), "ui/tooltip");
        assert_eq!(d.required_capability.as_deref(), Some("Royalty"));
        assert!(d.max_version.is_none());
    }

    #[test]
    fn kinds_classify_redirects() {
        assert!(PatchKind::Replace.is_redirect());
        assert!(PatchKind::After.is_redirect());
        assert!(!PatchKind::StreamRewrite.is_redirect());
    }
}
