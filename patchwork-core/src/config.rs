use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::descriptor::PatchDescriptor;
use crate::gate::HostVersion;
use crate::{PatchworkError, Result};

/// User-facing session settings, read from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Modules whose patches are all skipped.
    pub disabled_modules: BTreeSet<String>,
    /// Individual patches, as `module/name`.
    pub disabled_patches: BTreeSet<String>,
    /// Capabilities to assume present in addition to what the host reports.
    pub extra_capabilities: BTreeSet<String>,
    /// Pretend the host runs this version.
    pub host_version: Option<HostVersion>,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            PatchworkError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn is_disabled(&self, descriptor: &PatchDescriptor) -> bool {
        self.disabled_modules.contains(descriptor.module())
            || self.disabled_patches.contains(&descriptor.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::MethodRef;

    #[test]
    fn missing_fields_default() {
        let cfg: SessionConfig = serde_json::from_str(r#"{"disabled_modules":["ui"]}"#).unwrap();
        assert!(cfg.disabled_modules.contains("ui"));
        assert!(cfg.disabled_patches.is_empty());
        assert_eq!(cfg.host_version, None);
    }

    #[test]
    fn disables_by_module_or_patch_id() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"disabled_modules":["ui"],"disabled_patches":["physics/gravity"],"host_version":"1.4"}"#,
        )
        .unwrap();
        assert_eq!(cfg.host_version, Some(HostVersion::new(1, 4, 0)));

        let target = MethodRef::new("Physics", "Step");
        let ui = PatchDescriptor::before("ui", "any", target.clone(), |_| {});
        let gravity = PatchDescriptor::before("physics", "gravity", target.clone(), |_| {});
        let drag = PatchDescriptor::before("physics", "drag", target, |_| {});
        assert!(cfg.is_disabled(&ui));
        assert!(cfg.is_disabled(&gravity));
        assert!(!cfg.is_disabled(&drag));
    }

    #[test]
    fn load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(PatchworkError::Config(_))));
    }
}
