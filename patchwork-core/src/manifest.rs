//! Declarative mod modules.
//!
//! A manifest is a JSON file naming a module and its patches. Hook patches
//! refer to hook functions by name through a [`HookRegistry`]; rewrite
//! patches carry their pattern and edit as data. Either way a manifest ends
//! up as ordinary [`PatchDescriptor`]s, so the engine never knows where a
//! descriptor came from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

use crate::body::{BodyError, MethodBody, RawInstruction, RawMethodBody, RawOperand};
use crate::descriptor::{PatchAction, PatchDescriptor};
use crate::gate::HostVersion;
use crate::host::{CallContext, HookFn};
use crate::instruction::{InstrId, Instruction, MethodRef, Opcode, Operand};
use crate::pattern::{self, Matcher, Pattern};
use crate::rewrite::{self, RewriteError};
use crate::session::PatchModule;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to scan manifest directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("patch '{patch}' uses unknown hook '{hook}'")]
    UnknownHook { patch: String, hook: String },

    #[error("patch '{patch}': patterns cannot match on branch target indices")]
    TargetInPattern { patch: String },

    #[error("patch '{patch}': pattern has no instruction matcher")]
    EmptyPattern { patch: String },

    #[error("patch '{patch}': invalid instruction block: {source}")]
    Block {
        patch: String,
        #[source]
        source: BodyError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Replace,
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub kind: HookKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Skip {
        skip: usize,
    },
    Match {
        opcode: Opcode,
        #[serde(default)]
        operand: Option<RawOperand>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSpec {
    Replace(Vec<RawInstruction>),
    NopOut,
    InsertBefore(Vec<RawInstruction>),
    InsertAfter(Vec<RawInstruction>),
    /// Applies to the last instruction of the match, which must be a
    /// conditional branch.
    ForceBranch(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteSpec {
    pub find: Vec<StepSpec>,
    /// Search only after the first match of this pattern.
    #[serde(default)]
    pub after: Option<Vec<StepSpec>>,
    /// Refuse to rewrite if `find` matches in more than one place.
    #[serde(default)]
    pub unique: bool,
    /// Local slots to declare before editing, in order.
    #[serde(default)]
    pub add_locals: Vec<String>,
    pub action: ActionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchBodySpec {
    Hook(HookSpec),
    Rewrite(RewriteSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSpec {
    pub name: String,
    pub target: MethodRef,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub min_version: Option<HostVersion>,
    #[serde(default)]
    pub max_version: Option<HostVersion>,
    #[serde(default)]
    pub requires: Option<String>,
    #[serde(flatten)]
    pub body: PatchBodySpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub module: String,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

/// Named hook functions that manifests may refer to.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `trace` (logs the call) and `skip` (suppresses the
    /// original) already present.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("trace", |ctx: &mut CallContext| {
            tracing::info!(args = ?ctx.args, result = ?ctx.result, "hooked call");
        });
        registry.register("skip", |ctx: &mut CallContext| {
            ctx.skip_original = true;
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, hook: F)
    where
        F: Fn(&mut CallContext) + Send + Sync + 'static,
    {
        self.hooks.insert(name.to_string(), Arc::new(hook));
    }

    pub fn get(&self, name: &str) -> Option<HookFn> {
        self.hooks.get(name).cloned()
    }
}

impl ModuleManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_descriptors(
        &self,
        hooks: &HookRegistry,
    ) -> Result<Vec<PatchDescriptor>, ManifestError> {
        self.patches
            .iter()
            .map(|spec| self.descriptor(spec, hooks))
            .collect()
    }

    /// Builds every descriptor up front so manifest mistakes surface at load
    /// time, then wraps them as a module.
    pub fn into_module(self, hooks: &HookRegistry) -> Result<PatchModule, ManifestError> {
        let descriptors = self.to_descriptors(hooks)?;
        Ok(PatchModule::from_descriptors(&self.module, descriptors))
    }

    fn descriptor(
        &self,
        spec: &PatchSpec,
        hooks: &HookRegistry,
    ) -> Result<PatchDescriptor, ManifestError> {
        let action = match &spec.body {
            PatchBodySpec::Hook(h) => {
                let func = hooks.get(&h.name).ok_or_else(|| ManifestError::UnknownHook {
                    patch: spec.name.clone(),
                    hook: h.name.clone(),
                })?;
                match h.kind {
                    HookKind::Replace => PatchAction::Replace(func),
                    HookKind::Before => PatchAction::Before(func),
                    HookKind::After => PatchAction::After(func),
                }
            }
            PatchBodySpec::Rewrite(r) => {
                PatchAction::StreamRewrite(Arc::new(compile_rewrite(&spec.name, r)?))
            }
        };

        let mut d = PatchDescriptor::new(&self.module, &spec.name, spec.target.clone(), action)
            .priority(spec.priority);
        d.min_version = spec.min_version;
        d.max_version = spec.max_version;
        d.required_capability = spec.requires.clone();
        Ok(d)
    }
}

fn compile_pattern(patch: &str, label: &str, steps: &[StepSpec]) -> Result<Pattern, ManifestError> {
    let mut p = Pattern::new(&format!("{}:{}", patch, label));
    let mut has_matcher = false;
    for step in steps {
        p = match step {
            StepSpec::Skip { skip } => p.skip_up_to(*skip),
            StepSpec::Match { opcode, operand: None } => {
                has_matcher = true;
                p.then(Matcher::opcode(*opcode))
            }
            StepSpec::Match {
                opcode,
                operand: Some(raw),
            } => {
                has_matcher = true;
                let operand = match raw.clone() {
                    RawOperand::Const(c) => Operand::Const(c),
                    RawOperand::Arg(a) => Operand::Arg(a),
                    RawOperand::Local(l) => Operand::Local(l),
                    RawOperand::Field(f) => Operand::Field(f),
                    RawOperand::Method(m) => Operand::Method(m),
                    RawOperand::Target(_) => {
                        return Err(ManifestError::TargetInPattern {
                            patch: patch.to_string(),
                        })
                    }
                };
                p.then(Matcher::exact(*opcode, operand))
            }
        };
    }
    if !has_matcher {
        return Err(ManifestError::EmptyPattern {
            patch: patch.to_string(),
        });
    }
    Ok(p)
}

/// Turns a raw block into instructions with fresh ids. Target indices are
/// relative to the block itself.
fn build_block(raw: &[RawInstruction]) -> Result<Vec<Instruction>, BodyError> {
    let block = RawMethodBody {
        locals: Vec::new(),
        instructions: raw.to_vec(),
    };
    // the signature only matters for verification, which is not run here
    let body = MethodBody::from_raw(MethodRef::new("", ""), &block)?;
    Ok(body.instructions().to_vec())
}

fn compile_rewrite(
    patch: &str,
    spec: &RewriteSpec,
) -> Result<
    impl Fn(&mut MethodBody) -> Result<(), RewriteError> + Send + Sync + 'static,
    ManifestError,
> {
    let find = compile_pattern(patch, "find", &spec.find)?;
    let anchor = match &spec.after {
        Some(steps) => Some(compile_pattern(patch, "after", steps)?),
        None => None,
    };
    let block_err = |source| ManifestError::Block {
        patch: patch.to_string(),
        source,
    };
    match &spec.action {
        ActionSpec::Replace(raw) | ActionSpec::InsertBefore(raw) | ActionSpec::InsertAfter(raw) => {
            build_block(raw).map_err(block_err)?;
        }
        ActionSpec::NopOut | ActionSpec::ForceBranch(_) => {}
    }

    let unique = spec.unique;
    let add_locals = spec.add_locals.clone();
    let action = spec.action.clone();

    Ok(move |body: &mut MethodBody| -> Result<(), RewriteError> {
        let range = match &anchor {
            Some(anchor_pattern) => {
                let hit = pattern::expect(body, anchor_pattern)?;
                let anchor_id: InstrId = body.instructions()[hit.end - 1].id;
                if unique {
                    pattern::find_unique_after(body, &find, anchor_id)?
                } else {
                    pattern::find_after(body, &find, anchor_id).ok_or_else(|| {
                        RewriteError::PatternNotFound {
                            pattern: find.name().to_string(),
                        }
                    })?
                }
            }
            None if unique => pattern::find_unique(body, &find)?,
            None => pattern::expect(body, &find)?,
        };

        for ty in &add_locals {
            body.add_local(ty);
        }

        match &action {
            ActionSpec::Replace(raw) => {
                rewrite::replace(body, range, build_block(raw)?)?;
            }
            ActionSpec::NopOut => {
                rewrite::nop_out(body, range)?;
            }
            ActionSpec::InsertBefore(raw) => {
                rewrite::insert(body, range.start, build_block(raw)?)?;
            }
            ActionSpec::InsertAfter(raw) => {
                rewrite::insert(body, range.end, build_block(raw)?)?;
            }
            ActionSpec::ForceBranch(taken) => {
                let last = body.instructions()[range.end - 1].id;
                rewrite::force_branch(body, last, *taken)?;
            }
        }
        Ok(())
    })
}

/// Every `*.json` manifest under `dir`, in path order.
pub fn discover(dir: &Path) -> Result<Vec<(PathBuf, ModuleManifest)>, ManifestError> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map_or(true, |e| e != "json") {
            continue;
        }
        let manifest = ModuleManifest::load(path)?;
        tracing::debug!(path = %path.display(), module = %manifest.module, "found manifest");
        found.push((path.to_path_buf(), manifest));
    }
    Ok(found)
}
