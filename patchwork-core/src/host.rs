//! The boundary to the host application.
//!
//! The host is closed and only reachable through this trait: method lookup by
//! signature, reading a method's compiled body, and installing either a
//! redirect or a replacement body.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::body::RawMethodBody;
use crate::descriptor::PatchId;
use crate::gate::HostVersion;
use crate::instruction::{Constant, MethodRef};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("method {0} has no readable body")]
    NoBody(String),

    #[error("method {0} already carries an installed redirect")]
    AlreadyRedirected(String),

    #[error("method {0} is not known to the host")]
    UnknownMethod(String),

    #[error("host refused installation on {method}: {reason}")]
    Refused { method: String, reason: String },
}

/// Opaque host-side handle for a resolved method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodHandle(pub u64);

/// Metadata returned by a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub handle: MethodHandle,
    pub signature: MethodRef,
    /// Host module that declares the method.
    pub module: String,
}

/// Arguments and result of one call passing through a redirect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallContext {
    pub args: Vec<Constant>,
    pub result: Option<Constant>,
    /// Set by a `Before` hook to suppress the original (or replacement).
    pub skip_original: bool,
}

impl CallContext {
    pub fn new(args: Vec<Constant>) -> Self {
        CallContext {
            args,
            result: None,
            skip_original: false,
        }
    }
}

pub type HookFn = Arc<dyn Fn(&mut CallContext) + Send + Sync>;

/// A hook function tagged with the patch that contributed it.
#[derive(Clone)]
pub struct Hook {
    pub patch: PatchId,
    pub func: HookFn,
}

impl Hook {
    pub fn call(&self, ctx: &mut CallContext) {
        (self.func)(ctx)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.patch)
    }
}

/// Everything installed in front of one method: `before` hooks in order,
/// an optional replacement of the original, then `after` hooks in order.
#[derive(Debug, Clone, Default)]
pub struct Redirect {
    pub before: Vec<Hook>,
    pub replacement: Option<Hook>,
    pub after: Vec<Hook>,
}

impl Redirect {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.replacement.is_none() && self.after.is_empty()
    }

    /// Runs the chain around `original`.
    pub fn invoke<F>(&self, ctx: &mut CallContext, original: F)
    where
        F: FnOnce(&mut CallContext),
    {
        for hook in &self.before {
            hook.call(ctx);
        }
        if !ctx.skip_original {
            match &self.replacement {
                Some(hook) => hook.call(ctx),
                None => original(ctx),
            }
        }
        for hook in &self.after {
            hook.call(ctx);
        }
    }
}

pub trait Host {
    fn version(&self) -> HostVersion;

    fn has_capability(&self, _name: &str) -> bool {
        false
    }

    fn lookup_method(&self, signature: &MethodRef) -> Option<MethodInfo>;

    fn read_body(&self, method: &MethodInfo) -> Result<RawMethodBody, HostError>;

    fn install_redirect(
        &mut self,
        method: &MethodInfo,
        redirect: Redirect,
    ) -> Result<(), HostError>;

    fn install_body(&mut self, method: &MethodInfo, body: RawMethodBody) -> Result<(), HostError>;
}
