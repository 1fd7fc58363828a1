//! An in-memory host.
//!
//! `SimHost` stands in for the closed application in tests and in the CLI.
//! It keeps each method's shipped body, whatever body or redirect has been
//! installed over it, and can run a method through its redirect chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::body::RawMethodBody;
use crate::gate::HostVersion;
use crate::host::{CallContext, HookFn, Host, HostError, MethodHandle, MethodInfo, Redirect};
use crate::instruction::{Constant, MethodRef};
use crate::{PatchworkError, Result};

fn default_module() -> String {
    "Host".to_string()
}

/// Serialized description of a host: version, capabilities and methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostImage {
    pub version: HostVersion,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub methods: Vec<ImageMethod>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMethod {
    pub signature: MethodRef,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub body: RawMethodBody,
}

impl HostImage {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            PatchworkError::Config(format!("failed to parse host image {}: {}", path.display(), e))
        })
    }
}

struct SimMethod {
    info: MethodInfo,
    shipped: RawMethodBody,
    behavior: Option<HookFn>,
    redirect: Option<Redirect>,
    body: Option<RawMethodBody>,
    installs: usize,
}

pub struct SimHost {
    version: HostVersion,
    capabilities: BTreeSet<String>,
    methods: Vec<SimMethod>,
}

impl SimHost {
    pub fn new(version: HostVersion) -> Self {
        SimHost {
            version,
            capabilities: BTreeSet::new(),
            methods: Vec::new(),
        }
    }

    pub fn from_image(image: HostImage) -> Self {
        let mut host = SimHost::new(image.version);
        host.capabilities = image.capabilities;
        for m in image.methods {
            host.add_method_in(m.signature, &m.module, m.body);
        }
        host
    }

    pub fn add_capability(&mut self, name: &str) {
        self.capabilities.insert(name.to_string());
    }

    pub fn add_method(&mut self, signature: MethodRef, body: RawMethodBody) -> MethodHandle {
        self.add_method_in(signature, &default_module(), body)
    }

    pub fn add_method_in(
        &mut self,
        signature: MethodRef,
        module: &str,
        body: RawMethodBody,
    ) -> MethodHandle {
        let handle = MethodHandle(self.methods.len() as u64 + 1);
        self.methods.push(SimMethod {
            info: MethodInfo {
                handle,
                signature,
                module: module.to_string(),
            },
            shipped: body,
            behavior: None,
            redirect: None,
            body: None,
            installs: 0,
        });
        handle
    }

    /// What the unpatched method does when invoked.
    pub fn set_behavior<F>(&mut self, signature: &MethodRef, behavior: F) -> bool
    where
        F: Fn(&mut CallContext) + Send + Sync + 'static,
    {
        match self.find_mut(signature) {
            Some(m) => {
                m.behavior = Some(Arc::new(behavior));
                true
            }
            None => false,
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodInfo> {
        self.methods.iter().map(|m| &m.info)
    }

    pub fn redirect(&self, signature: &MethodRef) -> Option<&Redirect> {
        self.find(signature).and_then(|m| m.redirect.as_ref())
    }

    pub fn installed_body(&self, signature: &MethodRef) -> Option<&RawMethodBody> {
        self.find(signature).and_then(|m| m.body.as_ref())
    }

    /// Installed body if any, otherwise the shipped one.
    pub fn effective_body(&self, signature: &MethodRef) -> Option<&RawMethodBody> {
        self.find(signature)
            .map(|m| m.body.as_ref().unwrap_or(&m.shipped))
    }

    /// Number of successful installations (redirects and bodies) on a method.
    pub fn install_count(&self, signature: &MethodRef) -> usize {
        self.find(signature).map_or(0, |m| m.installs)
    }

    /// Calls a method through its redirect chain and returns its result.
    pub fn invoke(
        &self,
        signature: &MethodRef,
        args: Vec<Constant>,
    ) -> std::result::Result<Option<Constant>, HostError> {
        let method = self
            .find(signature)
            .ok_or_else(|| HostError::UnknownMethod(signature.to_string()))?;
        let mut ctx = CallContext::new(args);
        let original = |c: &mut CallContext| {
            if let Some(behavior) = &method.behavior {
                behavior(c);
            }
        };
        match &method.redirect {
            Some(redirect) => redirect.invoke(&mut ctx, original),
            None => original(&mut ctx),
        }
        Ok(ctx.result)
    }

    fn find(&self, signature: &MethodRef) -> Option<&SimMethod> {
        self.methods.iter().find(|m| &m.info.signature == signature)
    }

    fn find_mut(&mut self, signature: &MethodRef) -> Option<&mut SimMethod> {
        self.methods.iter_mut().find(|m| &m.info.signature == signature)
    }

    fn by_handle(&mut self, method: &MethodInfo) -> std::result::Result<&mut SimMethod, HostError> {
        self.methods
            .iter_mut()
            .find(|m| m.info.handle == method.handle)
            .ok_or_else(|| HostError::UnknownMethod(method.signature.to_string()))
    }
}

impl Host for SimHost {
    fn version(&self) -> HostVersion {
        self.version
    }

    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    fn lookup_method(&self, signature: &MethodRef) -> Option<MethodInfo> {
        self.find(signature).map(|m| m.info.clone())
    }

    fn read_body(&self, method: &MethodInfo) -> std::result::Result<RawMethodBody, HostError> {
        let m = self
            .methods
            .iter()
            .find(|m| m.info.handle == method.handle)
            .ok_or_else(|| HostError::UnknownMethod(method.signature.to_string()))?;
        let body = m.body.as_ref().unwrap_or(&m.shipped);
        if body.instructions.is_empty() {
            return Err(HostError::NoBody(method.signature.to_string()));
        }
        Ok(body.clone())
    }

    fn install_redirect(
        &mut self,
        method: &MethodInfo,
        redirect: Redirect,
    ) -> std::result::Result<(), HostError> {
        let m = self.by_handle(method)?;
        if m.redirect.is_some() {
            return Err(HostError::AlreadyRedirected(method.signature.to_string()));
        }
        m.redirect = Some(redirect);
        m.installs += 1;
        Ok(())
    }

    fn install_body(
        &mut self,
        method: &MethodInfo,
        body: RawMethodBody,
    ) -> std::result::Result<(), HostError> {
        let m = self.by_handle(method)?;
        if body.instructions.is_empty() {
            return Err(HostError::Refused {
                method: method.signature.to_string(),
                reason: "empty body".to_string(),
            });
        }
        m.body = Some(body);
        m.installs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RawInstruction;
    use crate::instruction::Opcode;

    const IMAGE: &str = r#"{
        "version": "1.5.0",
        "capabilities": ["Royalty"],
        "methods": [
            {
                "signature": { "declaring_type": "Pawn", "name": "Health", "returns": "int" },
                "module": "Core",
                "body": { "instructions": [
                    { "opcode": "load_const", "operand": { "const": { "int": 100 } } },
                    { "opcode": "return" }
                ] }
            },
            {
                "signature": { "declaring_type": "Pawn", "name": "Extern" }
            }
        ]
    }"#;

    fn health() -> MethodRef {
        MethodRef::new("Pawn", "Health").returning("int")
    }

    #[test]
    fn loads_image_json() {
        let image: HostImage = serde_json::from_str(IMAGE).unwrap();
        let host = SimHost::from_image(image);
        assert_eq!(host.version(), HostVersion::new(1, 5, 0));
        assert!(host.has_capability("Royalty"));

        let info = host.lookup_method(&health()).unwrap();
        assert_eq!(info.module, "Core");
        let body = host.read_body(&info).unwrap();
        assert_eq!(body.instructions.len(), 2);

        let ext = host.lookup_method(&MethodRef::new("Pawn", "Extern")).unwrap();
        assert!(matches!(host.read_body(&ext), Err(HostError::NoBody(_))));
    }

    #[test]
    fn lookup_requires_exact_signature() {
        let image: HostImage = serde_json::from_str(IMAGE).unwrap();
        let host = SimHost::from_image(image);
        assert!(host.lookup_method(&MethodRef::new("Pawn", "Health")).is_none());
        assert!(host
            .lookup_method(&health().with_params(&["int"]))
            .is_none());
    }

    #[test]
    fn second_redirect_is_refused() {
        let mut host = SimHost::new(HostVersion::new(1, 0, 0));
        host.add_method(health(), RawMethodBody::default());
        let info = host.lookup_method(&health()).unwrap();
        host.install_redirect(&info, Redirect::default()).unwrap();
        assert_eq!(
            host.install_redirect(&info, Redirect::default()),
            Err(HostError::AlreadyRedirected(health().to_string()))
        );
        assert_eq!(host.install_count(&health()), 1);
    }

    #[test]
    fn installed_body_becomes_effective() {
        let mut host = SimHost::new(HostVersion::new(1, 0, 0));
        host.add_method(
            health(),
            RawMethodBody {
                locals: vec![],
                instructions: vec![RawInstruction::new(Opcode::Return, None)],
            },
        );
        let info = host.lookup_method(&health()).unwrap();
        let replacement = RawMethodBody {
            locals: vec!["int".into()],
            instructions: vec![
                RawInstruction::new(Opcode::Nop, None),
                RawInstruction::new(Opcode::Return, None),
            ],
        };
        host.install_body(&info, replacement.clone()).unwrap();
        assert_eq!(host.effective_body(&health()), Some(&replacement));
        assert_eq!(host.read_body(&info).unwrap(), replacement);
    }

    #[test]
    fn invoke_runs_original_without_redirect() {
        let mut host = SimHost::new(HostVersion::new(1, 0, 0));
        host.add_method(health(), RawMethodBody::default());
        assert!(host.set_behavior(&health(), |ctx| ctx.result = Some(Constant::Int(100))));
        assert_eq!(host.invoke(&health(), vec![]).unwrap(), Some(Constant::Int(100)));
        assert!(host.invoke(&MethodRef::new("Pawn", "Nope"), vec![]).is_err());
    }
}
