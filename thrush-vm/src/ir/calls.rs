use std::fmt;
use std::sync::{Arc, RwLock};

use crate::emu::Emulator;

use super::Instr;

/// Identity of a registered call handle, baked into `ccall`/`gcall`/
/// `icall` immediates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallId(u32);

impl CallId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        CallId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Foreign,
    Host,
    Interface,
}

/// A host function invocable from IR. Arguments are read from the
/// registers routed onto the call instruction; results are written to the
/// routed return registers. Invocation is synchronous and must not park.
pub trait CallHandle: Send + Sync {
    fn call(&self, emu: &mut Emulator, ins: &Instr);
}

impl<F> CallHandle for F
where
    F: Fn(&mut Emulator, &Instr) + Send + Sync,
{
    fn call(&self, emu: &mut Emulator, ins: &Instr) {
        self(emu, ins)
    }
}

pub struct RegisteredCall {
    name: String,
    kind: CallKind,
    handle: Box<dyn CallHandle>,
}

impl RegisteredCall {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn call(&self, emu: &mut Emulator, ins: &Instr) {
        self.handle.call(emu, ins)
    }
}

// Append-only: ids are stable once handed out, reads are concurrent,
// registrations happen during process initialization.
static REGISTRY: RwLock<Vec<Arc<RegisteredCall>>> = RwLock::new(Vec::new());

fn register(name: &str, kind: CallKind, handle: impl CallHandle + 'static) -> CallId {
    let mut registry = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    let id = CallId(registry.len() as u32);
    registry.push(Arc::new(RegisteredCall {
        name: name.to_string(),
        kind,
        handle: Box::new(handle),
    }));
    id
}

pub fn register_ccall(name: &str, handle: impl CallHandle + 'static) -> CallId {
    register(name, CallKind::Foreign, handle)
}

pub fn register_gcall(name: &str, handle: impl CallHandle + 'static) -> CallId {
    register(name, CallKind::Host, handle)
}

pub fn register_icall(name: &str, handle: impl CallHandle + 'static) -> CallId {
    register(name, CallKind::Interface, handle)
}

/// Fatal on an unknown id: a call immediate that never came from
/// registration is a programmer error, not a runtime condition.
pub fn lookup_call(id: CallId) -> Arc<RegisteredCall> {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    match registry.get(id.0 as usize) {
        Some(call) => call.clone(),
        None => panic!("unregistered call id {id}"),
    }
}

pub(crate) fn call_name(id: CallId) -> String {
    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    match registry.get(id.0 as usize) {
        Some(call) => call.name.clone(),
        None => id.to_string(),
    }
}
