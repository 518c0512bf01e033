use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::ir::Program;

/// Raw address as seen by the IR: flat little-endian memory, caller-owned.
/// Wrapping arithmetic only; validity of every dereference is the
/// program author's responsibility.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawPtr(*mut u8);

unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

impl RawPtr {
    pub const NULL: RawPtr = RawPtr(std::ptr::null_mut());

    pub fn new(ptr: *mut u8) -> Self {
        RawPtr(ptr)
    }

    pub fn from_ref<T>(value: &T) -> Self {
        RawPtr(value as *const T as *mut u8)
    }

    pub fn from_addr(addr: u64) -> Self {
        RawPtr(addr as usize as *mut u8)
    }

    pub fn get(self) -> *mut u8 {
        self.0
    }

    pub fn addr(self) -> u64 {
        self.0 as usize as u64
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn offset(self, delta: i64) -> Self {
        RawPtr(self.0.wrapping_offset(delta as isize))
    }

    pub fn add(self, delta: u64) -> Self {
        RawPtr(self.0.wrapping_add(delta as usize))
    }

    pub fn sub(self, delta: u64) -> Self {
        RawPtr(self.0.wrapping_sub(delta as usize))
    }
}

impl Default for RawPtr {
    fn default() -> Self {
        RawPtr::NULL
    }
}

impl fmt::Debug for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

/// One argument or return slot: an integer and a pointer view of the
/// same position, like a machine register that may carry either.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Slot {
    pub u: u64,
    pub p: RawPtr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyClass {
    I8,
    I16,
    I32,
    I64,
    Str,
    Ptr,
    Opaque,
}

#[derive(Clone, Debug)]
pub struct MapDesc {
    pub key: KeyClass,
    pub key_size: usize,
    pub val_size: usize,
    fast: bool,
}

#[derive(Clone, Debug)]
pub enum TypeKind {
    Scalar,
    Record,
    Pointer,
    Map(MapDesc),
}

/// Schema-derived description of a destination type. The translator bakes
/// the descriptor's address into `ip` immediates; host helpers get it back
/// at call time. Record descriptors may carry the translated decoder
/// program for their type, which is what the recursive decode helper
/// dispatches through.
pub struct TypeDesc {
    pub name: String,
    pub size: usize,
    pub kind: TypeKind,
    decoder: OnceLock<Arc<Program>>,
}

impl TypeDesc {
    fn new(name: &str, size: usize, kind: TypeKind) -> Arc<Self> {
        Arc::new(TypeDesc {
            name: name.to_string(),
            size,
            kind,
            decoder: OnceLock::new(),
        })
    }

    pub fn scalar(name: &str, size: usize) -> Arc<Self> {
        Self::new(name, size, TypeKind::Scalar)
    }

    pub fn record(name: &str, size: usize) -> Arc<Self> {
        Self::new(name, size, TypeKind::Record)
    }

    pub fn pointer(name: &str) -> Arc<Self> {
        Self::new(name, 8, TypeKind::Pointer)
    }

    /// Map whose fast-insert eligibility follows from the key class.
    pub fn map(name: &str, key: KeyClass, key_size: usize, val_size: usize) -> Arc<Self> {
        let fast = matches!(
            key,
            KeyClass::I32 | KeyClass::I64 | KeyClass::Str | KeyClass::Ptr
        );
        Self::new(
            name,
            8,
            TypeKind::Map(MapDesc {
                key,
                key_size,
                val_size,
                fast,
            }),
        )
    }

    /// Map that must go through the generic key-address insert path even
    /// if the key width would normally qualify (custom key types).
    pub fn map_opaque(name: &str, key_size: usize, val_size: usize) -> Arc<Self> {
        Self::new(
            name,
            8,
            TypeKind::Map(MapDesc {
                key: KeyClass::Opaque,
                key_size,
                val_size,
                fast: false,
            }),
        )
    }

    pub fn map_desc(&self) -> Option<&MapDesc> {
        match &self.kind {
            TypeKind::Map(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn is_fast_map(&self) -> bool {
        self.map_desc().is_some_and(|desc| desc.fast)
    }

    pub fn set_decoder(&self, program: Arc<Program>) {
        let _ = self.decoder.set(program);
    }

    pub fn decoder(&self) -> Option<Arc<Program>> {
        self.decoder.get().cloned()
    }
}

// manual impl: the decoder program references descriptors in turn, and a
// derived Debug would chase that cycle
impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDesc")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
