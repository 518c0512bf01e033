//! Reference implementations of the host runtime helpers the generated
//! decoders call into: allocation, map construction and insertion, value
//! skipping, and field-bitmap management. A real host may install its own
//! helpers with the same call-site contracts; these shims make the
//! emulator back-end self-contained.

use std::alloc::{self, Layout};
use std::sync::LazyLock;

use vm::emu::Emulator;
use vm::ir::{self, CallId, Instr};
use vm::rt::{KeyClass, RawPtr, TypeDesc};

use crate::state;
use crate::wire;

/// Map store with address-stable value cells. Entry identity is the
/// logical key bytes: string keys compare by content, scalar and pointer
/// keys by their little-endian representation.
pub struct RawMap {
    key: KeyClass,
    key_size: usize,
    val_size: usize,
    entries: Vec<MapCell>,
}

struct MapCell {
    key: Box<[u8]>,
    val: Box<[u8]>,
}

impl RawMap {
    fn for_type(td: &TypeDesc, hint: usize) -> Box<RawMap> {
        let desc = td
            .map_desc()
            .unwrap_or_else(|| panic!("makemap on non-map type '{}'", td.name));
        Box::new(RawMap {
            key: desc.key,
            key_size: desc.key_size,
            val_size: desc.val_size,
            entries: Vec::with_capacity(hint),
        })
    }

    fn assign(&mut self, key: Vec<u8>) -> *mut u8 {
        if let Some(at) = self.entries.iter().position(|cell| *cell.key == *key) {
            return self.entries[at].val.as_mut_ptr();
        }
        self.entries.push(MapCell {
            key: key.into_boxed_slice(),
            val: vec![0u8; self.val_size.max(1)].into_boxed_slice(),
        });
        self.entries
            .last_mut()
            .map(|cell| cell.val.as_mut_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    unsafe fn key_at(&self, key_ptr: RawPtr) -> Vec<u8> {
        match self.key {
            KeyClass::Str => unsafe {
                let data = key_ptr.get().cast::<*const u8>().read_unaligned();
                let len = key_ptr.offset(8).get().cast::<u64>().read_unaligned() as usize;
                if data.is_null() || len == 0 {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts(data, len).to_vec()
                }
            },
            _ => unsafe {
                std::slice::from_raw_parts(key_ptr.get(), self.key_size.max(1)).to_vec()
            },
        }
    }
}

/// # Safety
/// `map` must be a live pointer produced by the `makemap` helper.
pub unsafe fn map_len(map: RawPtr) -> usize {
    unsafe { (*(map.get() as *const RawMap)).entries.len() }
}

/// # Safety
/// `map` must be a live pointer produced by the `makemap` helper.
pub unsafe fn map_get(map: RawPtr, key: &[u8]) -> Option<*const u8> {
    let map = unsafe { &*(map.get() as *const RawMap) };
    map.entries
        .iter()
        .find(|cell| *cell.key == *key)
        .map(|cell| cell.val.as_ptr())
}

/// # Safety
/// `map` must come from the `makemap` helper and must not be used again.
pub unsafe fn map_free(map: RawPtr) {
    drop(unsafe { Box::from_raw(map.get() as *mut RawMap) });
}

/// Zeroed 8-aligned allocation. Ownership passes to the decoded object
/// graph; reclamation is the embedder's concern.
pub fn alloc_zeroed_block(size: usize) -> RawPtr {
    let layout = Layout::from_size_align(size.max(1), 8).expect("allocation layout");
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        alloc::handle_alloc_error(layout);
    }
    RawPtr::new(ptr)
}

unsafe fn type_desc<'a>(ptr: RawPtr) -> &'a TypeDesc {
    unsafe { &*(ptr.get() as *const TypeDesc) }
}

fn emu_mallocgc(e: &mut Emulator, p: &Instr) {
    let size = e.arg_u(p, 0) as usize;
    let _vt = e.arg_p(p, 1);
    let _zeroed = e.arg_u(p, 2);
    e.set_ret_p(p, 0, alloc_zeroed_block(size));
}

fn emu_makemap(e: &mut Emulator, p: &Instr) {
    let td = unsafe { type_desc(e.arg_p(p, 0)) };
    let hint = e.arg_u(p, 1) as usize;
    let _old = e.arg_p(p, 2);
    let map = RawMap::for_type(td, hint);
    e.set_ret_p(p, 0, RawPtr::new(Box::into_raw(map) as *mut u8));
}

fn emu_mapassign(e: &mut Emulator, p: &Instr) {
    let _td = unsafe { type_desc(e.arg_p(p, 0)) };
    let map = unsafe { &mut *(e.arg_p(p, 1).get() as *mut RawMap) };
    let key = unsafe { map.key_at(e.arg_p(p, 2)) };
    e.set_ret_p(p, 0, RawPtr::new(map.assign(key)));
}

fn emu_mapassign_fast32(e: &mut Emulator, p: &Instr) {
    let map = unsafe { &mut *(e.arg_p(p, 1).get() as *mut RawMap) };
    let key = (e.arg_u(p, 2) as u32).to_le_bytes().to_vec();
    e.set_ret_p(p, 0, RawPtr::new(map.assign(key)));
}

fn emu_mapassign_fast64(e: &mut Emulator, p: &Instr) {
    let map = unsafe { &mut *(e.arg_p(p, 1).get() as *mut RawMap) };
    let key = e.arg_u(p, 2).to_le_bytes().to_vec();
    e.set_ret_p(p, 0, RawPtr::new(map.assign(key)));
}

fn emu_mapassign_fast64ptr(e: &mut Emulator, p: &Instr) {
    let map = unsafe { &mut *(e.arg_p(p, 1).get() as *mut RawMap) };
    let key = e.arg_p(p, 2).addr().to_le_bytes().to_vec();
    e.set_ret_p(p, 0, RawPtr::new(map.assign(key)));
}

fn emu_mapassign_faststr(e: &mut Emulator, p: &Instr) {
    let map = unsafe { &mut *(e.arg_p(p, 1).get() as *mut RawMap) };
    let data = e.arg_p(p, 2);
    let len = e.arg_u(p, 3) as usize;
    let key = if data.is_null() || len == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(data.get(), len).to_vec() }
    };
    e.set_ret_p(p, 0, RawPtr::new(map.assign(key)));
}

fn emu_skip(e: &mut Emulator, p: &Instr) {
    let _scratch = e.arg_p(p, 0);
    let buf = e.arg_p(p, 1);
    let len = e.arg_u(p, 2) as usize;
    let tag = e.arg_u(p, 3) as u8;
    let data: &[u8] = if len == 0 || buf.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(buf.get(), len) }
    };
    e.set_ret_u(p, 0, wire::skip(data, tag) as u64);
}

fn emu_new_field_bitmap(e: &mut Emulator, p: &Instr) {
    e.set_ret_p(p, 0, RawPtr::new(state::bitmap_alloc() as *mut u8));
}

fn emu_field_bitmap_free(e: &mut Emulator, p: &Instr) {
    let ptr = e.arg_p(p, 0);
    if !ptr.is_null() {
        unsafe { state::bitmap_free(ptr.get() as *mut u64) };
    }
}

pub static F_MALLOCGC: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mallocgc", emu_mallocgc));
pub static F_MAKEMAP: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("makemap", emu_makemap));
pub static F_MAPASSIGN: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mapassign", emu_mapassign));
pub static F_MAPASSIGN_FAST32: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mapassign_fast32", emu_mapassign_fast32));
pub static F_MAPASSIGN_FAST64: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mapassign_fast64", emu_mapassign_fast64));
pub static F_MAPASSIGN_FAST64PTR: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mapassign_fast64ptr", emu_mapassign_fast64ptr));
pub static F_MAPASSIGN_FASTSTR: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("mapassign_faststr", emu_mapassign_faststr));
pub static C_SKIP: LazyLock<CallId> = LazyLock::new(|| ir::register_ccall("skip", emu_skip));
pub static F_NEW_FIELD_BITMAP: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("new_field_bitmap", emu_new_field_bitmap));
pub static F_FIELD_BITMAP_FREE: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("field_bitmap_free", emu_field_bitmap_free));
