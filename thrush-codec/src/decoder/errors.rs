//! Error constructors invoked from the generated error blocks. Each
//! builds the two-word discriminator `(kind, data)` that flows through
//! `ET`/`EP` into the return slots.

use std::sync::LazyLock;

use vm::emu::Emulator;
use vm::ir::{self, CallId, Instr};
use vm::rt::{RawPtr, TypeDesc};

use super::{K_EOF, K_MISSING, K_OVERFLOW, K_SKIP, K_TYPE};

/// Boxed payload behind the data word of a missing-required error.
#[derive(Debug)]
pub(crate) struct MissingDetail {
    pub type_name: String,
    pub word: u64,
    pub mask: u64,
}

/// Prebuilt overflow error value: the overflow block loads both words
/// straight from this static instead of calling a constructor.
pub(crate) static E_OVERFLOW: [u64; 2] = [K_OVERFLOW, 0];

fn emu_error_eof(e: &mut Emulator, p: &Instr) {
    let shortfall = e.arg_u(p, 0);
    e.set_ret_p(p, 0, RawPtr::from_addr(K_EOF));
    e.set_ret_p(p, 1, RawPtr::from_addr(shortfall));
}

fn emu_error_type(e: &mut Emulator, p: &Instr) {
    let expected = e.arg_u(p, 0) & 0xff;
    let got = e.arg_u(p, 1) & 0xff;
    e.set_ret_p(p, 0, RawPtr::from_addr(K_TYPE));
    e.set_ret_p(p, 1, RawPtr::from_addr(expected << 8 | got));
}

fn emu_error_skip(e: &mut Emulator, p: &Instr) {
    let code = e.arg_u(p, 0);
    e.set_ret_p(p, 0, RawPtr::from_addr(K_SKIP));
    e.set_ret_p(p, 1, RawPtr::from_addr(code));
}

fn emu_error_missing(e: &mut Emulator, p: &Instr) {
    let td = unsafe { &*(e.arg_p(p, 0).get() as *const TypeDesc) };
    let word = e.arg_u(p, 1);
    let mask = e.arg_u(p, 2);
    let detail = Box::new(MissingDetail {
        type_name: td.name.clone(),
        word,
        mask,
    });
    e.set_ret_p(p, 0, RawPtr::from_addr(K_MISSING));
    e.set_ret_p(p, 1, RawPtr::new(Box::into_raw(detail) as *mut u8));
}

pub(crate) static F_ERROR_EOF: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("error_eof", emu_error_eof));
pub(crate) static F_ERROR_TYPE: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("error_type", emu_error_type));
pub(crate) static F_ERROR_SKIP: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("error_skip", emu_error_skip));
pub(crate) static F_ERROR_MISSING: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("error_missing", emu_error_missing));
