//! Decoder-side surface: invocation ABI, error model, the recursive
//! decode helper, and the linker façade that turns a translated program
//! into something callable.

use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

use vm::emu::Emulator;
use vm::ir::{self, CallId, Instr, Program};
use vm::rt::{RawPtr, TypeDesc};

mod errors;
mod translator;

pub use translator::{TranslateError, translate};

use errors::MissingDetail;

/// Argument slots of a generated decoder program.
pub const ARG_BUF: usize = 0;
pub const ARG_NB: usize = 1;
pub const ARG_I: usize = 2;
pub const ARG_P: usize = 3;
pub const ARG_RS: usize = 4;
pub const ARG_ST: usize = 5;

/// Return slots: final cursor plus the two-word error discriminator.
pub const RET_POS: usize = 0;
pub const RET_ERR_KIND: usize = 1;
pub const RET_ERR_DATA: usize = 2;

pub(crate) const K_EOF: u64 = 1;
pub(crate) const K_TYPE: u64 = 2;
pub(crate) const K_SKIP: u64 = 3;
pub(crate) const K_MISSING: u64 = 4;
pub(crate) const K_OVERFLOW: u64 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Eof {
        shortfall: u64,
    },
    TypeMismatch {
        expected: u8,
        got: u8,
    },
    Skip {
        code: i64,
    },
    MissingRequired {
        type_name: String,
        word: u64,
        mask: u64,
    },
    StackOverflow,
}

/// Decode failure: what went wrong and the cursor where it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub at: usize,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    /// Reconstruct from the two-word discriminator. Consumes the boxed
    /// payload behind missing-required errors.
    fn from_words(at: usize, kind: u64, data: u64) -> Self {
        let kind = match kind {
            K_EOF => DecodeErrorKind::Eof { shortfall: data },
            K_TYPE => DecodeErrorKind::TypeMismatch {
                expected: (data >> 8) as u8,
                got: data as u8,
            },
            K_SKIP => DecodeErrorKind::Skip { code: data as i64 },
            K_MISSING => {
                let detail = unsafe { Box::from_raw(data as usize as *mut MissingDetail) };
                DecodeErrorKind::MissingRequired {
                    type_name: detail.type_name,
                    word: detail.word,
                    mask: detail.mask,
                }
            }
            K_OVERFLOW => DecodeErrorKind::StackOverflow,
            other => panic!("unknown decode error kind {other:#x}"),
        };
        DecodeError { at, kind }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DecodeErrorKind::Eof { shortfall } => {
                write!(f, "unexpected end of input at {}: {shortfall} bytes short", self.at)
            }
            DecodeErrorKind::TypeMismatch { expected, got } => write!(
                f,
                "wire type mismatch at {}: expected {expected}, got {got}",
                self.at
            ),
            DecodeErrorKind::Skip { code } => {
                write!(f, "cannot skip unknown field at {}: code {code}", self.at)
            }
            DecodeErrorKind::MissingRequired {
                type_name,
                word,
                mask,
            } => write!(
                f,
                "missing required fields of {type_name} at {}: word {word}, mask {mask:#x}",
                self.at
            ),
            DecodeErrorKind::StackOverflow => {
                write!(f, "decoder stack overflow at {}", self.at)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Run a decoder program on a pooled emulator instance with the standard
/// argument layout, returning `(pos, err_kind, err_data)` raw.
pub(crate) fn run_program(
    program: &Arc<Program>,
    buf: RawPtr,
    nb: u64,
    pos: u64,
    out: RawPtr,
    rs: RawPtr,
    st: u64,
) -> (u64, u64, u64) {
    let mut emu = Emulator::load(program.clone());
    emu.ap(ARG_BUF, buf)
        .au(ARG_NB, nb)
        .au(ARG_I, pos)
        .ap(ARG_P, out)
        .ap(ARG_RS, rs)
        .au(ARG_ST, st);
    emu.run();
    let result = (
        emu.ru(RET_POS),
        emu.rp(RET_ERR_KIND).addr(),
        emu.rp(RET_ERR_DATA).addr(),
    );
    emu.free();
    result
}

/// Recursive decode: resolve the nested type's translated program and run
/// it with the threaded `(buf, nb, i, wp, rs, st)`. A record type that
/// was never given a decoder is a programmer error.
fn emu_decode(e: &mut Emulator, p: &Instr) {
    let td = unsafe { &*(e.arg_p(p, 0).get() as *const TypeDesc) };
    let buf = e.arg_p(p, 1);
    let nb = e.arg_u(p, 2);
    let pos = e.arg_u(p, 3);
    let wp = e.arg_p(p, 4);
    let rs = e.arg_p(p, 5);
    let st = e.arg_u(p, 6);
    let program = td
        .decoder()
        .unwrap_or_else(|| panic!("no decoder registered for type '{}'", td.name));
    let (end, kind, data) = run_program(&program, buf, nb, pos, wp, rs, st);
    e.set_ret_u(p, 0, end);
    e.set_ret_p(p, 1, RawPtr::from_addr(kind));
    e.set_ret_p(p, 2, RawPtr::from_addr(data));
}

pub(crate) static F_DECODE: LazyLock<CallId> =
    LazyLock::new(|| ir::register_gcall("decode", emu_decode));

type RawDecodeFn = dyn Fn(RawPtr, u64, u64, RawPtr, RawPtr, u64) -> (u64, u64, u64) + Send + Sync;

enum Backend {
    Emulated(Arc<Program>),
    Native(Arc<RawDecodeFn>),
}

/// A linked, invocable decoder.
pub struct Decoder {
    backend: Backend,
}

impl Decoder {
    /// Wrap a raw decode function, e.g. JIT-generated machine code.
    pub fn from_raw(f: Arc<RawDecodeFn>) -> Decoder {
        Decoder {
            backend: Backend::Native(f),
        }
    }

    /// Decode from `buf[pos..nb]` into the object at `out`, with `rs`
    /// pointing at a runtime-state region of at least
    /// [`crate::state::STATE_BYTES`] bytes and `st` the initial stack
    /// offset (normally 0). On success returns the cursor after the last
    /// consumed byte.
    ///
    /// # Safety
    /// `buf` must cover `nb` readable bytes, `out` must match the layout
    /// the plan was built for, and `rs` must be writable for the full
    /// state region. All three must stay valid for the whole call.
    pub unsafe fn decode(
        &self,
        buf: *const u8,
        nb: usize,
        pos: usize,
        out: *mut u8,
        rs: *mut u8,
        st: usize,
    ) -> Result<usize, DecodeError> {
        let buf = RawPtr::new(buf as *mut u8);
        let (end, kind, data) = match &self.backend {
            Backend::Emulated(program) => run_program(
                program,
                buf,
                nb as u64,
                pos as u64,
                RawPtr::new(out),
                RawPtr::new(rs),
                st as u64,
            ),
            Backend::Native(f) => f(
                buf,
                nb as u64,
                pos as u64,
                RawPtr::new(out),
                RawPtr::new(rs),
                st as u64,
            ),
        };
        if kind == 0 {
            Ok(end as usize)
        } else {
            Err(DecodeError::from_words(end as usize, kind, data))
        }
    }
}

/// An alternative back-end (typically a JIT) that links programs into
/// native decoders. Installed process-wide, once, during initialization.
pub trait Linker: Send + Sync {
    fn link(&self, program: Arc<Program>) -> Decoder;
}

static LINKER: OnceLock<Box<dyn Linker>> = OnceLock::new();

/// Install the process-wide linker. Returns false if one was already set.
pub fn set_linker(linker: Box<dyn Linker>) -> bool {
    LINKER.set(linker).is_ok()
}

fn force_emulator() -> bool {
    static FORCE: OnceLock<bool> = OnceLock::new();
    *FORCE.get_or_init(|| std::env::var_os("THRUSH_EMULATOR").is_some())
}

/// Produce an invocable decoder for a translated program: the installed
/// linker when present (and not overridden), the emulator otherwise.
pub fn link(program: Arc<Program>) -> Decoder {
    if !force_emulator() {
        if let Some(linker) = LINKER.get() {
            return linker.link(program);
        }
    }
    tracing::debug!(instructions = program.len(), "linking decoder with the emulator back-end");
    Decoder {
        backend: Backend::Emulated(program),
    }
}
