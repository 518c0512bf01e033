//! Lowers a protocol-level decoder plan to register IR.
//!
//! Generated programs follow a fixed ABI. Arguments: `0 buf`, `1 nb`,
//! `2 i`, `3 p`, `4 rs`, `5 st`. Returns: `0 pos`, `1 err_kind`,
//! `2 err_data`. Register conventions, stable throughout the body:
//!
//! ```text
//!     p1  WP  working pointer into the destination object
//!     p2  IP  input buffer base
//!     p3  RS  runtime state base
//!     p4  ET  error kind / temporary pointer
//!     p5  EP  error data / temporary pointer
//!
//!     r2  IC  input cursor
//!     r3  ST  state stack offset
//!     r4  TG  last-read field tag
//!
//!     p0  TP, r0 TR, r1 UR, r5 CK  scratch
//! ```
//!
//! Every wire read follows the same idiom: point at `buf + IC`, load,
//! byte-swap (the wire is big-endian), store through `WP`, advance `IC`.
//! Length-dependent reads are preceded by a bounds check that carries the
//! needed byte total into the shared eof block; on failure `IC` still
//! holds the position of the failing read.

use std::fmt;
use std::sync::Arc;

use vm::ir::{BuildError, Builder, GenericReg, PointerReg, Program};
use vm::rt::{RawPtr, TypeDesc};

use crate::host;
use crate::plan::{Plan, PlanInstr, PlanOp};
use crate::state;
use crate::wire;

use super::errors::{E_OVERFLOW, F_ERROR_EOF, F_ERROR_MISSING, F_ERROR_SKIP, F_ERROR_TYPE};
use super::{
    ARG_BUF, ARG_I, ARG_NB, ARG_P, ARG_RS, ARG_ST, F_DECODE, RET_ERR_DATA, RET_ERR_KIND, RET_POS,
};

const WP: PointerReg = PointerReg::P1;
const IP: PointerReg = PointerReg::P2;
const RS: PointerReg = PointerReg::P3;
const ET: PointerReg = PointerReg::P4;
const EP: PointerReg = PointerReg::P5;
const TP: PointerReg = PointerReg::P0;
const PN: PointerReg = PointerReg::Pn;

const IC: GenericReg = GenericReg::R2;
const ST: GenericReg = GenericReg::R3;
const TG: GenericReg = GenericReg::R4;
const TR: GenericReg = GenericReg::R0;
const UR: GenericReg = GenericReg::R1;
const CK: GenericReg = GenericReg::R5;
const RZ: GenericReg = GenericReg::Rz;

const LB_EOF: &str = "_eof";
const LB_HALT: &str = "_halt";
const LB_TYPE: &str = "_type";
const LB_SKIP: &str = "_skip";
const LB_ERROR: &str = "_error";
const LB_MISSING: &str = "_missing";
const LB_OVERFLOW: &str = "_overflow";

/// Non-null data pointer for empty binaries and lists.
static V_ZEROVALUE: u64 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranslateError {
    IntWidth(i64),
    MissingTypeDesc(usize),
    FieldOutOfRange(i64),
    Build(BuildError),
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslateError::IntWidth(width) => {
                write!(f, "int width {width} not supported, expected 1, 2, 4 or 8")
            }
            TranslateError::MissingTypeDesc(index) => {
                write!(f, "plan instruction {index} needs a type descriptor")
            }
            TranslateError::FieldOutOfRange(field) => {
                write!(f, "field id {field} exceeds the bitmap width")
            }
            TranslateError::Build(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TranslateError {}

impl From<BuildError> for TranslateError {
    fn from(err: BuildError) -> Self {
        TranslateError::Build(err)
    }
}

/// Translate a decoder plan into a linked IR program.
pub fn translate(plan: &Plan) -> Result<Program, TranslateError> {
    let mut b = Builder::new();
    prologue(&mut b);
    for (i, ins) in plan.iter().enumerate() {
        b.mark(i);
        translate_instr(&mut b, i, ins)?;
    }
    epilogue(&mut b);
    error_blocks(&mut b);
    Ok(b.build()?)
}

fn prologue(b: &mut Builder) {
    b.ldap(ARG_BUF, IP);
    b.ldaq(ARG_I, IC);
    b.ldap(ARG_P, WP);
    b.ldap(ARG_RS, RS);
    b.ldaq(ARG_ST, ST);
}

fn epilogue(b: &mut Builder) {
    b.label(LB_HALT);
    b.movp(PN, ET);
    b.movp(PN, EP);
    b.label(LB_ERROR);
    b.strq(IC, RET_POS);
    b.strp(ET, RET_ERR_KIND);
    b.strp(EP, RET_ERR_DATA);
    b.halt();
}

fn error_blocks(b: &mut Builder) {
    b.label(LB_EOF);
    b.ldaq(ARG_NB, UR);
    b.sub(TR, UR, TR);
    b.gcall(*F_ERROR_EOF).a0(TR).r0(ET).r1(EP);
    b.jal(LB_ERROR, PN);

    b.label(LB_TYPE);
    b.gcall(*F_ERROR_TYPE).a0(UR).a1(TR).r0(ET).r1(EP);
    b.jal(LB_ERROR, PN);

    b.label(LB_SKIP);
    b.gcall(*F_ERROR_SKIP).a0(TR).r0(ET).r1(EP);
    b.jal(LB_ERROR, PN);

    b.label(LB_MISSING);
    b.gcall(*F_ERROR_MISSING).a0(ET).a1(UR).a2(TR).r0(ET).r1(EP);
    b.jal(LB_ERROR, PN);

    b.label(LB_OVERFLOW);
    b.ip(RawPtr::from_ref(&E_OVERFLOW), TP);
    b.lp(TP, 0, ET);
    b.lp(TP, 8, EP);
    b.jal(LB_ERROR, PN);
}

fn want_vt<'a>(v: &'a PlanInstr, i: usize) -> Result<&'a Arc<TypeDesc>, TranslateError> {
    v.vt.as_ref().ok_or(TranslateError::MissingTypeDesc(i))
}

fn required_words(sw: &[i32]) -> Result<[u64; state::MAX_BITMAP], TranslateError> {
    let mut words = [0u64; state::MAX_BITMAP];
    for &field in sw {
        if field < 0 {
            continue;
        }
        let field = field as usize;
        if field >= state::MAX_BITMAP * 64 {
            return Err(TranslateError::FieldOutOfRange(field as i64));
        }
        words[field / 64] |= 1u64 << (field % 64);
    }
    Ok(words)
}

fn translate_instr(b: &mut Builder, i: usize, v: &PlanInstr) -> Result<(), TranslateError> {
    match v.op {
        PlanOp::Int => lower_int(b, v)?,
        PlanOp::Str => lower_str(b),
        PlanOp::Bin => lower_bin(b),
        PlanOp::Enum => lower_enum(b),
        PlanOp::Size => lower_size(b, v),
        PlanOp::Type => lower_type(b, v),
        PlanOp::Seek => lower_seek(b, v),
        PlanOp::Deref => lower_deref(b, want_vt(v, i)?),
        PlanOp::CtrLoad => lower_ctr_load(b),
        PlanOp::CtrDecr => lower_ctr_decr(b),
        PlanOp::CtrIsZero => lower_ctr_is_zero(b, v),
        PlanOp::MapAlloc => lower_map_alloc(b, want_vt(v, i)?),
        PlanOp::MapClose => lower_map_close(b),
        PlanOp::MapSetI8 => lower_map_set_i8(b, want_vt(v, i)?),
        PlanOp::MapSetI16 => lower_map_set_i16(b, want_vt(v, i)?),
        PlanOp::MapSetI32 => lower_map_set_i32(b, want_vt(v, i)?),
        PlanOp::MapSetI64 => lower_map_set_i64(b, want_vt(v, i)?),
        PlanOp::MapSetStr => lower_map_set_str(b, want_vt(v, i)?),
        PlanOp::MapSetPointer => lower_map_set_pointer(b, want_vt(v, i)?),
        PlanOp::ListAlloc => lower_list_alloc(b, want_vt(v, i)?),
        PlanOp::StructSkip => lower_struct_skip(b),
        PlanOp::StructIgnore => lower_struct_ignore(b),
        PlanOp::StructBitmap => lower_struct_bitmap(b, v)?,
        PlanOp::StructSwitch => lower_struct_switch(b, v),
        PlanOp::StructRequire => lower_struct_require(b, v, want_vt(v, i)?)?,
        PlanOp::StructIsStop => lower_struct_is_stop(b, v),
        PlanOp::StructMarkTag => lower_struct_mark_tag(b, v)?,
        PlanOp::StructReadType => lower_struct_read_type(b),
        PlanOp::StructCheckType => lower_struct_check_type(b, v),
        PlanOp::MakeState => lower_make_state(b),
        PlanOp::DropState => lower_drop_state(b),
        PlanOp::Construct => lower_construct(b, want_vt(v, i)?),
        PlanOp::Defer => lower_defer(b, want_vt(v, i)?),
        PlanOp::Goto => lower_goto(b, v),
        PlanOp::Halt => lower_halt(b),
    }
    Ok(())
}

fn lower_int(b: &mut Builder, v: &PlanInstr) -> Result<(), TranslateError> {
    match v.iv {
        1 => {
            b.addp(IP, IC, EP);
            b.lb(EP, 0, TR);
            b.sb(TR, WP, 0);
            b.addi(IC, 1, IC);
        }
        2 => {
            b.addp(IP, IC, EP);
            b.lw(EP, 0, TR);
            b.swapw(TR, TR);
            b.sw(TR, WP, 0);
            b.addi(IC, 2, IC);
        }
        4 => {
            b.addp(IP, IC, EP);
            b.ll(EP, 0, TR);
            b.swapl(TR, TR);
            b.sl(TR, WP, 0);
            b.addi(IC, 4, IC);
        }
        8 => {
            b.addp(IP, IC, EP);
            b.lq(EP, 0, TR);
            b.swapq(TR, TR);
            b.sq(TR, WP, 0);
            b.addi(IC, 8, IC);
        }
        other => return Err(TranslateError::IntWidth(other)),
    }
    Ok(())
}

fn lower_str(b: &mut Builder) {
    b.sp(PN, WP, 0);
    lower_binstr(b);
}

fn lower_bin(b: &mut Builder) {
    b.ip(RawPtr::from_ref(&V_ZEROVALUE), TP);
    b.sp(TP, WP, 0);
    lower_binstr(b);
    b.sq(TR, WP, 16);
}

/// Shared body of `str`/`bin`: read the 4-byte length prefix, bounds
/// check, then publish `{ptr, len}` into the destination header. The
/// pointer store is skipped for empty payloads.
fn lower_binstr(b: &mut Builder) {
    b.addp(IP, IC, EP);
    b.ll(EP, 0, CK);
    b.swapl(CK, CK);
    b.addi(IC, 4, TR);
    b.add(TR, CK, TR);
    b.ldaq(ARG_NB, UR);
    b.bltu(UR, TR, LB_EOF);
    b.movq(CK, TR);
    b.addi(IC, 4, IC);
    b.beq(TR, RZ, "_empty_{n}");
    b.addpi(EP, 4, EP);
    b.add(IC, TR, IC);
    b.sp(EP, WP, 0);
    b.label("_empty_{n}");
    b.sq(TR, WP, 8);
}

fn lower_enum(b: &mut Builder) {
    b.addp(IP, IC, EP);
    b.ll(EP, 0, TR);
    b.swapl(TR, TR);
    b.sq(TR, WP, 0);
    b.addi(IC, 4, IC);
}

fn lower_size(b: &mut Builder, v: &PlanInstr) {
    b.addi(IC, v.iv, TR);
    b.ldaq(ARG_NB, UR);
    b.bltu(UR, TR, LB_EOF);
}

fn lower_type(b: &mut Builder, v: &PlanInstr) {
    b.addp(IP, IC, TP);
    b.lb(TP, 0, TR);
    b.ib(v.tx as i8, UR);
    b.bne(TR, UR, LB_TYPE);
    b.addi(IC, 1, IC);
}

fn lower_seek(b: &mut Builder, v: &PlanInstr) {
    b.addpi(WP, v.iv, WP);
}

fn lower_deref(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.lq(WP, 0, TR);
    b.bne(TR, RZ, "_skip_{n}");
    b.ib(1, UR);
    b.ipt(vt, TP);
    b.iq(vt.size as i64, TR);
    b.gcall(*host::F_MALLOCGC).a0(TR).a1(TP).a2(UR).r0(TP);
    b.sp(TP, WP, 0);
    b.label("_skip_{n}");
    b.lp(WP, 0, WP);
}

fn lower_ctr_load(b: &mut Builder) {
    b.addp(IP, IC, EP);
    b.addi(IC, 4, IC);
    b.ll(EP, 0, TR);
    b.swapl(TR, TR);
    b.addp(RS, ST, TP);
    b.sq(TR, TP, state::NB_OFFSET);
}

fn lower_ctr_decr(b: &mut Builder) {
    b.addp(RS, ST, TP);
    b.lq(TP, state::NB_OFFSET, TR);
    b.subi(TR, 1, TR);
    b.sq(TR, TP, state::NB_OFFSET);
}

fn lower_ctr_is_zero(b: &mut Builder, v: &PlanInstr) {
    let to = b.at(v.to);
    b.addp(RS, ST, TP);
    b.lq(TP, state::NB_OFFSET, TR);
    b.beq(TR, RZ, &to);
}

fn lower_map_alloc(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(RS, ST, TP);
    b.lq(TP, state::NB_OFFSET, TR);
    b.lp(WP, 0, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAKEMAP).a0(ET).a1(TR).a2(TP).r0(TP);
    b.sp(TP, WP, 0);
    b.addp(RS, ST, EP);
    b.sp(TP, EP, state::MP_OFFSET);
}

fn lower_map_close(b: &mut Builder) {
    b.addp(RS, ST, TP);
    b.sp(PN, TP, state::MP_OFFSET);
}

fn lower_map_set_i8(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, EP);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(TP).a2(EP).r0(WP);
    b.addi(IC, 1, IC);
}

fn lower_map_set_i16(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, ET);
    b.addi(IC, 2, IC);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, EP);
    b.lw(ET, 0, TR);
    b.swapw(TR, TR);
    b.sw(TR, RS, state::IV_OFFSET);
    b.addpi(RS, state::IV_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(EP).a2(TP).r0(WP);
}

fn lower_map_set_i32(b: &mut Builder, vt: &Arc<TypeDesc>) {
    if vt.is_fast_map() {
        lower_map_set_i32_fast(b, vt);
    } else {
        lower_map_set_i32_safe(b, vt);
    }
}

fn lower_map_set_i32_fast(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, EP);
    b.addi(IC, 4, IC);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, TP);
    b.ll(EP, 0, TR);
    b.swapl(TR, TR);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN_FAST32).a0(ET).a1(TP).a2(TR).r0(WP);
}

fn lower_map_set_i32_safe(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, ET);
    b.addi(IC, 4, IC);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, EP);
    b.ll(ET, 0, TR);
    b.swapl(TR, TR);
    b.sl(TR, RS, state::IV_OFFSET);
    b.addpi(RS, state::IV_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(EP).a2(TP).r0(WP);
}

fn lower_map_set_i64(b: &mut Builder, vt: &Arc<TypeDesc>) {
    if vt.is_fast_map() {
        lower_map_set_i64_fast(b, vt);
    } else {
        lower_map_set_i64_safe(b, vt);
    }
}

fn lower_map_set_i64_fast(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, EP);
    b.addi(IC, 8, IC);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, TP);
    b.lq(EP, 0, TR);
    b.swapq(TR, TR);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN_FAST64).a0(ET).a1(TP).a2(TR).r0(WP);
}

fn lower_map_set_i64_safe(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, ET);
    b.addi(IC, 8, IC);
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, EP);
    b.lq(ET, 0, TR);
    b.swapq(TR, TR);
    b.sq(TR, RS, state::IV_OFFSET);
    b.addpi(RS, state::IV_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(EP).a2(TP).r0(WP);
}

fn lower_map_set_str(b: &mut Builder, vt: &Arc<TypeDesc>) {
    if vt.is_fast_map() {
        lower_map_set_str_fast(b, vt);
    } else {
        lower_map_set_str_safe(b, vt);
    }
}

fn lower_map_set_str_fast(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, EP);
    b.ll(EP, 0, CK);
    b.swapl(CK, CK);
    b.addi(IC, 4, TR);
    b.add(TR, CK, TR);
    b.ldaq(ARG_NB, UR);
    b.bltu(UR, TR, LB_EOF);
    b.movq(CK, TR);
    b.addi(IC, 4, IC);
    b.movp(PN, EP);
    b.beq(TR, RZ, "_empty_{n}");
    b.addp(IP, IC, EP);
    b.add(IC, TR, IC);
    b.label("_empty_{n}");
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN_FASTSTR).a0(ET).a1(TP).a2(EP).a3(TR).r0(WP);
}

fn lower_map_set_str_safe(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(IP, IC, ET);
    b.ll(ET, 0, CK);
    b.swapl(CK, CK);
    b.addi(IC, 4, TR);
    b.add(TR, CK, TR);
    b.ldaq(ARG_NB, UR);
    b.bltu(UR, TR, LB_EOF);
    b.movq(CK, TR);
    b.addi(IC, 4, IC);
    b.sq(TR, RS, state::IV_OFFSET);
    b.sp(PN, RS, state::PR_OFFSET);
    b.beq(TR, RZ, "_empty_{n}");
    b.addpi(ET, 4, ET);
    b.add(IC, TR, IC);
    b.sp(ET, RS, state::PR_OFFSET);
    b.label("_empty_{n}");
    b.addp(RS, ST, EP);
    b.lp(EP, state::MP_OFFSET, EP);
    b.ipt(vt, ET);
    b.addpi(RS, state::PR_OFFSET, TP);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(EP).a2(TP).r0(WP);
    b.sp(PN, RS, state::PR_OFFSET);
}

fn lower_map_set_pointer(b: &mut Builder, vt: &Arc<TypeDesc>) {
    if vt.is_fast_map() {
        lower_map_set_pointer_fast(b, vt);
    } else {
        lower_map_set_pointer_safe(b, vt);
    }
}

fn lower_map_set_pointer_fast(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, TP);
    b.ipt(vt, ET);
    b.gcall(*host::F_MAPASSIGN_FAST64PTR).a0(ET).a1(TP).a2(WP).r0(WP);
}

fn lower_map_set_pointer_safe(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(RS, ST, TP);
    b.lp(TP, state::MP_OFFSET, EP);
    b.sp(WP, RS, state::PR_OFFSET);
    b.ipt(vt, ET);
    b.addpi(RS, state::PR_OFFSET, TP);
    b.gcall(*host::F_MAPASSIGN).a0(ET).a1(EP).a2(TP).r0(WP);
    b.sp(PN, RS, state::PR_OFFSET);
}

/// `vt` is the element type; the destination slice header is reused when
/// its capacity already covers the loaded count.
fn lower_list_alloc(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.addp(RS, ST, TP);
    b.lq(TP, state::NB_OFFSET, TR);
    b.sq(TR, WP, 8);
    b.lq(WP, 16, UR);
    b.bne(TR, RZ, "_alloc_{n}");
    b.bne(UR, RZ, "_done_{n}");
    b.ip(RawPtr::from_ref(&V_ZEROVALUE), TP);
    b.sp(TP, WP, 0);
    b.sq(RZ, WP, 16);
    b.jal("_done_{n}", PN);
    b.label("_alloc_{n}");
    b.bgeu(UR, TR, "_done_{n}");
    b.sq(TR, WP, 16);
    b.ib(1, UR);
    b.ipt(vt, TP);
    b.muli(TR, vt.size as i64, TR);
    b.gcall(*host::F_MALLOCGC).a0(TR).a1(TP).a2(UR).r0(TP);
    b.sp(TP, WP, 0);
    b.label("_done_{n}");
    b.lp(WP, 0, WP);
}

fn lower_struct_skip(b: &mut Builder) {
    b.addpi(RS, state::SK_OFFSET, TP);
    b.ldaq(ARG_NB, TR);
    b.sub(TR, IC, TR);
    b.addp(IP, IC, EP);
    b.ccall(*host::C_SKIP).a0(TP).a1(EP).a2(TR).a3(TG).r0(TR);
    b.blt(TR, RZ, LB_SKIP);
    b.add(IC, TR, IC);
}

fn lower_struct_ignore(b: &mut Builder) {
    b.addpi(RS, state::SK_OFFSET, TP);
    b.ldaq(ARG_NB, TR);
    b.sub(TR, IC, TR);
    b.addp(IP, IC, EP);
    b.ib(wire::T_STRUCT as i8, TG);
    b.ccall(*host::C_SKIP).a0(TP).a1(EP).a2(TR).a3(TG).r0(TR);
    b.blt(TR, RZ, LB_SKIP);
    b.add(IC, TR, IC);
}

fn lower_struct_bitmap(b: &mut Builder, v: &PlanInstr) -> Result<(), TranslateError> {
    let words = required_words(&v.sw)?;

    b.gcall(*host::F_NEW_FIELD_BITMAP).r0(TP);
    b.addp(RS, ST, EP);
    b.sp(TP, EP, state::FM_OFFSET);

    // pooled bitmaps come back dirty: clear the words holding required bits
    for (word, &bits) in words.iter().enumerate() {
        if bits != 0 {
            b.sq(RZ, TP, (word * 8) as i64);
        }
    }
    Ok(())
}

fn lower_struct_switch(b: &mut Builder, v: &PlanInstr) {
    let mut targets = vec![String::new(); v.sw.len()];
    for (field, &to) in v.sw.iter().enumerate() {
        if to >= 0 {
            targets[field] = b.at(to as usize);
        }
    }

    b.addp(IP, IC, EP);
    b.addi(IC, 2, IC);
    b.lw(EP, 0, TR);
    b.swapw(TR, TR);
    b.bsw(TR, &targets);
}

fn lower_struct_require(
    b: &mut Builder,
    v: &PlanInstr,
    vt: &Arc<TypeDesc>,
) -> Result<(), TranslateError> {
    let words = required_words(&v.sw)?;

    b.addp(RS, ST, EP);
    b.lp(EP, state::FM_OFFSET, TP);

    // residue = (observed & required) ^ required; any non-zero word is a
    // missing required field
    for (word, &bits) in words.iter().enumerate() {
        if bits != 0 {
            b.lq(TP, (word * 8) as i64, TR);
            b.andi(TR, bits as i64, TR);
            b.xori(TR, bits as i64, TR);
            b.iq(word as i64, UR);
            b.ipt(vt, ET);
            b.bne(TR, RZ, LB_MISSING);
        }
    }

    b.sp(PN, EP, state::FM_OFFSET);
    b.gcall(*host::F_FIELD_BITMAP_FREE).a0(TP);
    Ok(())
}

fn lower_struct_is_stop(b: &mut Builder, v: &PlanInstr) {
    let to = b.at(v.to);
    b.beq(TG, RZ, &to);
}

fn lower_struct_mark_tag(b: &mut Builder, v: &PlanInstr) -> Result<(), TranslateError> {
    if v.iv < 0 || v.iv >= (state::MAX_BITMAP * 64) as i64 {
        return Err(TranslateError::FieldOutOfRange(v.iv));
    }
    b.addp(RS, ST, TP);
    b.lp(TP, state::FM_OFFSET, TP);
    b.lq(TP, v.iv / 64 * 8, TR);
    b.sbiti(TR, v.iv % 64, TR);
    b.sq(TR, TP, v.iv / 64 * 8);
    Ok(())
}

fn lower_struct_read_type(b: &mut Builder) {
    b.addp(IP, IC, EP);
    b.addi(IC, 1, IC);
    b.lb(EP, 0, TG);
}

fn lower_struct_check_type(b: &mut Builder, v: &PlanInstr) {
    let to = b.at(v.to);
    b.ib(v.tx as i8, TR);
    b.bne(TG, TR, &to);
}

fn lower_make_state(b: &mut Builder) {
    b.iq((state::STATE_MAX * state::STATE_SIZE) as i64, TR);
    b.bgeu(ST, TR, LB_OVERFLOW);
    b.addp(RS, ST, TP);
    b.sp(WP, TP, state::WP_OFFSET);
    b.addi(ST, state::STATE_SIZE as i64, ST);
}

fn lower_drop_state(b: &mut Builder) {
    b.subi(ST, state::STATE_SIZE as i64, ST);
    b.addp(RS, ST, TP);
    b.lp(TP, state::WP_OFFSET, WP);
    b.sp(PN, TP, state::WP_OFFSET);
}

fn lower_construct(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.ib(1, UR);
    b.ipt(vt, TP);
    b.iq(vt.size as i64, TR);
    b.gcall(*host::F_MALLOCGC).a0(TR).a1(TP).a2(UR).r0(WP);
}

fn lower_defer(b: &mut Builder, vt: &Arc<TypeDesc>) {
    b.ipt(vt, TP);
    b.ldaq(ARG_NB, TR);
    b.gcall(*F_DECODE)
        .a0(TP)
        .a1(IP)
        .a2(TR)
        .a3(IC)
        .a4(WP)
        .a5(RS)
        .a6(ST)
        .r0(IC)
        .r1(ET)
        .r2(EP);
    b.bnen(ET, LB_ERROR);
}

fn lower_goto(b: &mut Builder, v: &PlanInstr) {
    let to = b.at(v.to);
    b.jal(&to, PN);
}

fn lower_halt(b: &mut Builder) {
    b.jal(LB_HALT, PN);
}
