use std::sync::Arc;

use codec::decoder::{DecodeError, DecodeErrorKind, link, translate};
use codec::plan::{Plan, PlanInstr, PlanOp};
use codec::state::{RuntimeState, STATE_MAX};
use codec::{host, wire};
use vm::rt::{KeyClass, RawPtr, TypeDesc};

#[repr(C)]
struct StrHeader {
    ptr: *const u8,
    len: u64,
}

impl Default for StrHeader {
    fn default() -> Self {
        StrHeader {
            ptr: std::ptr::null(),
            len: 0,
        }
    }
}

#[repr(C)]
struct SliceHeader {
    ptr: *const u8,
    len: u64,
    cap: u64,
}

fn decode_into(plan: &Plan, buf: &[u8], out: *mut u8) -> Result<usize, DecodeError> {
    let program = Arc::new(translate(plan).expect("plan should translate"));
    let decoder = link(program);
    let mut rs = RuntimeState::new();
    unsafe { decoder.decode(buf.as_ptr(), buf.len(), 0, out, rs.as_mut_ptr(), 0) }
}

fn op(op: PlanOp) -> PlanInstr {
    PlanInstr::new(op)
}

#[test]
fn i32_field_decodes() {
    let plan = vec![op(PlanOp::Int).with_iv(4), op(PlanOp::Halt)];
    let mut out = 0u32;
    let pos = decode_into(&plan, &[0, 0, 0, 0x2a], &mut out as *mut u32 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert_eq!(out, 0x2a);
}

#[test]
fn typed_i32_field_decodes() {
    let plan = vec![
        op(PlanOp::Type).with_tx(wire::T_I32),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Halt),
    ];
    let mut out = 0u32;
    let pos = decode_into(
        &plan,
        &[wire::T_I32, 0, 0, 0, 0x2a],
        &mut out as *mut u32 as *mut u8,
    )
    .expect("decode should succeed");
    assert_eq!(pos, 5);
    assert_eq!(out, 0x2a);
}

#[test]
fn type_mismatch_reports_both_tags() {
    let plan = vec![
        op(PlanOp::Type).with_tx(wire::T_I32),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Halt),
    ];
    let mut out = 0u32;
    let err = decode_into(
        &plan,
        &[wire::T_STRING, 0, 0, 0, 0x2a],
        &mut out as *mut u32 as *mut u8,
    )
    .expect_err("mismatched tag must fail");
    assert_eq!(err.at, 0);
    assert_eq!(
        err.kind,
        DecodeErrorKind::TypeMismatch {
            expected: wire::T_I32,
            got: wire::T_STRING,
        }
    );
}

#[test]
fn all_int_widths_decode() {
    let plan = |width: i64| vec![op(PlanOp::Int).with_iv(width), op(PlanOp::Halt)];

    let mut out8 = 0u8;
    decode_into(&plan(1), &[0x7f], &mut out8 as *mut u8).expect("i8");
    assert_eq!(out8, 0x7f);

    let mut out16 = 0u16;
    decode_into(&plan(2), &[0x12, 0x34], &mut out16 as *mut u16 as *mut u8).expect("i16");
    assert_eq!(out16, 0x1234);

    let mut out64 = 0u64;
    decode_into(
        &plan(8),
        &[1, 2, 3, 4, 5, 6, 7, 8],
        &mut out64 as *mut u64 as *mut u8,
    )
    .expect("i64");
    assert_eq!(out64, 0x0102030405060708);
}

#[test]
fn string_decodes_to_header() {
    let plan = vec![op(PlanOp::Str), op(PlanOp::Halt)];
    let buf = [0u8, 0, 0, 3, b'a', b'b', b'c'];
    let mut out = StrHeader::default();
    let pos = decode_into(&plan, &buf, &mut out as *mut StrHeader as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 7);
    assert_eq!(out.len, 3);
    assert_eq!(out.ptr, buf.as_ptr().wrapping_add(4));
}

#[test]
fn empty_string_has_null_pointer() {
    let plan = vec![op(PlanOp::Str), op(PlanOp::Halt)];
    let mut out = StrHeader {
        ptr: &0u8, // overwritten by the decoder
        len: 9,
    };
    let pos = decode_into(&plan, &[0, 0, 0, 0], &mut out as *mut StrHeader as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert!(out.ptr.is_null());
    assert_eq!(out.len, 0);
}

#[test]
fn truncated_string_reports_eof_before_the_prefix() {
    let plan = vec![op(PlanOp::Str), op(PlanOp::Halt)];
    let mut out = StrHeader::default();
    let err = decode_into(
        &plan,
        &[0, 0, 0, 5, b'a', b'b'],
        &mut out as *mut StrHeader as *mut u8,
    )
    .expect_err("short payload must fail");
    assert_eq!(err.at, 0);
    assert_eq!(err.kind, DecodeErrorKind::Eof { shortfall: 3 });
}

#[test]
fn binary_decodes_with_capacity() {
    let plan = vec![op(PlanOp::Bin), op(PlanOp::Halt)];
    let buf = [0u8, 0, 0, 3, 1, 2, 3];
    let mut out = SliceHeader {
        ptr: std::ptr::null(),
        len: 0,
        cap: 0,
    };
    let pos = decode_into(&plan, &buf, &mut out as *mut SliceHeader as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 7);
    assert_eq!(out.ptr, buf.as_ptr().wrapping_add(4));
    assert_eq!(out.len, 3);
    assert_eq!(out.cap, 3);
}

#[test]
fn empty_binary_keeps_a_non_null_pointer() {
    let plan = vec![op(PlanOp::Bin), op(PlanOp::Halt)];
    let mut out = SliceHeader {
        ptr: std::ptr::null(),
        len: 9,
        cap: 9,
    };
    let pos = decode_into(&plan, &[0, 0, 0, 0], &mut out as *mut SliceHeader as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert!(!out.ptr.is_null());
    assert_eq!(out.len, 0);
    assert_eq!(out.cap, 0);
}

#[test]
fn enum_widens_to_i64() {
    let plan = vec![op(PlanOp::Enum), op(PlanOp::Halt)];
    let mut out = 0i64;
    let pos = decode_into(&plan, &[0, 0, 0, 7], &mut out as *mut i64 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert_eq!(out, 7);
}

#[test]
fn size_guard_passes_and_fails() {
    let plan = vec![
        op(PlanOp::Size).with_iv(4),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Halt),
    ];
    let mut out = 0u32;
    decode_into(&plan, &[0, 0, 0, 1], &mut out as *mut u32 as *mut u8)
        .expect("exact size should pass");

    let plan = vec![op(PlanOp::Size).with_iv(5), op(PlanOp::Halt)];
    let err = decode_into(&plan, &[0, 0, 0, 1], &mut out as *mut u32 as *mut u8)
        .expect_err("short input must fail");
    assert_eq!(err.at, 0);
    assert_eq!(err.kind, DecodeErrorKind::Eof { shortfall: 1 });
}

#[test]
fn seek_moves_the_working_pointer() {
    #[repr(C)]
    struct Two {
        a: u32,
        b: u32,
    }
    let plan = vec![
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Seek).with_iv(4),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Halt),
    ];
    let mut out = Two { a: 0, b: 0 };
    let pos = decode_into(
        &plan,
        &[0, 0, 0, 1, 0, 0, 0, 2],
        &mut out as *mut Two as *mut u8,
    )
    .expect("decode should succeed");
    assert_eq!(pos, 8);
    assert_eq!(out.a, 1);
    assert_eq!(out.b, 2);
}

#[test]
fn deref_allocates_through_a_null_pointer() {
    let inner = TypeDesc::scalar("u32", 4);
    let plan = vec![
        op(PlanOp::Deref).with_vt(&inner),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Halt),
    ];
    let mut out: *mut u32 = std::ptr::null_mut();
    let pos = decode_into(
        &plan,
        &[0, 0, 0, 0x2a],
        &mut out as *mut *mut u32 as *mut u8,
    )
    .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert!(!out.is_null());
    assert_eq!(unsafe { *out }, 0x2a);
}

#[test]
fn list_of_i32_decodes() {
    let elem = TypeDesc::scalar("u32", 4);
    let plan = vec![
        op(PlanOp::MakeState),
        op(PlanOp::CtrLoad),
        op(PlanOp::ListAlloc).with_vt(&elem),
        op(PlanOp::CtrIsZero).with_to(8),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Seek).with_iv(4),
        op(PlanOp::CtrDecr),
        op(PlanOp::Goto).with_to(3),
        op(PlanOp::DropState),
        op(PlanOp::Halt),
    ];
    let buf = [0u8, 0, 0, 2, 0, 0, 0, 7, 0, 0, 0, 9];
    let mut out = SliceHeader {
        ptr: std::ptr::null(),
        len: 0,
        cap: 0,
    };
    let pos = decode_into(&plan, &buf, &mut out as *mut SliceHeader as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 12);
    assert_eq!(out.len, 2);
    assert_eq!(out.cap, 2);
    let data = out.ptr as *const u32;
    assert_eq!(unsafe { data.read_unaligned() }, 7);
    assert_eq!(unsafe { data.wrapping_add(1).read_unaligned() }, 9);

    // zero elements reuse nothing but stay non-null
    let mut out = SliceHeader {
        ptr: std::ptr::null(),
        len: 5,
        cap: 0,
    };
    let pos = decode_into(
        &plan,
        &[0, 0, 0, 0],
        &mut out as *mut SliceHeader as *mut u8,
    )
    .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert!(!out.ptr.is_null());
    assert_eq!(out.len, 0);
    assert_eq!(out.cap, 0);
}

fn map_plan(vt: &Arc<TypeDesc>, set: PlanOp) -> Plan {
    vec![
        op(PlanOp::MakeState),
        op(PlanOp::CtrLoad),
        op(PlanOp::MapAlloc).with_vt(vt),
        op(PlanOp::CtrIsZero).with_to(8),
        op(set).with_vt(vt),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::CtrDecr),
        op(PlanOp::Goto).with_to(3),
        op(PlanOp::MapClose),
        op(PlanOp::DropState),
        op(PlanOp::Halt),
    ]
}

#[test]
fn fast_i32_map_decodes() {
    let vt = TypeDesc::map("map<i32,u32>", KeyClass::I32, 4, 4);
    assert!(vt.is_fast_map());
    let plan = map_plan(&vt, PlanOp::MapSetI32);
    let buf = [
        0u8, 0, 0, 2, // two entries
        0, 0, 0, 1, 0, 0, 0, 0x2a, // 1 -> 42
        0, 0, 0, 2, 0, 0, 0, 0x63, // 2 -> 99
    ];
    let mut out: *mut u8 = std::ptr::null_mut();
    let pos = decode_into(&plan, &buf, &mut out as *mut *mut u8 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 20);

    let map = RawPtr::new(out);
    unsafe {
        assert_eq!(host::map_len(map), 2);
        let v1 = host::map_get(map, &1u32.to_le_bytes()).expect("key 1 present");
        assert_eq!((v1 as *const u32).read_unaligned(), 0x2a);
        let v2 = host::map_get(map, &2u32.to_le_bytes()).expect("key 2 present");
        assert_eq!((v2 as *const u32).read_unaligned(), 0x63);
        host::map_free(map);
    }
}

#[test]
fn safe_i64_map_advances_past_the_full_key() {
    let vt = TypeDesc::map_opaque("map<opaque64,u32>", 8, 4);
    assert!(!vt.is_fast_map());
    let plan = map_plan(&vt, PlanOp::MapSetI64);
    let buf = [
        0u8, 0, 0, 1, // one entry
        1, 2, 3, 4, 5, 6, 7, 8, // key
        0, 0, 0, 0x2a, // value
    ];
    let mut out: *mut u8 = std::ptr::null_mut();
    let pos = decode_into(&plan, &buf, &mut out as *mut *mut u8 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 16);

    let map = RawPtr::new(out);
    unsafe {
        assert_eq!(host::map_len(map), 1);
        let val = host::map_get(map, &0x0102030405060708u64.to_le_bytes())
            .expect("key present");
        assert_eq!((val as *const u32).read_unaligned(), 0x2a);
        host::map_free(map);
    }
}

#[test]
fn fast_string_map_keys_compare_by_content() {
    let vt = TypeDesc::map("map<string,u32>", KeyClass::Str, 16, 4);
    let plan = map_plan(&vt, PlanOp::MapSetStr);
    let buf = [
        0u8, 0, 0, 1, // one entry
        0, 0, 0, 2, b'h', b'i', // "hi"
        0, 0, 0, 0x63, // value
    ];
    let mut out: *mut u8 = std::ptr::null_mut();
    let pos = decode_into(&plan, &buf, &mut out as *mut *mut u8 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 14);

    let map = RawPtr::new(out);
    unsafe {
        assert_eq!(host::map_len(map), 1);
        let val = host::map_get(map, b"hi").expect("key present");
        assert_eq!((val as *const u32).read_unaligned(), 0x63);
        host::map_free(map);
    }
}

fn pair_plan(vt: &Arc<TypeDesc>) -> Plan {
    vec![
        op(PlanOp::StructBitmap).with_sw(vec![1, 2]),
        op(PlanOp::StructReadType),
        op(PlanOp::StructIsStop).with_to(16),
        op(PlanOp::StructSwitch).with_sw(vec![-1, 6, 10]),
        op(PlanOp::StructSkip),
        op(PlanOp::Goto).with_to(1),
        op(PlanOp::StructCheckType).with_tx(wire::T_I32).with_to(4),
        op(PlanOp::StructMarkTag).with_iv(1),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Goto).with_to(1),
        op(PlanOp::StructCheckType).with_tx(wire::T_I32).with_to(4),
        op(PlanOp::StructMarkTag).with_iv(2),
        op(PlanOp::Seek).with_iv(4),
        op(PlanOp::Int).with_iv(4),
        op(PlanOp::Seek).with_iv(-4),
        op(PlanOp::Goto).with_to(1),
        op(PlanOp::StructRequire).with_sw(vec![1, 2]).with_vt(vt),
        op(PlanOp::Halt),
    ]
}

#[test]
fn struct_with_both_required_fields_decodes() {
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }
    let vt = TypeDesc::record("Pair", 8);
    let plan = pair_plan(&vt);
    let buf = [
        wire::T_I32, 0, 1, 0, 0, 0, 0x2a, // field 1 = 42
        wire::T_I32, 0, 2, 0, 0, 0, 0x63, // field 2 = 99
        wire::T_STOP,
    ];
    let mut out = Pair { a: 0, b: 0 };
    let pos = decode_into(&plan, &buf, &mut out as *mut Pair as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 15);
    assert_eq!(out.a, 0x2a);
    assert_eq!(out.b, 0x63);
}

#[test]
fn missing_required_field_is_reported() {
    let vt = TypeDesc::record("Pair", 8);
    let plan = pair_plan(&vt);
    let buf = [
        wire::T_I32, 0, 2, 0, 0, 0, 0x63, // field 2 only
        wire::T_STOP,
    ];
    let mut out = [0u8; 8];
    let err = decode_into(&plan, &buf, out.as_mut_ptr()).expect_err("field 1 is required");
    assert_eq!(
        err.kind,
        DecodeErrorKind::MissingRequired {
            type_name: "Pair".to_string(),
            word: 0,
            mask: 1 << 1,
        }
    );
}

#[test]
fn unknown_fields_are_skipped() {
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }
    let vt = TypeDesc::record("Pair", 8);
    let plan = pair_plan(&vt);
    let buf = [
        wire::T_STRING, 0, 9, 0, 0, 0, 2, b'x', b'y', // unknown field 9
        wire::T_I32, 0, 1, 0, 0, 0, 1, // field 1
        wire::T_I32, 0, 2, 0, 0, 0, 2, // field 2
        wire::T_STOP,
    ];
    let mut out = Pair { a: 0, b: 0 };
    let pos = decode_into(&plan, &buf, &mut out as *mut Pair as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, buf.len());
    assert_eq!(out.a, 1);
    assert_eq!(out.b, 2);
}

#[test]
fn malformed_unknown_field_reports_skip_failure() {
    let vt = TypeDesc::record("Pair", 8);
    let plan = pair_plan(&vt);
    let buf = [1u8, 0, 9, 0xde, 0xad, wire::T_STOP]; // wire tag 1 is not a thing
    let mut out = [0u8; 8];
    let err = decode_into(&plan, &buf, out.as_mut_ptr()).expect_err("unskippable field");
    assert_eq!(err.kind, DecodeErrorKind::Skip { code: wire::SKIP_INVALID });
}

#[test]
fn struct_ignore_skips_a_whole_struct() {
    let plan = vec![op(PlanOp::StructIgnore), op(PlanOp::Halt)];
    let buf = [
        wire::T_I32, 0, 1, 0, 0, 0, 5, // one field
        wire::T_STOP,
    ];
    let mut out = [0u8; 8];
    let pos = decode_into(&plan, &buf, out.as_mut_ptr()).expect("decode should succeed");
    assert_eq!(pos, 8);
}

#[test]
fn deferred_decode_threads_the_cursor() {
    let inner_vt = TypeDesc::record("Inner", 4);
    let inner_plan = vec![op(PlanOp::Int).with_iv(4), op(PlanOp::Halt)];
    inner_vt.set_decoder(Arc::new(translate(&inner_plan).expect("inner translates")));

    let plan = vec![op(PlanOp::Defer).with_vt(&inner_vt), op(PlanOp::Halt)];
    let mut out = 0u32;
    let pos = decode_into(&plan, &[0, 0, 0, 0x2a], &mut out as *mut u32 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 4);
    assert_eq!(out, 0x2a);
}

#[test]
fn deferred_decode_propagates_errors() {
    let inner_vt = TypeDesc::record("Needy", 4);
    let inner_plan = vec![op(PlanOp::Size).with_iv(10), op(PlanOp::Halt)];
    inner_vt.set_decoder(Arc::new(translate(&inner_plan).expect("inner translates")));

    let plan = vec![op(PlanOp::Defer).with_vt(&inner_vt), op(PlanOp::Halt)];
    let mut out = 0u32;
    let err = decode_into(&plan, &[0, 0, 0, 0], &mut out as *mut u32 as *mut u8)
        .expect_err("inner eof must surface");
    assert_eq!(err.at, 0);
    assert_eq!(err.kind, DecodeErrorKind::Eof { shortfall: 6 });
}

#[test]
fn nesting_past_the_state_cap_overflows() {
    let mut plan: Plan = (0..=STATE_MAX).map(|_| op(PlanOp::MakeState)).collect();
    plan.push(op(PlanOp::Halt));

    let mut out = [0u8; 8];
    let err = decode_into(&plan, &[], out.as_mut_ptr()).expect_err("depth cap must trip");
    assert_eq!(err.at, 0);
    assert_eq!(err.kind, DecodeErrorKind::StackOverflow);
}

#[test]
fn goto_jumps_forward() {
    let plan = vec![
        op(PlanOp::Goto).with_to(2),
        op(PlanOp::Int).with_iv(4), // skipped
        op(PlanOp::Halt),
    ];
    let mut out = 0u32;
    let pos = decode_into(&plan, &[0, 0, 0, 1], &mut out as *mut u32 as *mut u8)
        .expect("decode should succeed");
    assert_eq!(pos, 0);
    assert_eq!(out, 0);
}
