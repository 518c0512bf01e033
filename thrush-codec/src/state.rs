use std::sync::Mutex;

use vm::rt::RawPtr;

/// Per-decode runtime state layout. The caller hands the decoder a flat
/// byte region; the translator addresses it with these offsets. A stack
/// of `STATE_SIZE`-byte frames grows from offset 0, one frame per nested
/// struct level, followed by the global marshalling and skip scratch
/// slots. The stack offset register stays within
/// `0 ..= STATE_MAX * STATE_SIZE`, so the frames region spans one extra
/// slot past the cap.
pub const STATE_SIZE: usize = 32;
pub const STATE_MAX: usize = 128;

/// Frame-relative slots, addressed from `rs + st`.
pub const NB_OFFSET: i64 = 0;
pub const MP_OFFSET: i64 = 8;
pub const FM_OFFSET: i64 = 16;
pub const WP_OFFSET: i64 = 24;

/// Global slots, addressed from `rs`. `PR_OFFSET`/`IV_OFFSET` are
/// adjacent on purpose: together they form a string header
/// `{ptr, len}` for safe map-key marshalling.
pub const PR_OFFSET: i64 = ((STATE_MAX + 1) * STATE_SIZE) as i64;
pub const IV_OFFSET: i64 = PR_OFFSET + 8;
pub const SK_OFFSET: i64 = IV_OFFSET + 8;
pub const SK_SIZE: usize = 64;

pub const STATE_BYTES: usize = SK_OFFSET as usize + SK_SIZE;

/// Owned, zeroed, correctly sized runtime-state buffer.
pub struct RuntimeState {
    buf: Box<[u8]>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        RuntimeState {
            buf: vec![0u8; STATE_BYTES].into_boxed_slice(),
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub fn raw(&mut self) -> RawPtr {
        RawPtr::new(self.buf.as_mut_ptr())
    }
}

/// Field bitmaps track which struct fields have been observed; required
/// fields are checked against them at struct end. Fixed width, pooled.
/// Pooled bitmaps come back dirty; the translator clears exactly the
/// words it is going to test.
pub const MAX_BITMAP: usize = 8;

static BITMAP_POOL: Mutex<Vec<Box<[u64; MAX_BITMAP]>>> = Mutex::new(Vec::new());

pub fn bitmap_alloc() -> *mut u64 {
    let bitmap = BITMAP_POOL
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop()
        .unwrap_or_else(|| Box::new([0u64; MAX_BITMAP]));
    Box::into_raw(bitmap) as *mut u64
}

/// # Safety
/// `ptr` must come from `bitmap_alloc` and must not be used afterwards.
pub unsafe fn bitmap_free(ptr: *mut u64) {
    let bitmap = unsafe { Box::from_raw(ptr as *mut [u64; MAX_BITMAP]) };
    BITMAP_POOL
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(bitmap);
}
