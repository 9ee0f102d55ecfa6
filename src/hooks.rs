//! Frozen C ABI for caller-supplied memory and I/O hooks.
//!
//! An embedding producer or consumer hands the engine an [`MdHooks`] vtable
//! plus an opaque `userdata` pointer. The engine allocates its container
//! staging buffer through `allocate`/`deallocate`, streams the finished
//! container out through `write`/`finalize`, and reads an existing container
//! in through `map`. Userdata lifetime is owned by the caller; the engine
//! treats the hook set as stateless and never stores pointers past the call
//! that produced them, except for the mapped image which it copies before
//! returning.
//!
//! # Stability contract
//! - `#[repr(C)]` layout is frozen. Existing field offsets and calling
//!   conventions never change.
//! - New entries are appended **at the end** of `MdHooks` only.
//!
//! # Memory model
//! Every hook entry is optional. A missing `allocate`/`deallocate` pair
//! falls back to the host heap; the pair is honored only when both entries
//! are present. `map`, `write` and `finalize` have no fallback — an
//! operation that needs one of them fails with [`MdError::HookErr`] when the
//! entry is absent. A null return from `allocate` is reported as
//! [`MdError::OutOfMemory`]; the engine never panics on allocation failure
//! through this path.
//!
//! # Thread safety
//! Hooks are invoked on whatever thread calls into the engine. A hook set
//! sharing one userdata across several engine instances must synchronize
//! internally.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use crate::error::MdError;

/// Return codes for the `write` and `finalize` hooks.
pub mod status {
    /// Success.
    pub const OK:      i32 = 0;
    /// Generic failure reported by a hook implementation.
    pub const FAIL:    i32 = -1;
    /// Sentinel the engine reports when a required hook entry is absent.
    pub const MISSING: i32 = -2;
}

/// Alignment requested for the container staging buffer; the container
/// format pads every table and payload to this boundary.
const BUF_ALIGN: usize = 8;

/// Upper bound on the byte count passed to one `write` hook invocation.
/// Larger outputs are split, so `write` may fire several times during one
/// context finalize; the `finalize` hook still fires exactly once.
pub(crate) const WRITE_CHUNK: usize = 64 * 1024;

/// Caller-supplied hook vtable.
///
/// # Safety
/// All function pointers are `unsafe extern "C"` because they cross an FFI
/// boundary. The engine-side wrapper ([`HookAdapter`]) enforces the safety
/// invariants documented on each field before delegating to the raw pointer.
///
/// # Layout
/// `#[repr(C)]` is mandatory. Do not reorder fields. New fields go at the
/// end only.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MdHooks {
    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Returns null on failure. A non-null return must point at a writable
    /// region of at least `size` bytes, released later by exactly one
    /// `deallocate` call with the same pointer.
    ///
    /// # Safety
    /// - `align` is a power of two.
    /// - The returned region must stay valid until `deallocate`.
    pub allocate: Option<unsafe extern "C" fn(
        size:     usize,
        align:    usize,
        userdata: *mut c_void,
    ) -> *mut u8>,

    /// Release a pointer previously returned by `allocate`.
    ///
    /// # Safety
    /// - `ptr` was returned by this vtable's `allocate` and has not been
    ///   released yet.
    pub deallocate: Option<unsafe extern "C" fn(
        ptr:      *mut u8,
        userdata: *mut c_void,
    )>,

    /// Expose the container image to load from.
    ///
    /// Writes the image length through `len` and returns a pointer to its
    /// first byte, or null on failure. The engine copies the region before
    /// returning from the load call, so the mapping only needs to stay
    /// valid for the duration of that call.
    ///
    /// # Safety
    /// - On a non-null return, `ptr[0..*len]` must be a valid readable
    ///   region.
    pub map: Option<unsafe extern "C" fn(
        userdata: *mut c_void,
        len:      *mut usize,
    ) -> *const u8>,

    /// Consume `len` bytes of container output.
    ///
    /// Returns [`status::OK`] on success. May be invoked several times per
    /// finalize (chunked output); chunks arrive in order.
    ///
    /// # Safety
    /// - `data[0..len]` is a valid readable region for the duration of the
    ///   call; the pointer must not be retained.
    pub write: Option<unsafe extern "C" fn(
        userdata: *mut c_void,
        data:     *const u8,
        len:      usize,
    ) -> i32>,

    /// Mark end-of-stream after the last `write`. Invoked exactly once per
    /// context finalize. Returns [`status::OK`] on success.
    pub finalize: Option<unsafe extern "C" fn(userdata: *mut c_void) -> i32>,
}

impl MdHooks {
    /// Vtable with every entry absent: heap allocation, no I/O.
    pub const fn none() -> Self {
        MdHooks {
            allocate:   None,
            deallocate: None,
            map:        None,
            write:      None,
            finalize:   None,
        }
    }
}

// ── Engine-facing adapter ───────────────────────────────────────────────────

/// Safe engine-side wrapper around a hook vtable and its userdata.
#[derive(Debug)]
pub(crate) struct HookAdapter {
    hooks:    MdHooks,
    userdata: *mut c_void,
}

impl HookAdapter {
    pub(crate) fn new(hooks: MdHooks, userdata: *mut c_void) -> Self {
        Self { hooks, userdata }
    }

    /// Allocate a zeroed staging buffer of exactly `size` bytes.
    ///
    /// Uses the hook pair when both entries are present, the host heap
    /// otherwise. Zeroed memory keeps the container's alignment padding
    /// deterministic without explicit fills.
    pub(crate) fn allocate(&self, size: usize) -> Result<HookBuf, MdError> {
        debug_assert!(size > 0);
        if let (Some(allocate), Some(deallocate)) = (self.hooks.allocate, self.hooks.deallocate) {
            let raw = unsafe { allocate(size, BUF_ALIGN, self.userdata) };
            let ptr = NonNull::new(raw).ok_or(MdError::OutOfMemory)?;
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
            Ok(HookBuf {
                ptr,
                len: size,
                release: Release::Hook { deallocate, userdata: self.userdata },
            })
        } else {
            let layout = Layout::from_size_align(size, BUF_ALIGN)
                .map_err(|_| MdError::OutOfMemory)?;
            let raw = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(raw).ok_or(MdError::OutOfMemory)?;
            Ok(HookBuf { ptr, len: size, release: Release::Heap { layout } })
        }
    }

    /// Stream `data` through the `write` hook in [`WRITE_CHUNK`] pieces.
    pub(crate) fn write_all(&self, data: &[u8]) -> Result<(), MdError> {
        let write = self.hooks.write.ok_or(MdError::HookErr {
            hook:   "write",
            status: status::MISSING,
        })?;
        for chunk in data.chunks(WRITE_CHUNK) {
            let rc = unsafe { write(self.userdata, chunk.as_ptr(), chunk.len()) };
            if rc != status::OK {
                return Err(MdError::HookErr { hook: "write", status: rc });
            }
        }
        Ok(())
    }

    /// Fire the `finalize` hook, marking end-of-stream.
    pub(crate) fn finish(&self) -> Result<(), MdError> {
        let finalize = self.hooks.finalize.ok_or(MdError::HookErr {
            hook:   "finalize",
            status: status::MISSING,
        })?;
        let rc = unsafe { finalize(self.userdata) };
        if rc != status::OK {
            return Err(MdError::HookErr { hook: "finalize", status: rc });
        }
        Ok(())
    }

    /// Borrow the caller's mapped container image via the `map` hook.
    ///
    /// The view is only valid for the duration of the current engine call;
    /// load copies it into an owned image before validating anything.
    pub(crate) fn map_source(&self) -> Result<&[u8], MdError> {
        let map = self.hooks.map.ok_or(MdError::HookErr {
            hook:   "map",
            status: status::MISSING,
        })?;
        let mut len = 0usize;
        let raw = unsafe { map(self.userdata, &mut len) };
        if raw.is_null() {
            return Err(MdError::HookErr { hook: "map", status: status::FAIL });
        }
        if len == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { slice::from_raw_parts(raw, len) })
    }
}

enum Release {
    Hook {
        deallocate: unsafe extern "C" fn(*mut u8, *mut c_void),
        userdata:   *mut c_void,
    },
    Heap {
        layout: Layout,
    },
}

/// Owned staging buffer released through whichever allocator produced it.
pub(crate) struct HookBuf {
    ptr:     NonNull<u8>,
    len:     usize,
    release: Release,
}

impl HookBuf {
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HookBuf {
    fn drop(&mut self) {
        match self.release {
            Release::Hook { deallocate, userdata } => unsafe {
                deallocate(self.ptr.as_ptr(), userdata);
            },
            Release::Heap { layout } => unsafe {
                dealloc(self.ptr.as_ptr(), layout);
            },
        }
    }
}

// ── In-memory reference implementation ──────────────────────────────────────

/// Complete in-memory hook set over owned byte buffers.
///
/// Acts as both sink (collects `write` output, observes `finalize`) and
/// source (`map` exposes a caller-provided image). This is the vehicle the
/// CLI and the test suite drive containers through; embedders with real
/// mappings or file descriptors supply their own vtable instead.
///
/// The handle also keeps bookkeeping counters so tests can assert the hook
/// protocol: chunked writes arrive in order, `finalize` fires once, and
/// every hook allocation is returned.
#[derive(Debug)]
pub struct BufferHooks {
    inner: NonNull<Inner>,
}

struct Inner {
    sink:           Vec<u8>,
    source:         Vec<u8>,
    write_calls:    usize,
    finalize_calls: usize,
    live_allocs:    usize,
    finalized:      bool,
}

impl BufferHooks {
    /// Empty sink, no source image.
    pub fn new() -> Self {
        Self::with_source(Vec::new())
    }

    /// Sink plus a source image for `map` to expose.
    pub fn with_source(source: Vec<u8>) -> Self {
        let inner = Box::new(Inner {
            sink: Vec::new(),
            source,
            write_calls: 0,
            finalize_calls: 0,
            live_allocs: 0,
            finalized: false,
        });
        BufferHooks { inner: NonNull::from(Box::leak(inner)) }
    }

    /// Vtable with all five entries wired to this buffer.
    pub fn vtable(&self) -> MdHooks {
        MdHooks {
            allocate:   Some(buffer_allocate),
            deallocate: Some(buffer_deallocate),
            map:        Some(buffer_map),
            write:      Some(buffer_write),
            finalize:   Some(buffer_finalize),
        }
    }

    /// Opaque userdata pointer matching [`Self::vtable`].
    pub fn userdata(&self) -> *mut c_void {
        self.inner.as_ptr().cast()
    }

    /// Bytes collected from `write` calls so far.
    pub fn bytes(&self) -> &[u8] {
        unsafe { &self.inner.as_ref().sink }
    }

    /// Consume the handle and take the collected output.
    pub fn into_bytes(self) -> Vec<u8> {
        let inner = unsafe { Box::from_raw(self.inner.as_ptr()) };
        mem::forget(self);
        inner.sink
    }

    #[inline]
    pub fn write_calls(&self) -> usize {
        unsafe { self.inner.as_ref().write_calls }
    }

    #[inline]
    pub fn finalize_calls(&self) -> usize {
        unsafe { self.inner.as_ref().finalize_calls }
    }

    /// Hook allocations not yet returned through `deallocate`.
    #[inline]
    pub fn live_allocs(&self) -> usize {
        unsafe { self.inner.as_ref().live_allocs }
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        unsafe { self.inner.as_ref().finalized }
    }
}

impl Default for BufferHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferHooks {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.inner.as_ptr())) }
    }
}

// Two usizes (total allocation size, requested alignment) sit immediately
// below every pointer handed out, so deallocate can rebuild the layout
// without extra bookkeeping. The header is at least `align` bytes so the
// user pointer keeps the requested alignment.
unsafe extern "C" fn buffer_allocate(size: usize, align: usize, userdata: *mut c_void) -> *mut u8 {
    if size == 0 || !align.is_power_of_two() {
        return ptr::null_mut();
    }
    let head = align.max(2 * mem::size_of::<usize>());
    let total = match head.checked_add(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let layout = match Layout::from_size_align(total, align.max(mem::align_of::<usize>())) {
        Ok(l) => l,
        Err(_) => return ptr::null_mut(),
    };
    let base = alloc_zeroed(layout);
    if base.is_null() {
        return ptr::null_mut();
    }
    let user = base.add(head);
    let meta = user.cast::<usize>().sub(2);
    meta.write(total);
    meta.add(1).write(align);
    (*userdata.cast::<Inner>()).live_allocs += 1;
    user
}

unsafe extern "C" fn buffer_deallocate(ptr_in: *mut u8, userdata: *mut c_void) {
    if ptr_in.is_null() {
        return;
    }
    let meta = ptr_in.cast::<usize>().sub(2);
    let total = meta.read();
    let align = meta.add(1).read();
    let head = align.max(2 * mem::size_of::<usize>());
    let layout = Layout::from_size_align_unchecked(total, align.max(mem::align_of::<usize>()));
    dealloc(ptr_in.sub(head), layout);
    let inner = &mut *userdata.cast::<Inner>();
    inner.live_allocs = inner.live_allocs.saturating_sub(1);
}

unsafe extern "C" fn buffer_map(userdata: *mut c_void, len: *mut usize) -> *const u8 {
    let inner = &*userdata.cast::<Inner>();
    *len = inner.source.len();
    inner.source.as_ptr()
}

unsafe extern "C" fn buffer_write(userdata: *mut c_void, data: *const u8, len: usize) -> i32 {
    let inner = &mut *userdata.cast::<Inner>();
    if inner.finalized {
        return status::FAIL;
    }
    if len > 0 {
        if data.is_null() {
            return status::FAIL;
        }
        inner.sink.extend_from_slice(slice::from_raw_parts(data, len));
    }
    inner.write_calls += 1;
    status::OK
}

unsafe extern "C" fn buffer_finalize(userdata: *mut c_void) -> i32 {
    let inner = &mut *userdata.cast::<Inner>();
    inner.finalize_calls += 1;
    if inner.finalized {
        return status::FAIL;
    }
    inner.finalized = true;
    status::OK
}
