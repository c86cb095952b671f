//! `extern "C"` entry points matching AFL++'s custom-mutator ABI
//! (`custom_mutator.h`), which the Python `ChiloMutate.py` module targets
//! indirectly through AFL++'s Python custom-mutator shim. A Rust cdylib
//! implementing the same five symbols is a direct substitute.
//!
//! Each function is a thin, `catch_unwind`-guarded, non-async shim around
//! [`Factory`]. `afl_custom_init` owns the tokio runtime the background
//! stage workers run on for the rest of the process's life; every other
//! callback calls straight into `Factory` without itself touching the
//! runtime (`fuzz_count` only does non-blocking channel sends; `fuzz` may
//! suspend only by blocking the calling OS thread on **ready**, per
//! `spec.md` §5).

use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::error;

use crate::factory::Factory;

/// Bundles the `Factory` with the runtime it and its background workers run
/// on, behind the opaque handle AFL++ carries between callbacks.
struct Host {
    factory: Factory,
    runtime: tokio::runtime::Runtime,
}

/// `afl_custom_init`: reads the config path from `CHILO_FUZZ_CONFIG`
/// (AFL++'s custom mutators receive no argument channel beyond `afl_state`
/// and a seed), builds the tokio runtime, starts the `Factory` on it, and
/// leaks the result behind an opaque pointer.
///
/// Returns null on any failure; AFL++ treats a null `afl_custom_init`
/// return as custom-mutator initialization failure.
#[no_mangle]
pub extern "C" fn afl_custom_init(_afl_state: *mut c_void, _seed: u32) -> *mut c_void {
    let outcome = panic::catch_unwind(|| {
        let config_path = config_path_from_env()?;
        let runtime = tokio::runtime::Runtime::new().ok()?;
        let factory = runtime.block_on(async {
            tokio::task::spawn_blocking(move || Factory::start(&config_path))
                .await
                .ok()?
                .ok()
        })?;
        Some(Box::new(Host { factory, runtime }))
    });

    match outcome {
        Ok(Some(host)) => Box::into_raw(host) as *mut c_void,
        Ok(None) => {
            error!("chilo factory failed to start, afl_custom_init returning null");
            std::ptr::null_mut()
        }
        Err(_) => {
            error!("panic in afl_custom_init");
            std::ptr::null_mut()
        }
    }
}

fn config_path_from_env() -> Option<std::path::PathBuf> {
    std::env::var_os("CHILO_FUZZ_CONFIG").map(std::path::PathBuf::from)
}

/// `afl_custom_fuzz_count`: intakes the queue entry's bytes and returns the
/// fixed mutate budget. Never blocks on the pipeline; `Factory::intake` only
/// ever does non-blocking sends.
///
/// # Safety
/// `data` must be a non-null pointer previously returned by
/// [`afl_custom_init`]. `buf` must point to at least `buf_size` readable
/// bytes.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_fuzz_count(data: *mut c_void, buf: *const u8, buf_size: usize) -> u32 {
    let Some(host) = (data as *mut Host).as_ref() else {
        return 0;
    };
    let bytes = std::slice::from_raw_parts(buf, buf_size);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| host.factory.intake(bytes)));
    outcome.unwrap_or_else(|_| {
        error!("panic in afl_custom_fuzz_count");
        0
    })
}

/// `afl_custom_fuzz`: the hot path. `buf`'s bytes identify which seed the
/// host is asking about (content-addressed through the same registry
/// `fuzz_count` populated); the return is a dispatched mutator's output,
/// truncated to `max_size`, written into a buffer `*out_buf` is pointed at.
///
/// `add_buf`/`add_buf_size` (AFL++'s optional splicing partner) are unused:
/// [`afl_custom_splice_optout`] declares this mutator opts out of splicing.
///
/// # Safety
/// `data` must be a non-null pointer previously returned by
/// [`afl_custom_init`]. `buf` must point to at least `buf_size` readable
/// bytes. `out_buf` must point to a valid `*mut u8` slot the caller will
/// treat as borrowed only until the next call into this library.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_fuzz(
    data: *mut c_void,
    buf: *const u8,
    buf_size: usize,
    _add_buf: *const u8,
    _add_buf_size: usize,
    out_buf: *mut *mut u8,
    max_size: usize,
) -> usize {
    let Some(host) = (data as *mut Host).as_ref() else {
        return 0;
    };
    let bytes = std::slice::from_raw_parts(buf, buf_size);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let started_at = std::time::Instant::now();
        let (source_seed_id, _is_new) = host.factory.registry.intake(bytes);
        let ready_queue_depth = host.factory.queues.ready.len();

        let dispatch = host.factory.fuzz(source_seed_id);
        let ori_size = dispatch.bytes.len();
        let mut truncated = dispatch.bytes;
        let was_truncated = truncated.len() > max_size;
        if was_truncated {
            truncated.truncate(max_size);
        }
        let real_size = truncated.len();

        host.factory
            .record_main_row(&dispatch, started_at, ready_queue_depth, ori_size, real_size, was_truncated);

        truncated
    }));

    let bytes = match outcome {
        Ok(bytes) => bytes,
        Err(_) => {
            error!("panic in afl_custom_fuzz");
            return 0;
        }
    };

    write_out_buf(out_buf, &bytes)
}

/// Copies `bytes` into a heap buffer owned by this library and hands AFL++
/// a pointer to it, per the `out_buf`/return-length convention of
/// `afl_custom_fuzz`.
unsafe fn write_out_buf(out_buf: *mut *mut u8, bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let boxed: Box<[u8]> = bytes.to_vec().into_boxed_slice();
    let ptr = Box::into_raw(boxed) as *mut u8;
    *out_buf = ptr;
    bytes.len()
}

/// `afl_custom_splice_optout`: presence of this symbol tells AFL++ not to
/// call this mutator during splicing. Mutation already consults the full
/// Mutator Pool, so splicing adds nothing.
#[no_mangle]
pub extern "C" fn afl_custom_splice_optout(_data: *mut c_void) {}

/// `afl_custom_deinit`: reclaims the boxed [`Host`], shutting the `Factory`
/// down and dropping the runtime (which drops its background worker tasks).
///
/// # Safety
/// `data` must be a pointer previously returned by [`afl_custom_init`],
/// passed at most once; the host must not call any other ABI function with
/// the same pointer afterward.
#[no_mangle]
pub unsafe extern "C" fn afl_custom_deinit(data: *mut c_void) {
    if data.is_null() {
        return;
    }
    let host = Box::from_raw(data as *mut Host);
    let result = panic::catch_unwind(AssertUnwindSafe(|| host.factory.shutdown()));
    if result.is_err() {
        error!("panic in afl_custom_deinit");
    }
    // `host.runtime` drops here, tearing down all daemonic worker tasks.
}

/// Frees a buffer previously returned through `afl_custom_fuzz`'s `out_buf`.
/// Not part of AFL++'s core five callbacks, but required so a C host can
/// release the boxed slice `write_out_buf` leaked; exported for symmetry
/// with custom allocators that don't simply `free()` it.
///
/// # Safety
/// `ptr`/`len` must be exactly the pointer and length most recently handed
/// back through `afl_custom_fuzz`'s `out_buf`, not yet freed.
#[no_mangle]
pub unsafe extern "C" fn chilo_fuzz_free_out_buf(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)));
}

/// Minor AFL++ convention: some hosts probe for a mutator's human-readable
/// name before calling `init`. Returns a static, null-terminated string.
#[no_mangle]
pub extern "C" fn afl_custom_name() -> *const c_char {
    static NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"chilo-fuzz\0") };
    NAME.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_from_env_reads_the_expected_variable() {
        std::env::set_var("CHILO_FUZZ_CONFIG", "/tmp/does-not-matter.yaml");
        assert_eq!(config_path_from_env(), Some(Path::new("/tmp/does-not-matter.yaml").to_owned()));
        std::env::remove_var("CHILO_FUZZ_CONFIG");
        assert_eq!(config_path_from_env(), None);
    }

    #[test]
    fn write_out_buf_on_empty_bytes_returns_zero() {
        let mut out: *mut u8 = std::ptr::null_mut();
        let len = unsafe { write_out_buf(&mut out as *mut *mut u8, &[]) };
        assert_eq!(len, 0);
    }

    #[test]
    fn write_out_buf_round_trips_through_free() {
        let mut out: *mut u8 = std::ptr::null_mut();
        let len = unsafe { write_out_buf(&mut out as *mut *mut u8, b"hello") };
        assert_eq!(len, 5);
        let copied = unsafe { std::slice::from_raw_parts(out, len) }.to_vec();
        assert_eq!(copied, b"hello");
        unsafe { chilo_fuzz_free_out_buf(out, len) };
    }

    #[test]
    fn afl_custom_name_is_a_valid_c_string() {
        let ptr = afl_custom_name();
        let name = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(name, "chilo-fuzz");
    }
}
