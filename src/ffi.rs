use crate::router::dispatch;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// C entry point for desktop shells. Takes a NUL-terminated JSON command and
/// returns a NUL-terminated JSON response owned by the caller, to be released
/// with [`signdesk_free_string`].
///
/// # Safety
///
/// `input` must be null or point to a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn signdesk_dispatch(input: *const c_char) -> *mut c_char {
    let input_str = if input.is_null() {
        "{}".to_string()
    } else {
        CStr::from_ptr(input).to_string_lossy().into_owned()
    };

    let output = dispatch(&input_str);
    match CString::new(output) {
        Ok(c) => c.into_raw(),
        Err(_) => CString::new(r#"{"type":"Text","text":"ffi_nul_in_response"}"#)
            .map(CString::into_raw)
            .unwrap_or(ptr::null_mut()),
    }
}

/// # Safety
///
/// `ptr` must be null or a pointer returned by [`signdesk_dispatch`] that has
/// not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn signdesk_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}
