use core::ffi::c_void;

use crate::types::InvocationContext;

pub type EnterCallback = unsafe extern "C" fn(*mut InvocationContext, *mut c_void);
pub type LeaveCallback = unsafe extern "C" fn(*mut InvocationContext, *mut c_void);

/// Callbacks run around every call of an attached function.
///
/// `user_data` is passed back untouched; keeping it valid while the hook is
/// installed is the caller's job.
#[derive(Debug, Clone, Copy)]
pub struct CallListener {
    pub on_enter: Option<EnterCallback>,
    pub on_leave: Option<LeaveCallback>,
    pub user_data: *mut c_void,
}

impl CallListener {
    pub fn new(on_enter: Option<EnterCallback>, on_leave: Option<LeaveCallback>, user_data: *mut c_void) -> Self {
        Self { on_enter, on_leave, user_data }
    }
}

// Plain function pointers plus opaque user data. The hooked function may run
// on any thread, so the caller promises `user_data` tolerates that.
unsafe impl Send for CallListener {}
unsafe impl Sync for CallListener {}
