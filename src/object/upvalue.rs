use crate::object::{Object, ObjectType};
use crate::value::Value;

/// A reified captured variable. While *open*, `location` points into the VM's
/// value stack and `next` threads this upvalue into `Vm::open_upvalues`, a
/// list kept sorted by strictly descending stack address. Once the variable's
/// stack slot is about to disappear (function return, block exit), the VM
/// moves the value into `closed` and retargets `location` to point at that
/// field — a one-way transition. `next` is only meaningful while open.
#[repr(C)]
pub struct ObjUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
    pub next: *mut ObjUpvalue,
}

impl ObjUpvalue {
    pub fn new(slot: *mut Value) -> Self {
        ObjUpvalue {
            object: Object::new(ObjectType::Upvalue),
            location: slot,
            closed: Value::Nil,
            next: std::ptr::null_mut(),
        }
    }

    /// True while `location` still aims at a live stack slot rather than `closed`.
    pub fn is_open(&self) -> bool {
        !std::ptr::eq(self.location, &self.closed as *const Value)
    }

    /// Move the referenced stack value into this upvalue and retarget
    /// `location` at the now-owned copy. One-way: calling this twice is a bug
    /// (the second call would just re-close the already-closed value).
    pub fn close(&mut self) {
        debug_assert!(self.is_open());
        self.closed = unsafe { *self.location };
        self.location = &mut self.closed as *mut Value;
    }
}
