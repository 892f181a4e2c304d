use crate::object::{Object, ObjFunction, ObjUpvalue, ObjectType};

/// A closure pairs a (non-owned) [`ObjFunction`] with the upvalues it captured
/// at creation time. The function is never owned by the closure — several
/// closures created from the same `fn` declaration share the same
/// `ObjFunction`.
#[repr(C)]
pub struct ObjClosure {
    pub object: Object,
    pub function: *mut ObjFunction,
    pub upvalues: Vec<*mut ObjUpvalue>,
}

impl ObjClosure {
    pub fn new(function: *mut ObjFunction) -> Self {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjClosure {
            object: Object::new(ObjectType::Closure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}
