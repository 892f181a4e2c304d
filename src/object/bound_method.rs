use crate::object::{Object, ObjClosure, ObjectType};
use crate::value::Value;

/// The result of `instance.method` — the receiver bundled with the method
/// closure, produced by `GET_PROPERTY`/`INVOKE` when the looked-up name
/// resolves to a method rather than a field.
#[repr(C)]
pub struct ObjBoundMethod {
    pub object: Object,
    pub receiver: Value,
    pub method: *mut ObjClosure,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: *mut ObjClosure) -> Self {
        ObjBoundMethod {
            object: Object::new(ObjectType::BoundMethod),
            receiver,
            method,
        }
    }
}
