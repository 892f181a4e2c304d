use crate::object::{Object, ObjClass, ObjectType};
use crate::table::Table;

/// A class instance: a reference to its class plus a per-instance field
/// table (`String -> Value`), mutated at runtime by `SET_PROPERTY` and the
/// `setField`/`getField`/`hasField` natives.
#[repr(C)]
pub struct ObjInstance {
    pub object: Object,
    pub class: *mut ObjClass,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: *mut ObjClass) -> Self {
        ObjInstance {
            object: Object::new(ObjectType::Instance),
            class,
            fields: Table::new(),
        }
    }
}
