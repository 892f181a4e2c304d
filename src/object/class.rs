use crate::object::{Object, ObjClosure, ObjString, ObjectType};
use crate::table::Table;

/// A class: its name, method table (`String -> Closure`), and a cached
/// pointer to its `init` method (if any) so `CALL` doesn't have to probe the
/// method table on every construction.
#[repr(C)]
pub struct ObjClass {
    pub object: Object,
    pub name: *mut ObjString,
    pub methods: Table,
    pub init: Option<*mut ObjClosure>,
}

impl ObjClass {
    pub fn new(name: *mut ObjString) -> Self {
        ObjClass {
            object: Object::new(ObjectType::Class),
            name,
            methods: Table::new(),
            init: None,
        }
    }
}
