use crate::chunk::Chunk;
use crate::object::{Object, ObjString, ObjectType};

/// A compiled function body: arity, its own chunk of byte-code, and how many
/// upvalues its closures need to capture. `name` is `None` for the implicit
/// top-level script function.
#[repr(C)]
pub struct ObjFunction {
    pub object: Object,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<*mut ObjString>,
}

impl ObjFunction {
    pub fn new(name: Option<*mut ObjString>) -> Self {
        ObjFunction {
            object: Object::new(ObjectType::Function),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        match self.name {
            Some(ptr) => unsafe { (*ptr).as_str() },
            None => "<script>",
        }
    }
}
