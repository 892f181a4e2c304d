use crate::object::{Object, ObjString, ObjectType};
use crate::value::Value;
use crate::vm::Vm;

/// Calling convention for native functions: the VM hands over the live
/// argument window (`args[0..argc]`) and a handle to itself (for natives that
/// need to allocate, e.g. `type`). `Ok` becomes the call's result value;
/// `Err` becomes the message of a runtime error, exactly as if the native had
/// raised one itself.
pub type NativeFn = fn(vm: &mut Vm, args: &[Value]) -> Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    pub object: Object,
    pub name: *mut ObjString,
    pub arity: u8,
    pub function: NativeFn,
}

impl ObjNative {
    pub fn new(name: *mut ObjString, arity: u8, function: NativeFn) -> Self {
        ObjNative {
            object: Object::new(ObjectType::Native),
            name,
            arity,
            function,
        }
    }
}
