//! Heap object header and the object-kind enum.
//!
//! Every heap object starts with an [`Object`] header: a `kind` tag, the GC `mark`
//! flag, and a `next` pointer threading every live object into one process-wide
//! intrusive singly linked list (`Vm::objects`), which is the GC sweep list.
//! Objects never own each other; all inter-object references are non-owning raw
//! pointers, and the VM is the sole owner of everything reachable from its roots.

pub mod bound_method;
pub mod class;
pub mod closure;
pub mod function;
pub mod instance;
pub mod native;
pub mod string;
pub mod upvalue;

pub use bound_method::ObjBoundMethod;
pub use class::ObjClass;
pub use closure::ObjClosure;
pub use function::ObjFunction;
pub use instance::ObjInstance;
pub use native::{NativeFn, ObjNative};
pub use string::ObjString;
pub use upvalue::ObjUpvalue;

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ObjectType {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// Common header every heap object is prefixed with.
#[repr(C)]
pub struct Object {
    pub kind: ObjectType,
    pub mark: bool,
    pub next: *mut Object,
}

impl Object {
    pub fn new(kind: ObjectType) -> Self {
        Object {
            kind,
            mark: false,
            next: std::ptr::null_mut(),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({:?}, mark={})", self.kind, self.mark)
    }
}

macro_rules! downcast {
    ($fn_name:ident, $fn_name_mut:ident, $ty:ty, $kind:expr) => {
        /// # Safety
        /// `ptr` must point at a live object whose header kind is `$kind`.
        pub unsafe fn $fn_name(ptr: *const Object) -> *const $ty {
            debug_assert_eq!((*ptr).kind, $kind);
            ptr as *const $ty
        }

        /// # Safety
        /// `ptr` must point at a live object whose header kind is `$kind`.
        pub unsafe fn $fn_name_mut(ptr: *mut Object) -> *mut $ty {
            debug_assert_eq!((*ptr).kind, $kind);
            ptr as *mut $ty
        }
    };
}

downcast!(as_string, as_string_mut, ObjString, ObjectType::String);
downcast!(as_function, as_function_mut, ObjFunction, ObjectType::Function);
downcast!(as_native, as_native_mut, ObjNative, ObjectType::Native);
downcast!(as_closure, as_closure_mut, ObjClosure, ObjectType::Closure);
downcast!(as_upvalue, as_upvalue_mut, ObjUpvalue, ObjectType::Upvalue);
downcast!(as_class, as_class_mut, ObjClass, ObjectType::Class);
downcast!(as_instance, as_instance_mut, ObjInstance, ObjectType::Instance);
downcast!(
    as_bound_method,
    as_bound_method_mut,
    ObjBoundMethod,
    ObjectType::BoundMethod
);

/// Deep size in bytes, used to drive the GC's allocation threshold. Only
/// accounts for the object's own heap footprint (constants/upvalues arrays
/// etc.), not objects it merely references.
///
/// # Safety
/// `ptr` must point at a live, correctly-typed object.
pub unsafe fn deep_size(ptr: *const Object) -> usize {
    match (*ptr).kind {
        ObjectType::String => {
            let s = &*(ptr as *const ObjString);
            std::mem::size_of::<ObjString>() + s.bytes.len()
        }
        ObjectType::Function => std::mem::size_of::<ObjFunction>(),
        ObjectType::Native => std::mem::size_of::<ObjNative>(),
        ObjectType::Closure => {
            let c = &*(ptr as *const ObjClosure);
            std::mem::size_of::<ObjClosure>()
                + c.upvalues.len() * std::mem::size_of::<*mut ObjUpvalue>()
        }
        ObjectType::Upvalue => std::mem::size_of::<ObjUpvalue>(),
        ObjectType::Class => std::mem::size_of::<ObjClass>(),
        ObjectType::Instance => std::mem::size_of::<ObjInstance>(),
        ObjectType::BoundMethod => std::mem::size_of::<ObjBoundMethod>(),
    }
}

#[cfg(feature = "debug_trace_object")]
/// # Safety
/// `ptr` must point at a live, correctly-typed object; called just before it is freed.
pub unsafe fn debug_drop_trace(ptr: *mut Object) {
    match (*ptr).kind {
        ObjectType::String => eprintln!("[gc] free string {:?}", (*(ptr as *const ObjString)).bytes),
        other => eprintln!("[gc] free {:?}", other),
    }
}

#[cfg(not(feature = "debug_trace_object"))]
pub unsafe fn debug_drop_trace(_ptr: *mut Object) {}
