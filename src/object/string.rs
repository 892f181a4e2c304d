use super::{Object, ObjectType};

/// An interned, immutable string. Two live `ObjString`s are never equal by
/// content — equality of bytes implies pointer identity, enforced by the VM's
/// intern table (see `Vm::intern`).
#[repr(C)]
pub struct ObjString {
    pub object: Object,
    pub bytes: Box<str>,
    pub hash: u32,
}

/// FNV-1a, matching clox's `hashString`.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

impl ObjString {
    pub fn new(bytes: &str) -> Box<ObjString> {
        let hash = fnv1a(bytes.as_bytes());
        Box::new(ObjString {
            object: Object::new(ObjectType::String),
            bytes: bytes.into(),
            hash,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.bytes
    }
}
