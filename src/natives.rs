//! Built-in native functions, installed as `Var` globals at VM startup.
//! `clock`/`sqrt`/`type` follow `original_source/src/natives.c`'s semantics
//! exactly; `length`/`hasField`/`getField`/`setField` are this dialect's own
//! additions for the field-manipulation surface.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::object::{self, ObjInstance, Object, ObjectType};
use crate::value::{self, Value};
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
    vm.define_native("sqrt", 1, sqrt);
    vm.define_native("type", 1, type_of);
    vm.define_native("length", 1, length);
    vm.define_native("hasField", 2, has_field);
    vm.define_native("getField", 2, get_field);
    vm.define_native("setField", 3, set_field);
}

fn expect_number(value: &Value, fn_name: &str) -> Result<f64, String> {
    if value.is_number() {
        Ok(value.as_number())
    } else {
        Err(format!("{fn_name}() requires a number argument."))
    }
}

fn expect_string<'a>(value: &'a Value, fn_name: &str) -> Result<&'a str, String> {
    if value.is_string() {
        Ok(unsafe { (*object::as_string(value.as_obj())).as_str() })
    } else {
        Err(format!("{fn_name}() requires a string argument."))
    }
}

fn expect_instance(value: &Value, fn_name: &str) -> Result<*mut ObjInstance, String> {
    if value.is_obj_kind(ObjectType::Instance) {
        Ok(unsafe { object::as_instance_mut(value.as_obj()) })
    } else {
        Err(format!("{fn_name}() requires an instance argument."))
    }
}

fn clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is set before the Unix epoch.".to_string())?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_number(&args[0], "sqrt").map(|n| Value::Number(n.sqrt()))
}

fn type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let tag = value::type_name(&args[0]);
    let ptr = vm.intern(tag);
    Ok(Value::Obj(ptr as *mut Object))
}

fn length(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let s = expect_string(&args[0], "length")?;
    Ok(Value::Number(s.chars().count() as f64))
}

fn has_field(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = expect_instance(&args[0], "hasField")?;
    expect_string(&args[1], "hasField")?;
    let found = unsafe { (*instance).fields.get(&args[1]) }.is_some();
    Ok(Value::Bool(found))
}

fn get_field(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = expect_instance(&args[0], "getField")?;
    expect_string(&args[1], "getField")?;
    Ok(unsafe { (*instance).fields.get(&args[1]) }.unwrap_or(Value::Nil))
}

fn set_field(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = expect_instance(&args[0], "setField")?;
    expect_string(&args[1], "setField")?;
    let value = args[2];
    unsafe { (*instance).fields.set(args[1], value) };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn sqrt_and_length_and_type() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print sqrt(9);"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print length(\"hello\");"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print type(1);"), InterpretResult::Ok);
    }

    #[test]
    fn field_natives_round_trip() {
        let mut vm = Vm::new();
        let source = "\
            class Box {}\n\
            var b = Box();\n\
            setField(b, \"x\", 42);\n\
            print hasField(b, \"x\");\n\
            print getField(b, \"x\");\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }
}
