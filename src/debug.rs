//! Bytecode disassembler. Every function here is unconditionally compiled
//! (matching clox's `debug.c`); callers gate their use behind
//! `debug_print_code`/`debug_trace_execution` so the feature stays
//! zero-cost when off.

use crate::chunk::{Chunk, OpCode};
use crate::value;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{offset:04} ");
    print!("{:4} ", chunk.line_for(offset));

    let op = OpCode::from_byte(chunk.code[offset]);
    match op {
        OpCode::Constant => constant_instruction("CONSTANT", chunk, offset, false),
        OpCode::ConstantLong => constant_instruction("CONSTANT_LONG", chunk, offset, true),
        OpCode::Nil => simple_instruction("NIL", offset),
        OpCode::True => simple_instruction("TRUE", offset),
        OpCode::False => simple_instruction("FALSE", offset),
        OpCode::Zero => simple_instruction("ZERO", offset),
        OpCode::One => simple_instruction("ONE", offset),
        OpCode::Two => simple_instruction("TWO", offset),
        OpCode::MinusOne => simple_instruction("MINUS_ONE", offset),
        OpCode::Pop => simple_instruction("POP", offset),
        OpCode::PopN => byte_instruction("POPN", chunk, offset),
        OpCode::Dup => simple_instruction("DUP", offset),
        OpCode::GetLocal => byte_instruction("GET_LOCAL", chunk, offset),
        OpCode::GetLocalLong => long_instruction("GET_LOCAL_LONG", chunk, offset),
        OpCode::SetLocal => byte_instruction("SET_LOCAL", chunk, offset),
        OpCode::SetLocalLong => long_instruction("SET_LOCAL_LONG", chunk, offset),
        OpCode::GetGlobal => byte_instruction("GET_GLOBAL", chunk, offset),
        OpCode::GetGlobalLong => long_instruction("GET_GLOBAL_LONG", chunk, offset),
        OpCode::SetGlobal => byte_instruction("SET_GLOBAL", chunk, offset),
        OpCode::SetGlobalLong => long_instruction("SET_GLOBAL_LONG", chunk, offset),
        OpCode::DefineGlobal => byte_instruction("DEFINE_GLOBAL", chunk, offset),
        OpCode::DefineGlobalLong => long_instruction("DEFINE_GLOBAL_LONG", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("SET_UPVALUE", chunk, offset),
        OpCode::GetProperty => constant_instruction("GET_PROPERTY", chunk, offset, false),
        OpCode::GetPropertyLong => constant_instruction("GET_PROPERTY_LONG", chunk, offset, true),
        OpCode::SetProperty => constant_instruction("SET_PROPERTY", chunk, offset, false),
        OpCode::SetPropertyLong => constant_instruction("SET_PROPERTY_LONG", chunk, offset, true),
        OpCode::DelProperty => constant_instruction("DEL_PROPERTY", chunk, offset, false),
        OpCode::DelPropertyLong => constant_instruction("DEL_PROPERTY_LONG", chunk, offset, true),
        OpCode::Equal => simple_instruction("EQUAL", offset),
        OpCode::Greater => simple_instruction("GREATER", offset),
        OpCode::Less => simple_instruction("LESS", offset),
        OpCode::Add => simple_instruction("ADD", offset),
        OpCode::Subtract => simple_instruction("SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("MULTIPLY", offset),
        OpCode::Divide => simple_instruction("DIVIDE", offset),
        OpCode::Not => simple_instruction("NOT", offset),
        OpCode::Negate => simple_instruction("NEGATE", offset),
        OpCode::Increment => simple_instruction("INCREMENT", offset),
        OpCode::Decrement => simple_instruction("DECREMENT", offset),
        OpCode::Print => simple_instruction("PRINT", offset),
        OpCode::Jump => jump_instruction("JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::JumpIfTrue => jump_instruction("JUMP_IF_TRUE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("LOOP", -1, chunk, offset),
        OpCode::Call => byte_instruction("CALL", chunk, offset),
        OpCode::Invoke => invoke_instruction("INVOKE", chunk, offset, false),
        OpCode::InvokeLong => invoke_instruction("INVOKE_LONG", chunk, offset, true),
        OpCode::Closure => closure_instruction(chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("RETURN", offset),
        OpCode::Class => constant_instruction("CLASS", chunk, offset, false),
        OpCode::ClassLong => constant_instruction("CLASS_LONG", chunk, offset, true),
        OpCode::Method => constant_instruction("METHOD", chunk, offset, false),
        OpCode::MethodLong => constant_instruction("METHOD_LONG", chunk, offset, true),
        OpCode::Unknown(byte) => {
            println!("Unknown opcode {byte}");
            offset + 1
        }
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:<20} {slot:>4}");
    offset + 2
}

fn long_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_u24(offset + 1);
    println!("{name:<20} {index:>4}");
    offset + 4
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (index, next) = if long {
        (chunk.read_u24(offset + 1), offset + 4)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    };
    print!("{name:<20} {index:>4} '");
    value::print_value(&chunk.constants[index]);
    println!("'");
    next
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign as i64 * jump as i64;
    println!("{name:<20} {offset:>4} -> {target}");
    offset + 3
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize, long: bool) -> usize {
    let (index, argc_offset, next) = if long {
        (chunk.read_u24(offset + 1), offset + 4, offset + 5)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2, offset + 3)
    };
    let argc = chunk.code[argc_offset];
    print!("{name:<20} ({argc} args) {index:>4} '");
    value::print_value(&chunk.constants[index]);
    println!("'");
    next
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    print!("{:<20} {:>4} '", "CLOSURE", index);
    value::print_value(&chunk.constants[index]);
    println!("'");
    let mut cursor = offset + 2;

    let function = match chunk.constants[index] {
        value::Value::Obj(ptr) => unsafe { crate::object::as_function(ptr) },
        _ => return cursor,
    };
    let upvalue_count = unsafe { (*function).upvalue_count };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let upvalue_index = chunk.code[cursor + 1];
        println!(
            "{cursor:04}      |                     {} {upvalue_index}",
            if is_local != 0 { "local" } else { "upvalue" }
        );
        cursor += 2;
    }
    cursor
}
