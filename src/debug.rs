// File: src/debug.rs
//
// Human-readable bytecode dumps. Used by --print-code after compilation
// and by --trace-execution for the per-instruction trace.

use std::io::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::Value;

/// Dumps every instruction of a chunk followed by its constants table.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str, out: &mut dyn Write) {
    let _ = writeln!(out, "=== compiled chunk {} ===", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, out);
    }
    let _ = writeln!(out, "==/ compiled chunk {} /==", name);
    disassemble_constants(heap, chunk, name, out);
}

pub fn disassemble_constants(heap: &Heap, chunk: &Chunk, name: &str, out: &mut dyn Write) {
    let _ = writeln!(out, "=== constants {} ===", name);
    for (index, constant) in chunk.constants.iter().enumerate() {
        let _ = writeln!(out, "    {}    {}", index, constant.display(heap));
    }
    let _ = writeln!(out, "==/ constants /==");
}

/// Prints one instruction and returns the offset of the next one. The
/// line column shows `|` when the line is unchanged from the previous
/// instruction.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset - 1] == chunk.lines[offset] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let opcode = match OpCode::from_byte(chunk.code[offset]) {
        Some(opcode) => opcode,
        None => {
            let _ = writeln!(out, "Unknown opcode: {}", chunk.code[offset]);
            return offset + 1;
        }
    };
    match opcode {
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
        OpCode::Constant => constant_instruction("OP_CONSTANT", heap, chunk, offset, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", heap, chunk, offset, out),
        OpCode::DefineGlobal => {
            constant_instruction("OP_DEFINE_GLOBAL", heap, chunk, offset, out)
        }
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", heap, chunk, offset, out),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset, out),
        OpCode::Greater => simple_instruction("OP_GREATER", offset, out),
        OpCode::Less => simple_instruction("OP_LESS", offset, out),
        OpCode::Add => simple_instruction("OP_ADD", offset, out),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset, out),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset, out),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset, out),
        OpCode::Not => simple_instruction("OP_NOT", offset, out),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset, out),
        OpCode::Print => simple_instruction("OP_PRINT", offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        OpCode::Noop => byte_instruction("OP_NOOP", chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut dyn Write) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> usize {
    let operand = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<20}{:4}", name, operand);
    offset + 2
}

fn constant_instruction(
    name: &str,
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let _ = writeln!(out, "{:<20}{:4} '{}'", name, index, chunk.constants[index].display(heap));
    offset + 2
}

fn jump_instruction(
    name: &str,
    sign: i64,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    let _ = writeln!(out, "{:<20}{:4} -> {}", name, offset, target);
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let constant = chunk.constants[index];
    let _ = writeln!(out, "{:<20}{:4} {}", "OP_CLOSURE", index, constant.display(heap));

    let upvalue_count = match constant {
        Value::Function(handle) => heap.get(handle).upvalue_count,
        _ => 0,
    };
    let mut offset = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let slot = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local == 0 { "upvalue" } else { "local" },
            slot
        );
        offset += 2;
    }
    offset
}
