//! Bytecode disassembler
//!
//! Converts chunks back to a human-readable listing. Purely observational:
//! used for debugging, tests, and the `trace-exec` feature.

use super::{Chunk, Opcode};
use crate::heap::Heap;
use std::fmt::Write;

/// Disassemble a whole chunk under a header line
///
/// # Format
/// ```text
/// == <script> ==
/// 0000    1 Constant            0 '1.2'
/// 0002    | Return
/// ```
pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "== {} ==", name).expect("string write");

    let mut offset = 0;
    while offset < chunk.code.len() {
        let line = disassemble_instruction(heap, chunk, &mut offset);
        writeln!(output, "{}", line).expect("string write");
    }

    output
}

/// Disassemble a single instruction, advancing `offset` past it
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: &mut usize) -> String {
    let start = *offset;

    let mut prefix = format!("{:04} ", start);
    if start > 0 && chunk.lines[start] == chunk.lines[start - 1] {
        prefix.push_str("   | ");
    } else {
        write!(prefix, "{:4} ", chunk.lines[start]).expect("string write");
    }

    let byte = chunk.code[start];
    *offset += 1;

    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(unknown) => return format!("{}Unknown opcode {}", prefix, unknown),
    };

    let body = match opcode {
        // No operands
        Opcode::Nil
        | Opcode::True
        | Opcode::False
        | Opcode::Zero
        | Opcode::One
        | Opcode::NegOne
        | Opcode::Pop
        | Opcode::Equal
        | Opcode::Greater
        | Opcode::Less
        | Opcode::Not
        | Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide
        | Opcode::Negate
        | Opcode::Print
        | Opcode::CloseUpvalue
        | Opcode::Return => format!("{:?}", opcode),

        // 1-byte inline operand
        Opcode::PopN
        | Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call => {
            let operand = read_u8(chunk, offset);
            format!("{:<16} {:4}", format!("{:?}", opcode), operand)
        }

        // Constant operand, short or long index
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::SetGlobal
        | Opcode::DefineGlobal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::Class
        | Opcode::Method => {
            let index = read_u8(chunk, offset) as usize;
            constant_body(heap, chunk, opcode, index)
        }
        Opcode::ConstantLong
        | Opcode::GetGlobalLong
        | Opcode::SetGlobalLong
        | Opcode::DefineGlobalLong
        | Opcode::GetPropertyLong
        | Opcode::SetPropertyLong
        | Opcode::ClassLong
        | Opcode::MethodLong => {
            let index = read_u24(chunk, offset);
            constant_body(heap, chunk, opcode, index)
        }

        // 16-bit jump operands
        Opcode::Jump | Opcode::JumpIfFalse => {
            let jump = read_u16(chunk, offset) as usize;
            format!(
                "{:<16} {:4} -> {}",
                format!("{:?}", opcode),
                start,
                *offset + jump
            )
        }
        Opcode::Loop => {
            let jump = read_u16(chunk, offset) as usize;
            format!("{:<16} {:4} -> {}", "Loop", start, *offset - jump)
        }

        // Closure: constant operand plus (is_local, index) pairs
        Opcode::Closure | Opcode::ClosureLong => {
            let index = if opcode == Opcode::Closure {
                read_u8(chunk, offset) as usize
            } else {
                read_u24(chunk, offset)
            };
            let mut body = constant_body(heap, chunk, opcode, index);
            let upvalue_count = match chunk.constants.get(index) {
                Some(&crate::value::Value::Obj(function)) => heap.function(function).upvalue_count,
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = read_u8(chunk, offset);
                let upvalue_index = read_u8(chunk, offset);
                write!(
                    body,
                    "\n{:04}    |                       {} {}",
                    *offset - 2,
                    if is_local == 1 { "local" } else { "upvalue" },
                    upvalue_index
                )
                .expect("string write");
            }
            body
        }
    };

    format!("{}{}", prefix, body)
}

fn constant_body(heap: &Heap, chunk: &Chunk, opcode: Opcode, index: usize) -> String {
    let rendered = match chunk.constants.get(index) {
        Some(&value) => heap.format_value(value),
        None => "<bad constant>".to_string(),
    };
    format!("{:<16} {:4} '{}'", format!("{:?}", opcode), index, rendered)
}

fn read_u8(chunk: &Chunk, offset: &mut usize) -> u8 {
    let byte = chunk.code[*offset];
    *offset += 1;
    byte
}

fn read_u16(chunk: &Chunk, offset: &mut usize) -> u16 {
    let high = chunk.code[*offset] as u16;
    let low = chunk.code[*offset + 1] as u16;
    *offset += 2;
    (high << 8) | low
}

fn read_u24(chunk: &Chunk, offset: &mut usize) -> usize {
    let high = chunk.code[*offset] as usize;
    let mid = chunk.code[*offset + 1] as usize;
    let low = chunk.code[*offset + 2] as usize;
    *offset += 3;
    (high << 16) | (mid << 8) | low
}
