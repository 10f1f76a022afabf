//! Bytecode disassembler. Always compiled (mirroring the teacher's
//! `chunk.rs`, where `disassemble_instr_at` is an ordinary method and only
//! its call sites are gated behind a cargo feature); this lets the VM's
//! `debug-execution` trace reuse the same decoder the compiler's
//! `debug-bytecode` dump uses, without pulling the other crate's feature in.

use runtime::{Chunk, OpCode};

/// Renders every instruction in `chunk` under a `== name ==` header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut buffer = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, size) = disassemble_instruction(&mut buffer, chunk, offset);
        let _ = line;
        offset += size;
    }
    buffer
}

/// Decodes the instruction at `offset`, appending its rendering to `out`.
/// Returns the byte offset of the start of the next instruction.
pub fn disassemble_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> ((), usize) {
    out.push_str(&format!("{offset:04} "));
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.line_at(offset)));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        out.push_str(&format!("unknown opcode {}\n", chunk.code[offset]));
        return ((), 1);
    };

    let size = match op {
        OpCode::Constant | OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal
        | OpCode::Class | OpCode::Method | OpCode::GetProperty | OpCode::SetProperty
        | OpCode::GetSuper => {
            let idx = chunk.code[offset + 1] as usize;
            out.push_str(&format!("{:<16} {:4} '{}'\n", mnemonic(op), idx, chunk.constants[idx]));
            2
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call | OpCode::Array => {
            let slot = chunk.code[offset + 1];
            out.push_str(&format!("{:<16} {:4}\n", mnemonic(op), slot));
            2
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let idx = chunk.code[offset + 1] as usize;
            let argc = chunk.code[offset + 2];
            out.push_str(&format!(
                "{:<16} ({} args) {:4} '{}'\n",
                mnemonic(op),
                argc,
                idx,
                chunk.constants[idx]
            ));
            3
        }
        OpCode::Jump | OpCode::JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1);
            out.push_str(&format!(
                "{:<16} {:4} -> {}\n",
                mnemonic(op),
                offset,
                offset + 3 + jump as usize
            ));
            3
        }
        OpCode::Loop => {
            let jump = chunk.read_u16(offset + 1);
            out.push_str(&format!(
                "{:<16} {:4} -> {}\n",
                mnemonic(op),
                offset,
                offset + 3 - jump as usize
            ));
            3
        }
        OpCode::Closure => {
            let idx = chunk.code[offset + 1] as usize;
            out.push_str(&format!("{:<16} {:4} '{}'\n", mnemonic(op), idx, chunk.constants[idx]));
            let mut size = 2;
            if let Some(function) = chunk.constants[idx].as_obj().and_then(|o| o.as_function()) {
                for _ in 0..function.upvalue_count.get() {
                    let is_local = chunk.code[offset + size];
                    let index = chunk.code[offset + size + 1];
                    out.push_str(&format!(
                        "{:04}    |                     {} {}\n",
                        offset + size,
                        if is_local != 0 { "local" } else { "upvalue" },
                        index
                    ));
                    size += 2;
                }
            }
            size
        }
        _ => {
            out.push_str(&format!("{}\n", mnemonic(op)));
            1
        }
    };
    ((), size)
}

fn mnemonic(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "CONSTANT",
        OpCode::Nil => "NIL",
        OpCode::True => "TRUE",
        OpCode::False => "FALSE",
        OpCode::Pop => "POP",
        OpCode::GetLocal => "GET_LOCAL",
        OpCode::SetLocal => "SET_LOCAL",
        OpCode::GetGlobal => "GET_GLOBAL",
        OpCode::DefineGlobal => "DEFINE_GLOBAL",
        OpCode::SetGlobal => "SET_GLOBAL",
        OpCode::GetUpvalue => "GET_UPVALUE",
        OpCode::SetUpvalue => "SET_UPVALUE",
        OpCode::GetProperty => "GET_PROPERTY",
        OpCode::SetProperty => "SET_PROPERTY",
        OpCode::GetSuper => "GET_SUPER",
        OpCode::Equal => "EQUAL",
        OpCode::Greater => "GREATER",
        OpCode::Less => "LESS",
        OpCode::Add => "ADD",
        OpCode::Subtract => "SUBTRACT",
        OpCode::Multiply => "MULTIPLY",
        OpCode::Divide => "DIVIDE",
        OpCode::Not => "NOT",
        OpCode::Negate => "NEGATE",
        OpCode::Print => "PRINT",
        OpCode::Jump => "JUMP",
        OpCode::JumpIfFalse => "JUMP_IF_FALSE",
        OpCode::Loop => "LOOP",
        OpCode::Call => "CALL",
        OpCode::Invoke => "INVOKE",
        OpCode::SuperInvoke => "SUPER_INVOKE",
        OpCode::Closure => "CLOSURE",
        OpCode::CloseUpvalue => "CLOSE_UPVALUE",
        OpCode::Return => "RETURN",
        OpCode::Class => "CLASS",
        OpCode::Inherit => "INHERIT",
        OpCode::Method => "METHOD",
        OpCode::Array => "ARRAY",
        OpCode::GetIndex => "GET_INDEX",
        OpCode::SetIndex => "SET_INDEX",
        OpCode::Append => "APPEND",
    }
}
