// Module inspector: print a .dsb file's header, tables, and a
// disassembly listing.

use std::env::args;
use std::fs;

use dialos::module::Module;
use dialos::natives::NativeCall;
use dialos::opcode::{Op, Operands};

fn main() {
    let path = args().nth(1).expect("usage: dsbdump <file.dsb>");
    let bytes = fs::read(&path).expect("couldn't read module");
    let module = match Module::load(&bytes) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("{}: rejected: {:?}", path, e);
            std::process::exit(1);
        }
    };

    let m = &module.metadata;
    println!("{} v{} by {}", m.app_name, m.app_version, m.author);
    println!("  version {}  flags {:#06x}  heap {} bytes  timestamp {}",
             module.version, module.flags, m.heap_size, m.timestamp);
    println!("  checksum {:#06x}  hash {:#010x}", m.checksum, m.hash_code);

    println!("constants ({}):", module.constants.len());
    for (i, c) in module.constants.iter().enumerate() {
        println!("  [{}] {:?}", i, c);
    }
    println!("globals ({}):", module.globals.len());
    for (i, g) in module.globals.iter().enumerate() {
        println!("  [{}] {}", i, g);
    }
    println!("functions ({}):", module.functions.len());
    for (i, f) in module.functions.iter().enumerate() {
        println!("  [{}] {}/{} @ {:#06x}", i, f.name, f.param_count, f.entry_pc);
    }

    println!("code ({} bytes, entry {:#06x}):",
             module.code.len(), module.main_entry_point);
    disassemble(&module);
}

fn disassemble(module: &Module) {
    let code = &module.code;
    let mut pc = 0;
    while pc < code.len() {
        let line = module.source_line(pc);
        let prefix = if module.has_debug_info() {
            format!("{:4} ", line)
        } else {
            String::new()
        };
        let op = match Op::from_u8(code[pc]) {
            Some(op) => op,
            None => {
                println!("{}{:06x}  .db {:#04x}", prefix, pc, code[pc]);
                pc += 1;
                continue;
            }
        };
        let operands = op.operands();
        let width = operands.width();
        if pc + 1 + width > code.len() {
            println!("{}{:06x}  {:?} <truncated>", prefix, pc, op);
            return;
        }
        let raw = &code[pc + 1..pc + 1 + width];
        println!("{}{:06x}  {:?}{}", prefix, pc, op,
                 operand_text(op, raw, pc + 1 + width));
        pc += 1 + width;
    }
}

fn operand_text(op: Op, raw: &[u8], next_pc: usize) -> String {
    match op.operands() {
        Operands::None => String::new(),
        Operands::I8 => format!(" {}", raw[0] as i8),
        Operands::U8 => format!(" {}", raw[0]),
        Operands::I16 => format!(" {}", i16::from_le_bytes([raw[0], raw[1]])),
        Operands::U16 => format!(" {}", u16::from_le_bytes([raw[0], raw[1]])),
        Operands::I32 => format!(
            " {}",
            i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
        ),
        Operands::F32 => format!(
            " {}",
            f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
        ),
        Operands::Rel32 => {
            let offset = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let target = next_pc as i64 + offset as i64;
            format!(" {:+} -> {:#06x}", offset, target)
        },
        Operands::CallTarget => {
            let index = u16::from_le_bytes([raw[0], raw[1]]);
            let argc = raw[2];
            // CALL_NATIVE operands name a platform entry point
            if op == Op::CallNative {
                if let Some(call) = NativeCall::from_u16(index) {
                    return format!(" {} ({}), argc {}", index, call.name(), argc);
                }
            }
            format!(" {}, argc {}", index, argc)
        },
        Operands::MethodTarget => {
            let argc = raw[0];
            let name = u16::from_le_bytes([raw[1], raw[2]]);
            format!(" argc {}, name [{}]", argc, name)
        },
    }
}
