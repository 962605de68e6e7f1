//! Property-based tests for the encoder and the code generator
//!
//! These tests use proptest to check that:
//! 1. Immediate splitting reconstructs every 32 bit value exactly
//! 2. Encoded fields read back as the operands they were built from
//! 3. Variable length pulses never run past the next instruction
//! 4. Parallel recordings only conflict when their parameters differ

use proptest::prelude::*;
use qicode::compiler::instruction::{fits_lower_immediate, split_immediate, AluOp, Instruction};
use qicode::{CompileOptions, Compiler, Error, ParameterTable, ProgramBuilder, Pulse, Recording};
use std::sync::{Mutex, MutexGuard, PoisonError};

static SERIAL: Mutex<()> = Mutex::new(());

/// Only one program can be under construction in the process
fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// STRATEGY GENERATORS
// =============================================================================

/// A pulse length either fixed or taken from a variable
#[derive(Debug, Clone)]
enum Length {
    Fixed(u32),
    Variable(u32),
}

fn length() -> impl Strategy<Value = Length> {
    prop_oneof![
        (1u32..64).prop_map(Length::Fixed),
        (2u32..64).prop_map(Length::Variable),
    ]
}

fn sign_extend_12(value: u32) -> i64 {
    let value = (value & 0xFFF) as i64;
    if value & 0x800 != 0 {
        value - 0x1000
    } else {
        value
    }
}

// =============================================================================
// ENCODER
// =============================================================================

proptest! {
    #[test]
    fn split_immediate_is_exact(value in i32::MIN as i64..=i32::MAX as i64) {
        let (upper, lower) = split_immediate(value);
        prop_assert!(fits_lower_immediate(lower));
        prop_assert_eq!(upper & 0xFFF, 0);
        let rebuilt = (upper as i32 as i64).wrapping_add(lower) as i32;
        prop_assert_eq!(rebuilt as i64, value);
    }

    #[test]
    fn split_immediate_covers_unsigned_words(value in 0i64..(1i64 << 32)) {
        let (upper, lower) = split_immediate(value);
        let rebuilt = (upper as i64 + lower) & 0xFFFF_FFFF;
        prop_assert_eq!(rebuilt, value);
    }

    #[test]
    fn addi_fields_read_back(dst in 0u8..32, src in 0u8..32, imm in -2048i64..2048) {
        let word = Instruction::reg_imm(AluOp::Add, dst, src, imm).encode().unwrap();
        prop_assert_eq!(word & 0x7F, 0b0010011);
        prop_assert_eq!(((word >> 7) & 0x1F) as u8, dst);
        prop_assert_eq!(((word >> 15) & 0x1F) as u8, src);
        prop_assert_eq!(sign_extend_12(word >> 20), imm);
    }

    #[test]
    fn jump_range_is_enforced(offset in -(1i32 << 20)..(1i32 << 20)) {
        let result = Instruction::jump(offset).encode();
        let fits = (-(1i32 << 19)..(1i32 << 19)).contains(&offset);
        prop_assert_eq!(result.is_ok(), fits);
    }
}

// =============================================================================
// CODE GENERATION
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn variable_pulses_are_always_choked(lengths in prop::collection::vec(length(), 1..8)) {
        let _serial = serial();
        let mut p = ProgramBuilder::new("chokes").unwrap();
        let q = p.cell();
        for (n, length) in lengths.iter().enumerate() {
            match length {
                Length::Fixed(cycles) => p.play(q, &Pulse::new(*cycles as f64 * 4e-9)),
                Length::Variable(cycles) => {
                    let t = p.time_var(&format!("t{}", n), Some(*cycles as f64 * 4e-9));
                    p.play_readout(q, &Pulse::new(&t));
                }
            }
        }
        let program = p.finish().unwrap();
        let compiled = Compiler::new(CompileOptions::default())
            .compile(&program, &ParameterTable::new())
            .unwrap();

        let mnemonics = &compiled.cells[0].mnemonics;
        for (pc, mnemonic) in mnemonics.iter().enumerate() {
            if mnemonic.starts_with("twr") {
                prop_assert!(mnemonics[pc + 1].starts_with("tr "));
            }
        }
        prop_assert_eq!(mnemonics.last().map(String::as_str), Some("end"));
    }

    #[test]
    fn parallel_recordings_conflict_only_when_different(
        first in 1u32..50,
        second in 1u32..50,
    ) {
        let _serial = serial();
        let mut p = ProgramBuilder::new("parallel").unwrap();
        let q = p.cell();
        {
            let mut branch = p.parallel().unwrap();
            branch.record(q, Recording::new(400e-9).offset(first as f64 * 4e-9));
        }
        let result = {
            let mut branch = p.parallel().unwrap();
            branch.wait(q, 800e-9);
            branch.record(q, Recording::new(400e-9).offset(second as f64 * 4e-9));
            branch.end()
        };
        drop(p);

        if first == second {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(matches!(result, Err(Error::StructuralError(_))));
        }
    }
}
