use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::instruction::{
    Constant, FieldRef, InstrId, Instruction, MethodRef, Opcode, Operand, OperandKind,
};

/// Errors raised while building, serializing or verifying a method body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BodyError {
    #[error("instruction {index}: branch target index {target} is outside the body ({len} instructions)")]
    TargetOutOfRange {
        index: usize,
        target: usize,
        len: usize,
    },

    #[error("instruction {from} branches to {to}, which is not in the body")]
    DanglingTarget { from: InstrId, to: InstrId },

    #[error("instruction id {0} appears more than once")]
    DuplicateId(InstrId),

    #[error("instruction {index} ({opcode}): expected {expected:?} operand, got {got:?}")]
    OperandMismatch {
        index: usize,
        opcode: Opcode,
        expected: OperandKind,
        got: OperandKind,
    },

    #[error("instruction {index}: local slot {slot} is not declared ({declared} locals)")]
    InvalidLocal {
        index: usize,
        slot: u16,
        declared: usize,
    },

    #[error("instruction {index}: argument {arg} out of range ({count} arguments)")]
    InvalidArg { index: usize, arg: u16, count: usize },

    #[error("instruction {index}: stack underflow (depth {depth}, pops {pops})")]
    StackUnderflow { index: usize, depth: u32, pops: u32 },

    #[error("instruction {index}: reached with depth {found}, expected {expected}")]
    InconsistentDepth {
        index: usize,
        expected: u32,
        found: u32,
    },

    #[error("instruction {index}: return leaves {depth} values on the stack")]
    UnbalancedExit { index: usize, depth: u32 },

    #[error("control falls off the end of the body")]
    FallsOffEnd,

    #[error("body is empty")]
    Empty,
}

/// Host-installable operand: branch targets are plain instruction indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawOperand {
    Const(Constant),
    Arg(u16),
    Local(u16),
    Field(FieldRef),
    Method(MethodRef),
    Target(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInstruction {
    pub opcode: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<RawOperand>,
}

impl RawInstruction {
    pub fn new(opcode: Opcode, operand: Option<RawOperand>) -> Self {
        RawInstruction { opcode, operand }
    }
}

/// The compiled form of a method as the host reads and installs it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMethodBody {
    #[serde(default)]
    pub locals: Vec<String>,
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    pub index: u16,
    pub ty: String,
}

/// Result of the stack-depth flow analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackProfile {
    /// Depth on entry to each instruction; `None` for unreachable code.
    pub entry_depths: Vec<Option<u32>>,
    pub max_depth: u32,
}

impl StackProfile {
    pub fn is_reachable(&self, index: usize) -> bool {
        matches!(self.entry_depths.get(index), Some(Some(_)))
    }
}

/// Editable method body: instructions addressed by identity, declared
/// locals, and the signature that fixes argument count and return shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    signature: MethodRef,
    instructions: Vec<Instruction>,
    locals: Vec<LocalSlot>,
}

impl MethodBody {
    pub fn new(signature: MethodRef, instructions: Vec<Instruction>) -> Self {
        MethodBody {
            signature,
            instructions,
            locals: Vec::new(),
        }
    }

    /// Reads a host body, giving every instruction a fresh identity.
    pub fn from_raw(signature: MethodRef, raw: &RawMethodBody) -> Result<Self, BodyError> {
        let len = raw.instructions.len();
        let ids: Vec<InstrId> = (0..len).map(|_| InstrId::fresh()).collect();

        let mut instructions = Vec::with_capacity(len);
        for (index, ri) in raw.instructions.iter().enumerate() {
            let operand = match &ri.operand {
                None => Operand::None,
                Some(RawOperand::Const(c)) => Operand::Const(c.clone()),
                Some(RawOperand::Arg(a)) => Operand::Arg(*a),
                Some(RawOperand::Local(l)) => Operand::Local(*l),
                Some(RawOperand::Field(f)) => Operand::Field(f.clone()),
                Some(RawOperand::Method(m)) => Operand::Method(m.clone()),
                Some(RawOperand::Target(t)) => {
                    let target = *ids
                        .get(*t)
                        .ok_or(BodyError::TargetOutOfRange { index, target: *t, len })?;
                    Operand::Target(target)
                }
            };
            instructions.push(Instruction {
                id: ids[index],
                opcode: ri.opcode,
                operand,
            });
        }

        let mut body = MethodBody::new(signature, instructions);
        for ty in &raw.locals {
            body.add_local(ty);
        }
        Ok(body)
    }

    /// Serializes back to index form. Fails instead of emitting a body whose
    /// branches point nowhere.
    pub fn to_raw(&self) -> Result<RawMethodBody, BodyError> {
        let positions = self.position_map()?;
        let mut instructions = Vec::with_capacity(self.instructions.len());
        for instr in &self.instructions {
            let operand = match &instr.operand {
                Operand::None => None,
                Operand::Const(c) => Some(RawOperand::Const(c.clone())),
                Operand::Arg(a) => Some(RawOperand::Arg(*a)),
                Operand::Local(l) => Some(RawOperand::Local(*l)),
                Operand::Field(f) => Some(RawOperand::Field(f.clone())),
                Operand::Method(m) => Some(RawOperand::Method(m.clone())),
                Operand::Target(t) => {
                    let pos = positions.get(t).ok_or(BodyError::DanglingTarget {
                        from: instr.id,
                        to: *t,
                    })?;
                    Some(RawOperand::Target(*pos))
                }
            };
            instructions.push(RawInstruction::new(instr.opcode, operand));
        }

        Ok(RawMethodBody {
            locals: self.locals.iter().map(|l| l.ty.clone()).collect(),
            instructions,
        })
    }

    pub fn signature(&self) -> &MethodRef {
        &self.signature
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn locals(&self) -> &[LocalSlot] {
        &self.locals
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn returns_value(&self) -> bool {
        self.signature.returns_value()
    }

    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    pub fn get(&self, id: InstrId) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    /// Declares a new local slot and returns its index. Slots are appended,
    /// so rewrites applied one after another never collide.
    pub fn add_local(&mut self, ty: &str) -> u16 {
        let index = self.locals.len() as u16;
        self.locals.push(LocalSlot {
            index,
            ty: ty.to_string(),
        });
        index
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    fn position_map(&self) -> Result<HashMap<InstrId, usize>, BodyError> {
        let mut map = HashMap::with_capacity(self.instructions.len());
        for (pos, instr) in self.instructions.iter().enumerate() {
            if map.insert(instr.id, pos).is_some() {
                return Err(BodyError::DuplicateId(instr.id));
            }
        }
        Ok(map)
    }

    /// Every branch target names an instruction still in the body.
    pub fn check_targets(&self) -> Result<(), BodyError> {
        let ids: HashSet<InstrId> = self.instructions.iter().map(|i| i.id).collect();
        if ids.len() != self.instructions.len() {
            // position_map names the offending id
            self.position_map()?;
        }
        for instr in &self.instructions {
            if let Some(t) = instr.target() {
                if !ids.contains(&t) {
                    return Err(BodyError::DanglingTarget {
                        from: instr.id,
                        to: t,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_operands(&self) -> Result<(), BodyError> {
        let arg_count = self.signature.arg_count();
        for (index, instr) in self.instructions.iter().enumerate() {
            let expected = instr.opcode.operand_kind();
            let got = instr.operand.kind();
            if expected != got {
                return Err(BodyError::OperandMismatch {
                    index,
                    opcode: instr.opcode,
                    expected,
                    got,
                });
            }
            match instr.operand {
                Operand::Local(slot) if usize::from(slot) >= self.locals.len() => {
                    return Err(BodyError::InvalidLocal {
                        index,
                        slot,
                        declared: self.locals.len(),
                    });
                }
                Operand::Arg(arg) if usize::from(arg) >= arg_count => {
                    return Err(BodyError::InvalidArg {
                        index,
                        arg,
                        count: arg_count,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Full structural check: operand shapes, local and argument indices,
    /// branch identities, and the stack-depth flow analysis.
    ///
    /// The analysis walks every reachable path from the entry at depth 0.
    /// Depth may never go negative, every instruction must be reached at a
    /// single depth, and every `Return` must leave the stack empty once the
    /// return value (if any) is consumed.
    pub fn verify(&self) -> Result<StackProfile, BodyError> {
        if self.instructions.is_empty() {
            return Err(BodyError::Empty);
        }
        self.check_operands()?;
        self.check_targets()?;

        let positions = self.position_map()?;
        let returns_value = self.returns_value();
        let len = self.instructions.len();
        let mut entry_depths: Vec<Option<u32>> = vec![None; len];
        let mut max_depth = 0u32;
        let mut worklist = vec![(0usize, 0u32)];

        while let Some((index, depth)) = worklist.pop() {
            if index >= len {
                return Err(BodyError::FallsOffEnd);
            }
            match entry_depths[index] {
                Some(seen) if seen == depth => continue,
                Some(seen) => {
                    return Err(BodyError::InconsistentDepth {
                        index,
                        expected: seen,
                        found: depth,
                    })
                }
                None => entry_depths[index] = Some(depth),
            }

            let instr = &self.instructions[index];
            let (pops, pushes) = instr.stack_effect(returns_value);
            if depth < pops {
                return Err(BodyError::StackUnderflow { index, depth, pops });
            }
            let after = depth - pops + pushes;
            max_depth = max_depth.max(depth).max(after);

            if instr.opcode == Opcode::Return && after != 0 {
                return Err(BodyError::UnbalancedExit {
                    index,
                    depth: after,
                });
            }

            if let Some(t) = instr.target() {
                // check_targets already proved the id is present
                if let Some(&pos) = positions.get(&t) {
                    worklist.push((pos, after));
                }
            }
            if !instr.opcode.ends_flow() {
                worklist.push((index + 1, after));
            }
        }

        Ok(StackProfile {
            entry_depths,
            max_depth,
        })
    }
}
