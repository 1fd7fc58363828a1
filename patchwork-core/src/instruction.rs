use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity token of one instruction.
///
/// Positions shift whenever a body is edited, so instructions are only ever
/// compared across edits through their id. Ids come from a process-wide
/// counter, which lets freshly built instructions reference each other as
/// branch targets before they are spliced into a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u64);

impl InstrId {
    pub fn fresh() -> Self {
        InstrId(NEXT_INSTR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to a method by declaring type and overload signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub is_static: bool,
}

impl MethodRef {
    pub fn new(declaring_type: &str, name: &str) -> Self {
        MethodRef {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            params: Vec::new(),
            returns: None,
            is_static: false,
        }
    }

    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn returning(mut self, ty: &str) -> Self {
        self.returns = Some(ty.to_string());
        self
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Number of argument slots, counting the receiver of instance methods.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }

    pub fn returns_value(&self) -> bool {
        self.returns.is_some()
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.declaring_type,
            self.name,
            self.params.join(", ")
        )?;
        if let Some(ret) = &self.returns {
            write!(f, " -> {}", ret)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: String,
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
}

impl FieldRef {
    pub fn new(declaring_type: &str, name: &str) -> Self {
        FieldRef {
            declaring_type: declaring_type.to_string(),
            name: name.to_string(),
            is_static: false,
        }
    }

    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Nop,
    Pop,
    Dup,
    LoadConst,
    LoadArg,
    StoreArg,
    LoadLocal,
    StoreLocal,
    LoadField,
    StoreField,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Not,
    CompareEq,
    CompareLt,
    CompareGt,
    Branch,
    BranchIfTrue,
    BranchIfFalse,
    Return,
    Throw,
}

/// Operand shape an opcode requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Constant,
    Arg,
    Local,
    Field,
    Method,
    Target,
}

impl Opcode {
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Opcode::LoadConst => OperandKind::Constant,
            Opcode::LoadArg | Opcode::StoreArg => OperandKind::Arg,
            Opcode::LoadLocal | Opcode::StoreLocal => OperandKind::Local,
            Opcode::LoadField | Opcode::StoreField => OperandKind::Field,
            Opcode::Call => OperandKind::Method,
            Opcode::Branch | Opcode::BranchIfTrue | Opcode::BranchIfFalse => OperandKind::Target,
            _ => OperandKind::None,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Branch | Opcode::BranchIfTrue | Opcode::BranchIfFalse
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(self, Opcode::BranchIfTrue | Opcode::BranchIfFalse)
    }

    /// Control never continues to the next instruction.
    pub fn ends_flow(self) -> bool {
        matches!(self, Opcode::Branch | Opcode::Return | Opcode::Throw)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Nop => "nop",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::LoadConst => "ldc",
            Opcode::LoadArg => "ldarg",
            Opcode::StoreArg => "starg",
            Opcode::LoadLocal => "ldloc",
            Opcode::StoreLocal => "stloc",
            Opcode::LoadField => "ldfld",
            Opcode::StoreField => "stfld",
            Opcode::Call => "call",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::CompareEq => "ceq",
            Opcode::CompareLt => "clt",
            Opcode::CompareGt => "cgt",
            Opcode::Branch => "br",
            Opcode::BranchIfTrue => "brtrue",
            Opcode::BranchIfFalse => "brfalse",
            Opcode::Return => "ret",
            Opcode::Throw => "throw",
        };
        f.write_str(name)
    }
}

/// Constant payload of `LoadConst`. Also used as the runtime value handed to
/// hooks by hosts that execute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => f.write_str("null"),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(v) => write!(f, "{}", v),
            Constant::Str(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Const(Constant),
    Arg(u16),
    Local(u16),
    Field(FieldRef),
    Method(MethodRef),
    Target(InstrId),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Const(_) => OperandKind::Constant,
            Operand::Arg(_) => OperandKind::Arg,
            Operand::Local(_) => OperandKind::Local,
            Operand::Field(_) => OperandKind::Field,
            Operand::Method(_) => OperandKind::Method,
            Operand::Target(_) => OperandKind::Target,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: InstrId,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    /// Builds an instruction with a fresh id. The operand shape is not
    /// checked here; `MethodBody::verify` rejects mismatches.
    pub fn new(opcode: Opcode, operand: Operand) -> Self {
        Instruction {
            id: InstrId::fresh(),
            opcode,
            operand,
        }
    }

    /// Same opcode and operand under another identity.
    pub fn with_id(mut self, id: InstrId) -> Self {
        self.id = id;
        self
    }

    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Operand::None)
    }

    pub fn pop() -> Self {
        Self::new(Opcode::Pop, Operand::None)
    }

    pub fn dup() -> Self {
        Self::new(Opcode::Dup, Operand::None)
    }

    pub fn load_const(value: Constant) -> Self {
        Self::new(Opcode::LoadConst, Operand::Const(value))
    }

    pub fn load_int(value: i64) -> Self {
        Self::load_const(Constant::Int(value))
    }

    pub fn load_arg(index: u16) -> Self {
        Self::new(Opcode::LoadArg, Operand::Arg(index))
    }

    pub fn store_arg(index: u16) -> Self {
        Self::new(Opcode::StoreArg, Operand::Arg(index))
    }

    pub fn load_local(slot: u16) -> Self {
        Self::new(Opcode::LoadLocal, Operand::Local(slot))
    }

    pub fn store_local(slot: u16) -> Self {
        Self::new(Opcode::StoreLocal, Operand::Local(slot))
    }

    pub fn load_field(field: FieldRef) -> Self {
        Self::new(Opcode::LoadField, Operand::Field(field))
    }

    pub fn store_field(field: FieldRef) -> Self {
        Self::new(Opcode::StoreField, Operand::Field(field))
    }

    pub fn call(method: MethodRef) -> Self {
        Self::new(Opcode::Call, Operand::Method(method))
    }

    pub fn op(opcode: Opcode) -> Self {
        Self::new(opcode, Operand::None)
    }

    pub fn branch(target: InstrId) -> Self {
        Self::new(Opcode::Branch, Operand::Target(target))
    }

    pub fn branch_if_true(target: InstrId) -> Self {
        Self::new(Opcode::BranchIfTrue, Operand::Target(target))
    }

    pub fn branch_if_false(target: InstrId) -> Self {
        Self::new(Opcode::BranchIfFalse, Operand::Target(target))
    }

    pub fn ret() -> Self {
        Self::new(Opcode::Return, Operand::None)
    }

    pub fn target(&self) -> Option<InstrId> {
        match self.operand {
            Operand::Target(t) => Some(t),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&FieldRef> {
        match &self.operand {
            Operand::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&MethodRef> {
        match &self.operand {
            Operand::Method(m) => Some(m),
            _ => None,
        }
    }

    /// (pops, pushes) of this instruction. `returns_value` is the enclosing
    /// method's return shape, which decides what `Return` consumes.
    pub fn stack_effect(&self, returns_value: bool) -> (u32, u32) {
        match self.opcode {
            Opcode::Nop | Opcode::Branch => (0, 0),
            Opcode::Pop | Opcode::StoreArg | Opcode::StoreLocal => (1, 0),
            Opcode::Dup => (1, 2),
            Opcode::LoadConst | Opcode::LoadArg | Opcode::LoadLocal => (0, 1),
            Opcode::LoadField => match self.field() {
                Some(f) if f.is_static => (0, 1),
                _ => (1, 1),
            },
            Opcode::StoreField => match self.field() {
                Some(f) if f.is_static => (1, 0),
                _ => (2, 0),
            },
            Opcode::Call => match self.method() {
                Some(m) => (m.arg_count() as u32, u32::from(m.returns_value())),
                None => (0, 0),
            },
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::CompareEq
            | Opcode::CompareLt
            | Opcode::CompareGt => (2, 1),
            Opcode::Neg | Opcode::Not => (1, 1),
            Opcode::BranchIfTrue | Opcode::BranchIfFalse => (1, 0),
            Opcode::Return => (u32::from(returns_value), 0),
            Opcode::Throw => (1, 0),
        }
    }

    pub fn net_effect(&self, returns_value: bool) -> i64 {
        let (pops, pushes) = self.stack_effect(returns_value);
        i64::from(pushes) - i64::from(pops)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Const(c) => write!(f, " {}", c),
            Operand::Arg(i) => write!(f, " arg{}", i),
            Operand::Local(i) => write!(f, " loc{}", i),
            Operand::Field(field) => write!(f, " {}", field),
            Operand::Method(m) => write!(f, " {}", m),
            Operand::Target(t) => write!(f, " {}", t),
        }
    }
}

/// Net stack delta of a straight run of instructions.
pub fn region_delta(instrs: &[Instruction], returns_value: bool) -> i64 {
    instrs.iter().map(|i| i.net_effect(returns_value)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let a = Instruction::nop();
        let b = Instruction::nop();
        assert_ne!(a.id, b.id);
        assert_eq!(a.clone().with_id(b.id).id, b.id);
    }

    #[test]
    fn call_effect_follows_signature() {
        let instance = MethodRef::new("Body", "ApplyForce")
            .with_params(&["float", "float"])
            .returning("bool");
        assert_eq!(Instruction::call(instance).stack_effect(false), (3, 1));

        let stat = MethodRef::new("Mathf", "Clamp01")
            .with_params(&["float"])
            .returning("float")
            .static_method();
        assert_eq!(Instruction::call(stat).stack_effect(false), (1, 1));
    }

    #[test]
    fn field_effect_depends_on_static() {
        let inst = FieldRef::new("Pawn", "health");
        let stat = FieldRef::new("Game", "tick").static_field();
        assert_eq!(Instruction::load_field(inst.clone()).net_effect(false), 0);
        assert_eq!(Instruction::load_field(stat.clone()).net_effect(false), 1);
        assert_eq!(Instruction::store_field(inst).net_effect(false), -2);
        assert_eq!(Instruction::store_field(stat).net_effect(false), -1);
    }

    #[test]
    fn return_effect_depends_on_method_shape() {
        assert_eq!(Instruction::ret().stack_effect(true), (1, 0));
        assert_eq!(Instruction::ret().stack_effect(false), (0, 0));
    }

    #[test]
    fn region_delta_sums_net_effects() {
        let block = vec![
            Instruction::load_int(1),
            Instruction::load_int(2),
            Instruction::op(Opcode::Add),
        ];
        assert_eq!(region_delta(&block, false), 1);
    }

    #[test]
    fn displays_method_signature() {
        let m = MethodRef::new("Pawn", "Tick").with_params(&["int"]).returning("void");
        assert_eq!(m.to_string(), "Pawn::Tick(int) -> void");
    }
}
