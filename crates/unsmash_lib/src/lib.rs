
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Source,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: OutputMode,
    pub indent_step: usize,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: OutputMode::Source,
            indent_step: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum UnsmashError {
    #[error("unrecognized opcode 0x{opcode:02x} at offset {offset}")]
    UnrecognizedOpcode { opcode: u8, offset: usize },

    #[error("truncated instruction at offset {offset} (need {needed} operand bytes, {remaining} left)")]
    TruncatedInstruction { offset: usize, needed: usize, remaining: usize },

    #[error("constant index {0} out of range")]
    InvalidConstIndex(u16),

    #[error("name index {0} out of range")]
    InvalidNameIndex(u16),

    #[error("local index {0} out of range")]
    InvalidLocalIndex(u16),

    #[error("comparison operator index {0} out of range")]
    InvalidCompareOp(u16),

    #[error("unsupported opcode {name} at offset {offset} (operand {operand}; stack [{stack}])")]
    UnsupportedOpcode { name: &'static str, operand: String, offset: usize, stack: String },

    #[error("{name} at offset {offset} popped an empty expression stack")]
    StackUnderflow { name: &'static str, offset: usize },

    #[error("block close at offset {offset} with no open block")]
    OrphanBlockClose { offset: usize },
}

/// A constant-pool value, rendered back into source with repr-style quoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::None => write!(f, "None"),
            Const::Bool(true) => write!(f, "True"),
            Const::Bool(false) => write!(f, "False"),
            Const::Int(v) => write!(f, "{v}"),
            Const::Float(v) => write!(f, "{v:?}"),
            Const::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// One function's operand pools plus its raw bytecode string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    #[serde(default)]
    pub arg_count: u16,
    #[serde(default)]
    pub consts: Vec<Const>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub varnames: Vec<String>,
    pub code: Vec<u8>,
}

pub mod opcodes {
    pub const POP_TOP: u8 = 1;
    pub const ROT_TWO: u8 = 2;
    pub const DUP_TOP: u8 = 4;
    pub const BINARY_POWER: u8 = 19;
    pub const BINARY_MULTIPLY: u8 = 20;
    pub const BINARY_DIVIDE: u8 = 21;
    pub const BINARY_MODULO: u8 = 22;
    pub const BINARY_ADD: u8 = 23;
    pub const BINARY_SUBTRACT: u8 = 24;
    pub const BINARY_SUBSCR: u8 = 25;
    pub const STORE_MAP: u8 = 54;
    pub const INPLACE_ADD: u8 = 55;
    pub const INPLACE_SUBTRACT: u8 = 56;
    pub const INPLACE_MULTIPLY: u8 = 57;
    pub const INPLACE_DIVIDE: u8 = 58;
    pub const INPLACE_MODULO: u8 = 59;
    pub const INPLACE_POWER: u8 = 67;
    pub const PRINT_ITEM: u8 = 71;
    pub const PRINT_NEWLINE: u8 = 72;
    pub const RETURN_VALUE: u8 = 83;
    pub const POP_BLOCK: u8 = 87;
    pub const HAVE_ARGUMENT: u8 = 90;
    pub const STORE_GLOBAL: u8 = 97;
    pub const LOAD_CONST: u8 = 100;
    pub const BUILD_TUPLE: u8 = 102;
    pub const BUILD_LIST: u8 = 103;
    pub const BUILD_SET: u8 = 104;
    pub const BUILD_MAP: u8 = 105;
    pub const LOAD_ATTR: u8 = 106;
    pub const COMPARE_OP: u8 = 107;
    pub const JUMP_FORWARD: u8 = 110;
    pub const JUMP_ABSOLUTE: u8 = 113;
    pub const POP_JUMP_IF_FALSE: u8 = 114;
    pub const POP_JUMP_IF_TRUE: u8 = 115;
    pub const LOAD_GLOBAL: u8 = 116;
    pub const SETUP_LOOP: u8 = 120;
    pub const LOAD_FAST: u8 = 124;
    pub const STORE_FAST: u8 = 125;
    pub const CALL_FUNCTION: u8 = 131;
    pub const MAKE_FUNCTION: u8 = 132;

    pub const CMP_OPS: &[&str] = &[
        "<", "<=", "==", "!=", ">", ">=", "in", "not in", "is", "is not", "exception match",
        "BAD",
    ];
}

pub fn opcode_name(opcode: u8) -> &'static str {
    use opcodes::*;
    match opcode {
        POP_TOP => "POP_TOP",
        ROT_TWO => "ROT_TWO",
        DUP_TOP => "DUP_TOP",
        BINARY_POWER => "BINARY_POWER",
        BINARY_MULTIPLY => "BINARY_MULTIPLY",
        BINARY_DIVIDE => "BINARY_DIVIDE",
        BINARY_MODULO => "BINARY_MODULO",
        BINARY_ADD => "BINARY_ADD",
        BINARY_SUBTRACT => "BINARY_SUBTRACT",
        BINARY_SUBSCR => "BINARY_SUBSCR",
        STORE_MAP => "STORE_MAP",
        INPLACE_ADD => "INPLACE_ADD",
        INPLACE_SUBTRACT => "INPLACE_SUBTRACT",
        INPLACE_MULTIPLY => "INPLACE_MULTIPLY",
        INPLACE_DIVIDE => "INPLACE_DIVIDE",
        INPLACE_MODULO => "INPLACE_MODULO",
        INPLACE_POWER => "INPLACE_POWER",
        PRINT_ITEM => "PRINT_ITEM",
        PRINT_NEWLINE => "PRINT_NEWLINE",
        RETURN_VALUE => "RETURN_VALUE",
        POP_BLOCK => "POP_BLOCK",
        STORE_GLOBAL => "STORE_GLOBAL",
        LOAD_CONST => "LOAD_CONST",
        BUILD_TUPLE => "BUILD_TUPLE",
        BUILD_LIST => "BUILD_LIST",
        BUILD_SET => "BUILD_SET",
        BUILD_MAP => "BUILD_MAP",
        LOAD_ATTR => "LOAD_ATTR",
        COMPARE_OP => "COMPARE_OP",
        JUMP_FORWARD => "JUMP_FORWARD",
        JUMP_ABSOLUTE => "JUMP_ABSOLUTE",
        POP_JUMP_IF_FALSE => "POP_JUMP_IF_FALSE",
        POP_JUMP_IF_TRUE => "POP_JUMP_IF_TRUE",
        LOAD_GLOBAL => "LOAD_GLOBAL",
        SETUP_LOOP => "SETUP_LOOP",
        LOAD_FAST => "LOAD_FAST",
        STORE_FAST => "STORE_FAST",
        CALL_FUNCTION => "CALL_FUNCTION",
        MAKE_FUNCTION => "MAKE_FUNCTION",
        _ => "<invalid>",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Tuple,
    List,
    Set,
}

impl BuildKind {
    fn brackets(self) -> (&'static str, &'static str) {
        match self {
            BuildKind::Tuple => ("(", ")"),
            BuildKind::List => ("[", "]"),
            BuildKind::Set => ("{", "}"),
        }
    }
}

/// An opcode category with its operand resolved against the pools.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    LoadConst(Const),
    LoadFast(String),
    LoadGlobal(String),
    Binary(&'static str),
    InplaceBinary(&'static str),
    Compare(&'static str),
    Subscript,
    Build(BuildKind, u16),
    BuildMap(u16),
    StoreMap,
    LoadAttr(String),
    StoreFast(String),
    StoreGlobal(String),
    PopTop,
    Call { argc: u8, kwargc: u8 },
    PrintItem,
    PrintNewline,
    Return,
    JumpIfFalse(usize),
    JumpIfTrue(usize),
    JumpForward(usize),
    JumpAbsolute(usize),
    SetupLoop(usize),
    PopBlock,
    // Decoded for listings, outside the pseudo-source model.
    DupTop,
    RotTwo,
    MakeFunction(u16),
}

/// A decoded instruction. Jump operands are already absolute byte offsets.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub offset: usize,
    pub len: usize,
    pub opcode: u8,
    pub op: Op,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    pub fn annotation(&self) -> Option<String> {
        match &self.op {
            Op::LoadConst(c) => Some(format!("({c})")),
            Op::LoadFast(n)
            | Op::LoadGlobal(n)
            | Op::LoadAttr(n)
            | Op::StoreFast(n)
            | Op::StoreGlobal(n) => Some(format!("({n})")),
            Op::Compare(op) => Some(format!("({op})")),
            Op::JumpIfFalse(t)
            | Op::JumpIfTrue(t)
            | Op::JumpForward(t)
            | Op::JumpAbsolute(t)
            | Op::SetupLoop(t) => Some(format!("(to {t})")),
            Op::Build(_, n) | Op::BuildMap(n) => Some(format!("({n} items)")),
            Op::Call { argc, kwargc } => Some(format!("({argc} args, {kwargc} kwargs)")),
            Op::MakeFunction(n) => Some(format!("({n} defaults)")),
            _ => None,
        }
    }
}

fn const_at(code: &CodeObject, idx: u16) -> Result<Const, UnsmashError> {
    code.consts
        .get(idx as usize)
        .cloned()
        .ok_or(UnsmashError::InvalidConstIndex(idx))
}

fn name_at(code: &CodeObject, idx: u16) -> Result<String, UnsmashError> {
    code.names
        .get(idx as usize)
        .cloned()
        .ok_or(UnsmashError::InvalidNameIndex(idx))
}

fn local_at(code: &CodeObject, idx: u16) -> Result<String, UnsmashError> {
    code.varnames
        .get(idx as usize)
        .cloned()
        .ok_or(UnsmashError::InvalidLocalIndex(idx))
}

fn cmp_at(idx: u16) -> Result<&'static str, UnsmashError> {
    opcodes::CMP_OPS
        .get(idx as usize)
        .copied()
        .ok_or(UnsmashError::InvalidCompareOp(idx))
}

fn decode_op(code: &CodeObject, opcode: u8, arg: u16, offset: usize) -> Result<Op, UnsmashError> {
    use opcodes::*;
    let op = match opcode {
        POP_TOP => Op::PopTop,
        ROT_TWO => Op::RotTwo,
        DUP_TOP => Op::DupTop,
        BINARY_POWER => Op::Binary("**"),
        BINARY_MULTIPLY => Op::Binary("*"),
        BINARY_DIVIDE => Op::Binary("/"),
        BINARY_MODULO => Op::Binary("%"),
        BINARY_ADD => Op::Binary("+"),
        BINARY_SUBTRACT => Op::Binary("-"),
        BINARY_SUBSCR => Op::Subscript,
        STORE_MAP => Op::StoreMap,
        INPLACE_ADD => Op::InplaceBinary("+"),
        INPLACE_SUBTRACT => Op::InplaceBinary("-"),
        INPLACE_MULTIPLY => Op::InplaceBinary("*"),
        INPLACE_DIVIDE => Op::InplaceBinary("/"),
        INPLACE_MODULO => Op::InplaceBinary("%"),
        INPLACE_POWER => Op::InplaceBinary("**"),
        PRINT_ITEM => Op::PrintItem,
        PRINT_NEWLINE => Op::PrintNewline,
        RETURN_VALUE => Op::Return,
        POP_BLOCK => Op::PopBlock,
        STORE_GLOBAL => Op::StoreGlobal(name_at(code, arg)?),
        LOAD_CONST => Op::LoadConst(const_at(code, arg)?),
        BUILD_TUPLE => Op::Build(BuildKind::Tuple, arg),
        BUILD_LIST => Op::Build(BuildKind::List, arg),
        BUILD_SET => Op::Build(BuildKind::Set, arg),
        BUILD_MAP => Op::BuildMap(arg),
        LOAD_ATTR => Op::LoadAttr(name_at(code, arg)?),
        COMPARE_OP => Op::Compare(cmp_at(arg)?),
        JUMP_FORWARD => Op::JumpForward(offset + 3 + arg as usize),
        JUMP_ABSOLUTE => Op::JumpAbsolute(arg as usize),
        POP_JUMP_IF_FALSE => Op::JumpIfFalse(arg as usize),
        POP_JUMP_IF_TRUE => Op::JumpIfTrue(arg as usize),
        LOAD_GLOBAL => Op::LoadGlobal(name_at(code, arg)?),
        SETUP_LOOP => Op::SetupLoop(offset + 3 + arg as usize),
        LOAD_FAST => Op::LoadFast(local_at(code, arg)?),
        STORE_FAST => Op::StoreFast(local_at(code, arg)?),
        CALL_FUNCTION => Op::Call {
            argc: (arg & 0xff) as u8,
            kwargc: (arg >> 8) as u8,
        },
        MAKE_FUNCTION => Op::MakeFunction(arg),
        other => return Err(UnsmashError::UnrecognizedOpcode { opcode: other, offset }),
    };
    Ok(op)
}

/// Decode a code object's bytecode into instructions in program order,
/// resolving pool indices and relative jumps to absolute offsets.
pub fn decode_instructions(code: &CodeObject) -> Result<Vec<Instruction>, UnsmashError> {
    let bytes = &code.code;
    let mut out = Vec::new();
    let mut pc = 0usize;
    while pc < bytes.len() {
        let opcode = bytes[pc];
        let size = if opcode >= opcodes::HAVE_ARGUMENT { 3 } else { 1 };
        if bytes.len() - pc < size {
            return Err(UnsmashError::TruncatedInstruction {
                offset: pc,
                needed: size - 1,
                remaining: bytes.len() - pc - 1,
            });
        }
        let arg = if size == 3 {
            LittleEndian::read_u16(&bytes[pc + 1..pc + 3])
        } else {
            0
        };
        let op = decode_op(code, opcode, arg, pc)?;
        out.push(Instruction {
            offset: pc,
            len: size,
            opcode,
            op,
        });
        pc += size;
    }
    Ok(out)
}

/// A symbolic stack entry. Only `Literal` values re-quote when consumed;
/// names and computed expressions print verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum StackValue {
    Literal(Const),
    Rendered(String),
}

impl StackValue {
    /// Keyword-argument keys render as bare identifiers, never re-quoted.
    fn ident_text(&self) -> String {
        match self {
            StackValue::Literal(Const::Str(s)) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackValue::Literal(c) => write!(f, "{c}"),
            StackValue::Rendered(t) => write!(f, "{t}"),
        }
    }
}

pub type BlockId = usize;

/// A child of a block: a finished statement (token sequence, space-joined
/// on render) or a nested block.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Stmt(Vec<String>),
    Block(BlockId),
}

/// One lexical block of the reconstructed program. Children are owned by
/// the parent's node lists; `parent` is a handle used only while closing.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: Option<String>,
    pub is_loop: bool,
    pub parent: Option<BlockId>,
    pub body: Vec<Node>,
    pub else_body: Vec<Node>,
    in_else: bool,
    cond_pending: bool,
    exit_at: Option<usize>,
}

impl Block {
    fn new(header: Option<String>, is_loop: bool, parent: Option<BlockId>, cond_pending: bool) -> Self {
        Self {
            header,
            is_loop,
            parent,
            body: Vec::new(),
            else_body: Vec::new(),
            in_else: false,
            cond_pending,
            exit_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub indent: usize,
    pub text: String,
}

/// The finished block arena for one decompiled function. Index 0 is the root.
#[derive(Debug)]
pub struct BlockTree {
    pub blocks: Vec<Block>,
}

impl BlockTree {
    pub const ROOT: BlockId = 0;

    pub fn root(&self) -> &Block {
        &self.blocks[Self::ROOT]
    }

    /// Walk the tree depth-first into (absolute indent, text) lines.
    pub fn render(&self, indent_step: usize) -> Vec<SourceLine> {
        let mut lines = Vec::new();
        self.render_block(Self::ROOT, 0, indent_step, &mut lines);
        lines
    }

    fn render_block(&self, id: BlockId, indent: usize, step: usize, out: &mut Vec<SourceLine>) {
        let block = &self.blocks[id];
        let body_indent = match &block.header {
            Some(header) => {
                out.push(SourceLine { indent, text: header.clone() });
                indent + step
            }
            None => indent,
        };
        self.render_nodes(&block.body, body_indent, step, out);
        if block.body.is_empty() {
            // structured output needs a syntactically complete body
            out.push(SourceLine { indent: body_indent, text: "pass".into() });
        }
        if !block.else_body.is_empty() {
            out.push(SourceLine { indent, text: "else:".into() });
            self.render_nodes(&block.else_body, body_indent, step, out);
        }
    }

    fn render_nodes(&self, nodes: &[Node], indent: usize, step: usize, out: &mut Vec<SourceLine>) {
        for node in nodes {
            match node {
                Node::Stmt(tokens) => out.push(SourceLine { indent, text: tokens.join(" ") }),
                Node::Block(id) => self.render_block(*id, indent, step, out),
            }
        }
    }
}

fn remove_first(set: &mut Vec<usize>, value: usize) {
    if let Some(i) = set.iter().position(|&t| t == value) {
        set.remove(i);
    }
}

struct DecompileSession {
    stack: Vec<StackValue>,
    print_buffer: Vec<String>,
    tree: BlockTree,
    focus: BlockId,
    dedent_at: Vec<usize>,
    else_at: Vec<usize>,
    last_closed: Option<BlockId>,
    forward_landing: Option<usize>,
}

impl DecompileSession {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            print_buffer: Vec::new(),
            tree: BlockTree {
                blocks: vec![Block::new(None, false, None, false)],
            },
            focus: BlockTree::ROOT,
            dedent_at: Vec::new(),
            else_at: Vec::new(),
            last_closed: None,
            forward_landing: None,
        }
    }

    fn push(&mut self, value: StackValue) {
        self.stack.push(value);
    }

    fn pop(&mut self, ins: &Instruction) -> Result<StackValue, UnsmashError> {
        self.stack.pop().ok_or(UnsmashError::StackUnderflow {
            name: ins.name(),
            offset: ins.offset,
        })
    }

    fn emit(&mut self, tokens: Vec<String>) {
        let block = &mut self.tree.blocks[self.focus];
        if block.in_else {
            block.else_body.push(Node::Stmt(tokens));
        } else {
            block.body.push(Node::Stmt(tokens));
        }
    }

    fn open_block(&mut self, header: Option<String>, is_loop: bool, cond_pending: bool) -> BlockId {
        let id = self.tree.blocks.len();
        self.tree
            .blocks
            .push(Block::new(header, is_loop, Some(self.focus), cond_pending));
        let parent = &mut self.tree.blocks[self.focus];
        if parent.in_else {
            parent.else_body.push(Node::Block(id));
        } else {
            parent.body.push(Node::Block(id));
        }
        self.focus = id;
        id
    }

    fn close_block(&mut self, offset: usize) -> Result<BlockId, UnsmashError> {
        let parent = self.tree.blocks[self.focus]
            .parent
            .ok_or(UnsmashError::OrphanBlockClose { offset })?;
        let closed = self.focus;
        self.focus = parent;
        self.last_closed = Some(closed);
        Ok(closed)
    }

    /// Fire every recorded offset event at or before `offset`. All dedents
    /// fire before any else toggle.
    fn fire_events(&mut self, offset: usize) -> Result<(), UnsmashError> {
        let (fire, keep): (Vec<usize>, Vec<usize>) =
            self.dedent_at.iter().copied().partition(|&t| t <= offset);
        self.dedent_at = keep;
        for _ in &fire {
            self.close_block(offset)?;
        }

        let (fire, keep): (Vec<usize>, Vec<usize>) =
            self.else_at.iter().copied().partition(|&t| t <= offset);
        self.else_at = keep;
        for target in fire {
            // An else branch only exists when the true branch ended by
            // jumping over it; a plain if falls through, and the toggle
            // must not capture the statements after the block.
            if self.forward_landing != Some(target) {
                continue;
            }
            if let Some(block) = self.last_closed {
                self.tree.blocks[block].in_else = true;
                self.focus = block;
            }
        }
        Ok(())
    }

    fn open_conditional(&mut self, ins: &Instruction, target: usize, negate: bool) -> Result<(), UnsmashError> {
        let test = self.pop(ins)?.to_string();
        let test = if negate { format!("not ({test})") } else { test };
        let focused = &mut self.tree.blocks[self.focus];
        let as_loop = focused.is_loop && focused.cond_pending;
        if as_loop {
            focused.cond_pending = false;
        }
        let header = if as_loop {
            format!("while {test}:")
        } else {
            format!("if {test}:")
        };
        let id = self.open_block(Some(header), as_loop, false);
        if as_loop {
            self.tree.blocks[id].exit_at = Some(target);
        }
        self.dedent_at.push(target);
        self.else_at.push(target);
        Ok(())
    }

    fn unsupported(&self, ins: &Instruction) -> UnsmashError {
        UnsmashError::UnsupportedOpcode {
            name: ins.name(),
            operand: ins.annotation().unwrap_or_else(|| "none".into()),
            offset: ins.offset,
            stack: self
                .stack
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn step(&mut self, ins: &Instruction) -> Result<(), UnsmashError> {
        match &ins.op {
            Op::LoadConst(c) => self.push(StackValue::Literal(c.clone())),
            Op::LoadFast(name) | Op::LoadGlobal(name) => self.push(StackValue::Rendered(name.clone())),
            Op::Binary(op) | Op::InplaceBinary(op) | Op::Compare(op) => {
                let rhs = self.pop(ins)?;
                let lhs = self.pop(ins)?;
                self.push(StackValue::Rendered(format!("{lhs} {op} {rhs}")));
            }
            Op::Subscript => {
                let index = self.pop(ins)?;
                let container = self.pop(ins)?;
                self.push(StackValue::Rendered(format!("{container}[{index}]")));
            }
            Op::Build(kind, count) => {
                let mut items = Vec::with_capacity(*count as usize);
                for _ in 0..*count {
                    items.push(self.pop(ins)?.to_string());
                }
                items.reverse();
                let (open, close) = kind.brackets();
                self.push(StackValue::Rendered(format!("{open}{}{close}", items.join(", "))));
            }
            Op::BuildMap(_) => self.push(StackValue::Rendered("{}".into())),
            Op::StoreMap => {
                let value = self.pop(ins)?;
                let key = self.pop(ins)?;
                let map = self.pop(ins)?.to_string();
                let pair = format!("{key}: {value}");
                let text = if map == "{}" {
                    format!("{{{pair}}}")
                } else {
                    format!("{}, {pair}}}", &map[..map.len() - 1])
                };
                self.push(StackValue::Rendered(text));
            }
            Op::LoadAttr(attr) => {
                let object = self.pop(ins)?;
                self.push(StackValue::Rendered(format!("{object}.{attr}")));
            }
            Op::StoreFast(name) | Op::StoreGlobal(name) => {
                let value = self.pop(ins)?;
                self.emit(vec![name.clone(), "=".into(), value.to_string()]);
            }
            Op::PopTop => {
                let value = self.pop(ins)?;
                self.emit(vec![value.to_string()]);
            }
            Op::Call { argc, kwargc } => {
                let mut args = Vec::with_capacity(*argc as usize + *kwargc as usize);
                for _ in 0..*kwargc {
                    let value = self.pop(ins)?;
                    let key = self.pop(ins)?;
                    args.push(format!("{}={value}", key.ident_text()));
                }
                for _ in 0..*argc {
                    args.push(self.pop(ins)?.to_string());
                }
                args.reverse();
                let callee = self.pop(ins)?;
                self.push(StackValue::Rendered(format!("{callee}({})", args.join(", "))));
            }
            Op::PrintItem => {
                let value = self.pop(ins)?;
                self.print_buffer.push(value.to_string());
            }
            Op::PrintNewline => {
                let items = std::mem::take(&mut self.print_buffer);
                if items.is_empty() {
                    self.emit(vec!["print".into()]);
                } else {
                    self.emit(vec!["print".into(), items.join(", ")]);
                }
            }
            Op::Return => {
                let value = self.pop(ins)?;
                self.emit(vec!["return".into(), value.to_string()]);
            }
            Op::JumpIfFalse(target) => self.open_conditional(ins, *target, false)?,
            Op::JumpIfTrue(target) => self.open_conditional(ins, *target, true)?,
            Op::JumpForward(target) => {
                self.dedent_at.push(*target);
            }
            Op::JumpAbsolute(_) => {
                // Backward jump: the loop body ends here. The loop exit is
                // settled by the paired POP_BLOCK, so drop the events the
                // while condition registered.
                let closed = self.close_block(ins.offset)?;
                if let Some(exit) = self.tree.blocks[closed].exit_at {
                    remove_first(&mut self.dedent_at, exit);
                    remove_first(&mut self.else_at, exit);
                }
            }
            Op::SetupLoop(_) => {
                self.open_block(None, true, true);
            }
            Op::PopBlock => {
                self.close_block(ins.offset)?;
            }
            Op::DupTop | Op::RotTwo | Op::MakeFunction(_) => return Err(self.unsupported(ins)),
        }
        self.forward_landing = match ins.op {
            Op::JumpForward(_) => Some(ins.offset + ins.len),
            _ => None,
        };
        Ok(())
    }
}

/// Run the expression-stack interpreter and control-flow structurer over a
/// decoded instruction sequence. Offsets must be strictly increasing.
pub fn decompile_instructions(instrs: &[Instruction]) -> Result<BlockTree, UnsmashError> {
    let mut session = DecompileSession::new();
    for ins in instrs {
        session.fire_events(ins.offset)?;
        trace!(offset = ins.offset, opcode = ins.name(), stack = ?session.stack, "interpret");
        session.step(ins)?;
    }
    let end = instrs.last().map(|i| i.offset + i.len).unwrap_or(0);
    session.fire_events(end)?;
    Ok(session.tree)
}

/// Decompile to a `def name(args):` function body.
pub fn decompile_function(code: &CodeObject, options: DecompileOptions) -> Result<String, UnsmashError> {
    let instrs = decode_instructions(code)?;
    let tree = decompile_instructions(&instrs)?;
    let params = code
        .varnames
        .iter()
        .take(code.arg_count as usize)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!("def {}({params}):\n", code.name);
    for line in tree.render(options.indent_step) {
        out.push_str(&" ".repeat(options.indent_step + line.indent));
        out.push_str(&line.text);
        out.push('\n');
    }
    Ok(out)
}

/// Produce a disassembly listing, one line per instruction.
pub fn disassemble(code: &CodeObject) -> Result<String, UnsmashError> {
    let instrs = decode_instructions(code)?;
    let mut out = String::new();
    for ins in &instrs {
        out.push_str(&format!("{:>20} {:>4}", ins.name(), ins.offset));
        if let Some(note) = ins.annotation() {
            out.push(' ');
            out.push_str(&note);
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn decompile_with_options(code: &CodeObject, options: DecompileOptions) -> Result<String, UnsmashError> {
    match options.mode {
        OutputMode::Source => decompile_function(code, options),
        OutputMode::Disasm => disassemble(code),
    }
}

pub fn decompile(code: &CodeObject) -> Result<String, UnsmashError> {
    decompile_with_options(code, DecompileOptions::default())
}
