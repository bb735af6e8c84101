use unsmash_lib::opcodes::*;
use unsmash_lib::{Const, UnsmashError, decode_instructions, decompile_instructions};

mod common;
use common::{code, l, lines};

#[test]
fn straight_line_code_renders_flat() {
    // x = 1 + 2; return x
    let code = code(
        vec![Const::Int(1), Const::Int(2)],
        vec![],
        vec!["x"],
        vec![
            LOAD_CONST, 0, 0,
            LOAD_CONST, 1, 0,
            BINARY_ADD,
            STORE_FAST, 0, 0,
            LOAD_FAST, 0, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(lines(&code), vec![l(0, "x = 1 + 2"), l(0, "return x")]);
}

#[test]
fn if_without_else_keeps_the_tail_flat() {
    let code = code(
        vec![Const::Int(1), Const::None],
        vec![],
        vec!["a", "b"],
        vec![
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 12, 0,
            LOAD_CONST, 0, 0,
            STORE_FAST, 1, 0,
            LOAD_CONST, 1, 0,
            RETURN_VALUE,
        ],
    );
    let out = lines(&code);
    assert_eq!(out, vec![l(0, "if a:"), l(4, "b = 1"), l(0, "return None")]);
    assert!(
        !out.iter().any(|(_, text)| text == "else:"),
        "a fall-through if must not grow an else branch"
    );
}

#[test]
fn if_else_renders_both_branches() {
    let code = code(
        vec![Const::Int(1), Const::Int(2), Const::None],
        vec![],
        vec!["a", "b"],
        vec![
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 15, 0,
            LOAD_CONST, 0, 0,
            STORE_FAST, 1, 0,
            JUMP_FORWARD, 6, 0,
            LOAD_CONST, 1, 0,
            STORE_FAST, 1, 0,
            LOAD_CONST, 2, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(
        lines(&code),
        vec![
            l(0, "if a:"),
            l(4, "b = 1"),
            l(0, "else:"),
            l(4, "b = 2"),
            l(0, "return None"),
        ]
    );
}

#[test]
fn while_loop_uses_a_while_header() {
    // while a: a = a - 1
    let code = code(
        vec![Const::Int(1), Const::None],
        vec![],
        vec!["a"],
        vec![
            SETUP_LOOP, 20, 0,
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 22, 0,
            LOAD_FAST, 0, 0,
            LOAD_CONST, 0, 0,
            BINARY_SUBTRACT,
            STORE_FAST, 0, 0,
            JUMP_ABSOLUTE, 3, 0,
            POP_BLOCK,
            LOAD_CONST, 1, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(
        lines(&code),
        vec![l(0, "while a:"), l(4, "a = a - 1"), l(0, "return None")]
    );
}

#[test]
fn while_block_carries_the_loop_flag() {
    let code = code(
        vec![Const::None],
        vec![],
        vec!["a"],
        vec![
            SETUP_LOOP, 14, 0,
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 16, 0,
            LOAD_FAST, 0, 0,
            POP_TOP,
            JUMP_ABSOLUTE, 3, 0,
            POP_BLOCK,
            LOAD_CONST, 0, 0,
            RETURN_VALUE,
        ],
    );
    let instrs = decode_instructions(&code).unwrap();
    let tree = decompile_instructions(&instrs).unwrap();
    assert!(tree.root().header.is_none());
    assert!(
        tree.blocks
            .iter()
            .any(|b| b.is_loop && b.header.as_deref() == Some("while a:")),
        "expected a loop-flagged while block, got {:?}",
        tree.blocks.iter().map(|b| &b.header).collect::<Vec<_>>()
    );
}

#[test]
fn nested_conditionals_dedent_back_to_root() {
    // five nested `if a:` levels, all jumping to the common end
    let mut bytes = Vec::new();
    for _ in 0..5 {
        bytes.extend_from_slice(&[LOAD_FAST, 0, 0, POP_JUMP_IF_FALSE, 36, 0]);
    }
    bytes.extend_from_slice(&[LOAD_CONST, 0, 0, STORE_FAST, 1, 0]);
    bytes.extend_from_slice(&[LOAD_CONST, 1, 0, RETURN_VALUE]);

    let code = code(
        vec![Const::Int(1), Const::None],
        vec![],
        vec!["a", "b"],
        bytes,
    );
    let out = lines(&code);
    assert_eq!(
        out,
        vec![
            l(0, "if a:"),
            l(4, "if a:"),
            l(8, "if a:"),
            l(12, "if a:"),
            l(16, "if a:"),
            l(20, "b = 1"),
            l(0, "return None"),
        ]
    );
    assert_eq!(out.last().unwrap().0, 0, "final statement must be back at indent 0");
}

#[test]
fn jump_if_true_negates_the_condition() {
    let code = code(
        vec![Const::Int(1), Const::None],
        vec![],
        vec!["a", "b"],
        vec![
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_TRUE, 12, 0,
            LOAD_CONST, 0, 0,
            STORE_FAST, 1, 0,
            LOAD_CONST, 1, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(
        lines(&code),
        vec![l(0, "if not (a):"), l(4, "b = 1"), l(0, "return None")]
    );
}

#[test]
fn empty_branch_renders_a_placeholder() {
    // the conditional jumps to the very next instruction
    let code = code(
        vec![Const::None],
        vec![],
        vec!["a"],
        vec![
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 6, 0,
            LOAD_CONST, 0, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(
        lines(&code),
        vec![l(0, "if a:"), l(4, "pass"), l(0, "return None")]
    );
}

#[test]
fn conditional_nested_in_a_loop_body() {
    // while a: if b: print c
    let code = code(
        vec![Const::None],
        vec![],
        vec!["a", "b", "c"],
        vec![
            SETUP_LOOP, 21, 0,
            LOAD_FAST, 0, 0,
            POP_JUMP_IF_FALSE, 23, 0,
            LOAD_FAST, 1, 0,
            POP_JUMP_IF_FALSE, 20, 0,
            LOAD_FAST, 2, 0,
            PRINT_ITEM,
            PRINT_NEWLINE,
            JUMP_ABSOLUTE, 3, 0,
            POP_BLOCK,
            LOAD_CONST, 0, 0,
            RETURN_VALUE,
        ],
    );
    assert_eq!(
        lines(&code),
        vec![
            l(0, "while a:"),
            l(4, "if b:"),
            l(8, "print c"),
            l(0, "return None"),
        ]
    );
}

#[test]
fn code_after_return_is_still_processed() {
    let code = code(
        vec![Const::None],
        vec![],
        vec![],
        vec![
            LOAD_CONST, 0, 0,
            RETURN_VALUE,
            LOAD_CONST, 0, 0,
            POP_TOP,
        ],
    );
    assert_eq!(lines(&code), vec![l(0, "return None"), l(0, "None")]);
}

#[test]
fn orphan_block_close_is_fatal() {
    let code = code(vec![], vec![], vec![], vec![POP_BLOCK]);
    let instrs = decode_instructions(&code).unwrap();
    match decompile_instructions(&instrs) {
        Err(UnsmashError::OrphanBlockClose { offset: 0 }) => {}
        other => panic!("expected OrphanBlockClose, got {other:?}"),
    }
}
