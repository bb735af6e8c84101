use unsmash_lib::{CodeObject, Const, decode_instructions, decompile_instructions};

pub fn code(consts: Vec<Const>, names: Vec<&str>, varnames: Vec<&str>, bytes: Vec<u8>) -> CodeObject {
    CodeObject {
        name: "f".into(),
        arg_count: 0,
        consts,
        names: names.into_iter().map(String::from).collect(),
        varnames: varnames.into_iter().map(String::from).collect(),
        code: bytes,
    }
}

/// Decompile and render at the default 4-column indent step.
pub fn lines(code: &CodeObject) -> Vec<(usize, String)> {
    let instrs = decode_instructions(code).expect("bytecode should decode");
    let tree = decompile_instructions(&instrs).expect("instructions should decompile");
    tree.render(4)
        .into_iter()
        .map(|line| (line.indent, line.text))
        .collect()
}

pub fn l(indent: usize, text: &str) -> (usize, String) {
    (indent, text.to_string())
}
