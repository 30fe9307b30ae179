//! End-to-end compilation pipeline.
//!
//! Scanner → Parser → Symbol-lexical pass → Static pass, each stage gating
//! on the previous having produced no errors. Every stage still runs on a
//! best-effort basis so editors get diagnostics and a symbol table even for
//! broken documents.

use log::debug;

use crate::lexical_pass::LexicalPass;
use crate::model::ModelId;
use crate::parse_tree::ParseTree;
use crate::parser::Parser;
use crate::program::Program;
use crate::scanner::Scanner;
use crate::static_pass::{
    InstantiationLookup, NumericSwitchMap, StaticPass, StringSwitchMap,
};
use crate::symbol_table::SymbolTable;

/// The diagnosed, typed, instantiated artefacts of one compilation.
pub struct Compilation {
    pub parse_tree: ParseTree,
    pub symbol_table: SymbolTable,
    pub instantiation_lookup: InstantiationLookup,
    pub number_switch: NumericSwitchMap,
    pub string_switch: StringSwitchMap,
}

/// Run the full pipeline on an entry model. Returns None when any stage
/// reported errors; the diagnostics stay on the program's error stream.
pub fn compile(program: &mut Program, entry: ModelId) -> Option<Compilation> {
    program.reset();

    debug!("scanning model {entry}");
    let tokens = Scanner::new(program, entry).scan_all();

    debug!("parsing {} tokens", tokens.len());
    let mut parser = Parser::new(program, entry, tokens);
    parser.parse_all();
    let mut parse_tree = std::mem::take(&mut parser.parse_tree);
    drop(parser);

    let mut symbol_table = LexicalPass::new(program, &mut parse_tree, entry).resolve_symbols();

    if !program.no_errors() {
        return None;
    }

    let mut static_pass = StaticPass::new(program, &mut parse_tree, &mut symbol_table, entry);
    static_pass.resolve();
    let instantiation_lookup = std::mem::take(&mut static_pass.instantiation_lookup);
    let number_switch = std::mem::take(&mut static_pass.number_switch);
    let string_switch = std::mem::take(&mut static_pass.string_switch);
    drop(static_pass);

    if !program.no_errors() {
        return None;
    }

    Some(Compilation {
        parse_tree,
        symbol_table,
        instantiation_lookup,
        number_switch,
        string_switch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn pipeline_produces_compilation_for_valid_source() {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("main.nte"), "x ← 1\nprint(x)")
            .model()
            .unwrap();
        assert!(compile(&mut program, id).is_some());
        assert!(program.no_errors());
    }

    #[test]
    fn pipeline_stops_on_parse_errors() {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("main.nte"), "print(")
            .model()
            .unwrap();
        assert!(compile(&mut program, id).is_none());
        assert!(!program.no_errors());
    }

    #[test]
    fn recompiling_is_deterministic() {
        let source = "x ← 2\ny ← x * 3\nprint(y)";
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("main.nte"), source)
            .model()
            .unwrap();
        let first = compile(&mut program, id).unwrap();
        let first_len = first.parse_tree.len();
        let second = compile(&mut program, id).unwrap();
        assert_eq!(first_len, second.parse_tree.len());
        assert!(program.no_errors());
    }
}
