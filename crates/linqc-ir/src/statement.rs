//! Statement IR and line emitter
//!
//! Generated code is held as a tree of blocks. Statements that open a block
//! (loops, if tests, else arms) carry a `BlockId` into the arena instead of
//! owning their children, so blocks can be spliced and re-parented without
//! moving statements around.

use serde::{Deserialize, Serialize};

/// Index of a block in a `Blocks` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// A local variable owned by a block, rendered before its statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDecl {
    pub cpp_type: String,
    pub name: String,
    pub init: Option<String>,
}

impl VarDecl {
    fn render(&self) -> String {
        match &self.init {
            Some(init) => format!("{} {} ({});", self.cpp_type, self.name, init),
            None => format!("{} {};", self.cpp_type, self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Statement {
    /// Bare scoping block.
    Nested(BlockId),
    /// `for (auto var : iterable) { ... }`
    Loop { var: String, iterable: String, body: BlockId },
    /// `if (condition) { ... }`
    IfTest { condition: String, body: BlockId },
    /// `else { ... }`; must directly follow an `IfTest`.
    Else { body: BlockId },
    Assign { target: String, value: String },
    PushBack { collection: String, value: String },
    Clear { collection: String },
    Raw(String),
    /// Book-time registration of an output column against its storage.
    BookField { column: String, storage: String },
    /// Commit the current record's output values.
    CommitRecord,
}

impl Statement {
    /// Block opened by this statement, if it opens one.
    pub fn body(&self) -> Option<BlockId> {
        match self {
            Statement::Nested(b)
            | Statement::Loop { body: b, .. }
            | Statement::IfTest { body: b, .. }
            | Statement::Else { body: b } => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Block {
    pub declarations: Vec<VarDecl>,
    pub statements: Vec<Statement>,
}

/// Arena of blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn alloc(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        id
    }

    pub fn get(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn emit(&self, id: BlockId, e: &mut SourceEmitter) {
        e.add_line("{");
        let block = self.get(id);
        for decl in &block.declarations {
            e.add_line(&decl.render());
        }
        for st in &block.statements {
            self.emit_statement(st, e);
        }
        e.add_line("}");
    }

    fn emit_statement(&self, st: &Statement, e: &mut SourceEmitter) {
        match st {
            Statement::Nested(body) => self.emit(*body, e),
            Statement::Loop { var, iterable, body } => {
                e.add_line(&format!("for (auto {var} : {iterable})"));
                self.emit(*body, e);
            }
            Statement::IfTest { condition, body } => {
                e.add_line(&format!("if ({condition})"));
                self.emit(*body, e);
            }
            Statement::Else { body } => {
                e.add_line("else");
                self.emit(*body, e);
            }
            Statement::Assign { target, value } => {
                e.add_line(&format!("{target} = {value};"));
            }
            Statement::PushBack { collection, value } => {
                e.add_line(&format!("{collection}.push_back({value});"));
            }
            Statement::Clear { collection } => {
                e.add_line(&format!("{collection}.clear();"));
            }
            Statement::Raw(line) => {
                if line.ends_with(';') {
                    e.add_line(line);
                } else {
                    e.add_line(&format!("{line};"));
                }
            }
            Statement::BookField { column, storage } => {
                e.add_line(&format!("output->Branch(\"{column}\", &{storage});"));
            }
            Statement::CommitRecord => {
                e.add_line("output->Fill();");
            }
        }
    }
}

/// Collects lines of code, tracking indentation off the braces themselves.
#[derive(Debug, Default)]
pub struct SourceEmitter {
    lines: Vec<String>,
    indent: usize,
}

impl SourceEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, line: &str) {
        if line == "}" {
            self.indent = self.indent.saturating_sub(1);
        }
        self.lines.push(format!("{}{}", "  ".repeat(self.indent), line));
        if line == "{" {
            self.indent += 1;
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_block_emits_braces() {
        let mut blocks = Blocks::new();
        let b = blocks.alloc();
        let mut e = SourceEmitter::new();
        blocks.emit(b, &mut e);
        assert_eq!(e.into_lines(), vec!["{", "}"]);
    }

    #[test]
    fn test_declarations_render_before_statements() {
        let mut blocks = Blocks::new();
        let b = blocks.alloc();
        blocks.get_mut(b).statements.push(Statement::Assign {
            target: "x".to_string(),
            value: "1".to_string(),
        });
        blocks.get_mut(b).declarations.push(VarDecl {
            cpp_type: "int".to_string(),
            name: "x".to_string(),
            init: Some("0".to_string()),
        });

        let mut e = SourceEmitter::new();
        blocks.emit(b, &mut e);
        assert_eq!(e.into_lines(), vec!["{", "  int x (0);", "  x = 1;", "}"]);
    }

    #[test]
    fn test_loop_indents_its_body() {
        let mut blocks = Blocks::new();
        let outer = blocks.alloc();
        let body = blocks.alloc();
        blocks.get_mut(body).statements.push(Statement::PushBack {
            collection: "_pts".to_string(),
            value: "jet->pt()".to_string(),
        });
        blocks.get_mut(outer).statements.push(Statement::Loop {
            var: "jet".to_string(),
            iterable: "*jets".to_string(),
            body,
        });

        let mut e = SourceEmitter::new();
        blocks.emit(outer, &mut e);
        assert_eq!(
            e.into_lines(),
            vec![
                "{",
                "  for (auto jet : *jets)",
                "  {",
                "    _pts.push_back(jet->pt());",
                "  }",
                "}",
            ]
        );
    }
}
