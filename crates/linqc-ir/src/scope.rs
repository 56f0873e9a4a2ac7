//! Scope tokens and the scope-tracked code buffer
//!
//! Every generated statement and declared variable lives at a scope: a path
//! of block ids from the per-record block down to some nested block. The
//! translator saves scope tokens off representations and jumps the insertion
//! cursor back to them, so statements can be placed where a value is valid
//! rather than where the walk happens to be.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::statement::{BlockId, Blocks, SourceEmitter, Statement, VarDecl};

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("cannot wind a scope above the per-record block")]
    AboveRecord,

    #[error("statements can only be spliced below a block-bearing statement")]
    SpliceNeedsBlock,

    #[error("no enclosing block at the top level")]
    TopLevelBlock,
}

/// Where a statement or value lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Above the per-record block; declarations here persist across records.
    TopLevel,
    /// Path of blocks from the per-record block (first) downward.
    Frames(Vec<BlockId>),
}

impl Scope {
    /// A scope `n` levels shallower. Winding past the per-record block is an
    /// error; the top level is not reachable this way.
    pub fn up(&self, n: usize) -> Result<Scope, ScopeError> {
        match self {
            Scope::TopLevel => Err(ScopeError::AboveRecord),
            Scope::Frames(frames) => {
                if frames.len() <= n {
                    return Err(ScopeError::AboveRecord);
                }
                Ok(Scope::Frames(frames[..frames.len() - n].to_vec()))
            }
        }
    }

    /// The scope of `block` nested directly inside this one.
    pub fn down(&self, block: BlockId) -> Result<Scope, ScopeError> {
        match self {
            Scope::TopLevel => Err(ScopeError::TopLevelBlock),
            Scope::Frames(frames) => {
                let mut frames = frames.clone();
                frames.push(block);
                Ok(Scope::Frames(frames))
            }
        }
    }

    /// True when `ancestor` is a prefix of this scope. The top level is an
    /// ancestor of everything and has no ancestor but itself.
    pub fn starts_with(&self, ancestor: &Scope) -> bool {
        match (self, ancestor) {
            (_, Scope::TopLevel) => true,
            (Scope::TopLevel, _) => false,
            (Scope::Frames(own), Scope::Frames(other)) => {
                own.len() >= other.len() && own[..other.len()] == other[..]
            }
        }
    }

    /// The deeper of two scopes; `a` wins ties and unrelated pairs.
    pub fn deepest<'a>(a: &'a Scope, b: &'a Scope) -> &'a Scope {
        if !b.starts_with(a) {
            return a;
        }
        if a.starts_with(b) {
            return a;
        }
        b
    }

    fn deepest_frame(&self) -> Result<BlockId, ScopeError> {
        match self {
            Scope::TopLevel => Err(ScopeError::TopLevelBlock),
            Scope::Frames(frames) => {
                frames.last().copied().ok_or(ScopeError::TopLevelBlock)
            }
        }
    }
}

/// Accumulates generated statements into the per-record block tree and the
/// one-time book block, with a cursor that follows opened blocks.
pub struct CodeBuffer {
    blocks: Blocks,
    record_block: BlockId,
    book_block: BlockId,
    stack: Vec<BlockId>,
    top_level_decls: Vec<VarDecl>,
    includes: Vec<String>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        let mut blocks = Blocks::new();
        let record_block = blocks.alloc();
        let book_block = blocks.alloc();
        Self {
            blocks,
            record_block,
            book_block,
            stack: vec![record_block],
            top_level_decls: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn alloc_block(&mut self) -> BlockId {
        self.blocks.alloc()
    }

    /// Scope of the per-record block itself.
    pub fn record_scope(&self) -> Scope {
        Scope::Frames(vec![self.record_block])
    }

    pub fn current_scope(&self) -> Scope {
        Scope::Frames(self.stack.clone())
    }

    pub fn set_scope(&mut self, scope: &Scope) {
        match scope {
            Scope::TopLevel => self.stack.truncate(1),
            Scope::Frames(frames) => self.stack = frames.clone(),
        }
    }

    pub fn pop_scope(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    /// Append a statement at the cursor. A statement that opens a block moves
    /// the cursor inside it.
    pub fn add_statement(&mut self, st: Statement) {
        let body = st.body();
        let here = *self.stack.last().expect("cursor stack is never empty");
        self.blocks.get_mut(here).statements.push(st);
        if let Some(body) = body {
            self.stack.push(body);
        }
    }

    /// Splice a block-bearing statement in at `below`: everything already in
    /// that scope's deepest block moves inside the new statement, after any
    /// statements its block already holds, and the new statement becomes the
    /// block's only statement. The cursor does not move.
    pub fn add_statement_below(
        &mut self,
        st: Statement,
        below: &Scope,
    ) -> Result<(), ScopeError> {
        let body = st.body().ok_or(ScopeError::SpliceNeedsBlock)?;
        let target = below.deepest_frame()?;
        let moved = std::mem::take(&mut self.blocks.get_mut(target).statements);
        self.blocks.get_mut(body).statements.extend(moved);
        self.blocks.get_mut(target).statements.push(st);
        Ok(())
    }

    /// Append a statement to a block that the cursor is not pointing at, such
    /// as one being assembled before a splice.
    pub fn add_statement_to(&mut self, block: BlockId, st: Statement) {
        self.blocks.get_mut(block).statements.push(st);
    }

    /// Declare a variable at the cursor's block.
    pub fn declare_variable(&mut self, decl: VarDecl) {
        let here = *self.stack.last().expect("cursor stack is never empty");
        self.blocks.get_mut(here).declarations.push(decl);
    }

    /// Declare a variable at an explicit scope. Top-level declarations land
    /// in the persistent declaration stream.
    pub fn declare_variable_at(&mut self, scope: &Scope, decl: VarDecl) -> Result<(), ScopeError> {
        match scope {
            Scope::TopLevel => {
                self.top_level_decls.push(decl);
                Ok(())
            }
            Scope::Frames(_) => {
                let target = scope.deepest_frame()?;
                self.blocks.get_mut(target).declarations.push(decl);
                Ok(())
            }
        }
    }

    /// Append a statement to the one-time book block.
    pub fn add_book_statement(&mut self, st: Statement) {
        self.blocks.get_mut(self.book_block).statements.push(st);
    }

    pub fn add_include(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.includes.contains(&path) {
            self.includes.push(path);
        }
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Persistent declarations, rendered for the class body.
    pub fn top_level_declarations(&self) -> Vec<String> {
        self.top_level_decls
            .iter()
            .map(|d| match &d.init {
                Some(init) => format!("{} {} = {};", d.cpp_type, d.name, init),
                None => format!("{} {};", d.cpp_type, d.name),
            })
            .collect()
    }

    pub fn emit_record_code(&self) -> Vec<String> {
        let mut e = SourceEmitter::new();
        self.blocks.emit(self.record_block, &mut e);
        e.into_lines()
    }

    pub fn emit_book_code(&self) -> Vec<String> {
        let mut e = SourceEmitter::new();
        self.blocks.emit(self.book_block, &mut e);
        e.into_lines()
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}
