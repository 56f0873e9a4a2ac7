//! Runtime representations of translated expressions
//!
//! Every representation records the scope it was created at; an expression
//! string is only meaningful inside that scope.

use linqc_registry::SemanticType;

use crate::scope::Scope;

/// A single C++ expression with its type and the scope it is valid in.
#[derive(Debug, Clone)]
pub struct Value {
    pub expr: String,
    pub ty: SemanticType,
    pub scope: Scope,
}

impl Value {
    pub fn new(expr: impl Into<String>, ty: SemanticType, scope: Scope) -> Self {
        Self { expr: expr.into(), ty, scope }
    }
}

/// A sequence being iterated: the loop variable driving it and the
/// representation of the current item. `scope` is where the sequence was
/// created, one level outside its iteration.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub iterator: Value,
    pub value: Box<Rep>,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
pub enum Rep {
    Value(Value),
    /// An iterable container that has not been opened into a loop yet.
    Collection(Value),
    Sequence(Sequence),
    Tuple { elements: Vec<Rep>, scope: Scope },
}

impl Rep {
    pub fn scope(&self) -> &Scope {
        match self {
            Rep::Value(v) | Rep::Collection(v) => &v.scope,
            Rep::Sequence(s) => &s.scope,
            Rep::Tuple { scope, .. } => scope,
        }
    }

    /// The same representation stamped with a different scope, used when a
    /// value becomes valid in a narrower block (inside a filter or guard).
    pub fn rescope(&self, scope: Scope) -> Rep {
        match self {
            Rep::Value(v) => Rep::Value(Value { scope, ..v.clone() }),
            Rep::Collection(v) => Rep::Collection(Value { scope, ..v.clone() }),
            Rep::Sequence(s) => Rep::Sequence(Sequence { scope, ..s.clone() }),
            Rep::Tuple { elements, .. } => {
                Rep::Tuple { elements: elements.clone(), scope }
            }
        }
    }
}
