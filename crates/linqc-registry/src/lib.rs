//! Method type registry for the event data model
//!
//! The translator asks the registry what a method call returns so it can
//! declare temporaries with the right C++ type and pull in the right headers.
//! Methods nobody registered get a guessed `double` return so exploratory
//! queries keep working; the caller decides how loudly to report the guess.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TypeError {
    #[error("unable to call method '{method}' on scalar type '{type_name}'")]
    ScalarMethodCall { type_name: String, method: String },
}

/// C++-level type of a value flowing through generated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SemanticType {
    /// Plain value or object type, named as it appears in C++.
    Terminal { name: String, is_pointer: bool },
    /// Iterable container of `element` values.
    Collection { element: Box<SemanticType>, is_pointer: bool },
    /// Fixed group of heterogeneous values, addressed by position. Never
    /// emitted as a C++ type; decomposed before code generation.
    Tuple(Vec<SemanticType>),
}

impl SemanticType {
    pub fn terminal(name: impl Into<String>) -> Self {
        SemanticType::Terminal { name: name.into(), is_pointer: false }
    }

    pub fn pointer_to(name: impl Into<String>) -> Self {
        SemanticType::Terminal { name: name.into(), is_pointer: true }
    }

    pub fn double() -> Self {
        Self::terminal("double")
    }

    pub fn int() -> Self {
        Self::terminal("int")
    }

    pub fn boolean() -> Self {
        Self::terminal("bool")
    }

    pub fn collection_of(element: SemanticType) -> Self {
        SemanticType::Collection { element: Box::new(element), is_pointer: false }
    }

    pub fn pointer_collection_of(element: SemanticType) -> Self {
        SemanticType::Collection { element: Box::new(element), is_pointer: true }
    }

    pub fn is_pointer(&self) -> bool {
        match self {
            SemanticType::Terminal { is_pointer, .. }
            | SemanticType::Collection { is_pointer, .. } => *is_pointer,
            SemanticType::Tuple(_) => false,
        }
    }

    /// Numeric scalars cannot have methods called on them.
    pub fn is_numeric_scalar(&self) -> bool {
        matches!(
            self,
            SemanticType::Terminal { name, is_pointer: false }
                if matches!(
                    name.as_str(),
                    "int" | "long" | "float" | "double" | "size_t" | "unsigned int" | "bool"
                )
        )
    }

    /// Initializer expression for a variable of this type, if it needs one.
    pub fn default_value(&self) -> Option<String> {
        match self {
            SemanticType::Terminal { name, is_pointer: false } => match name.as_str() {
                "int" | "long" | "size_t" | "unsigned int" => Some("0".to_string()),
                "float" | "double" => Some("0.0".to_string()),
                "bool" => Some("false".to_string()),
                _ => None,
            },
            SemanticType::Terminal { is_pointer: true, .. } => Some("nullptr".to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticType::Terminal { name, is_pointer } => {
                write!(f, "{name}{}", if *is_pointer { "*" } else { "" })
            }
            SemanticType::Collection { element, is_pointer } => {
                write!(f, "std::vector<{element}>{}", if *is_pointer { "*" } else { "" })
            }
            SemanticType::Tuple(elements) => {
                write!(f, "(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Registered facts about one method on one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodInfo {
    pub return_type: SemanticType,
    /// Header that must be included when this method appears in output.
    pub include: Option<String>,
}

impl MethodInfo {
    pub fn returning(return_type: SemanticType) -> Self {
        Self { return_type, include: None }
    }

    pub fn with_include(mut self, include: impl Into<String>) -> Self {
        self.include = Some(include.into());
        self
    }
}

/// Outcome of a method lookup.
#[derive(Debug, Clone)]
pub enum MethodLookup {
    Known(MethodInfo),
    /// No registration found; return type defaulted to `double`.
    Guessed(MethodInfo),
}

impl MethodLookup {
    pub fn info(&self) -> &MethodInfo {
        match self {
            MethodLookup::Known(info) | MethodLookup::Guessed(info) => info,
        }
    }

    pub fn is_guessed(&self) -> bool {
        matches!(self, MethodLookup::Guessed(_))
    }
}

/// Method table keyed by (object type name, method name). Pointer-ness of the
/// receiver does not affect resolution, only how the call is rendered.
pub struct TypeRegistry {
    methods: HashMap<(String, String), MethodInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self { methods: HashMap::new() };
        registry.register_builtins();
        registry
    }

    /// Bare registry with no data model, for callers that supply their own.
    pub fn empty() -> Self {
        Self { methods: HashMap::new() }
    }

    fn register_builtins(&mut self) {
        // Event-level containers come back as pointers to const containers of
        // object pointers, matching how the event store hands them out.
        self.register(
            "Event",
            "Jets",
            MethodInfo::returning(SemanticType::pointer_collection_of(
                SemanticType::pointer_to("Jet"),
            ))
            .with_include("event_model/Jet.h"),
        );
        self.register(
            "Event",
            "Electrons",
            MethodInfo::returning(SemanticType::pointer_collection_of(
                SemanticType::pointer_to("Electron"),
            ))
            .with_include("event_model/Electron.h"),
        );
        self.register(
            "Event",
            "Muons",
            MethodInfo::returning(SemanticType::pointer_collection_of(
                SemanticType::pointer_to("Muon"),
            ))
            .with_include("event_model/Muon.h"),
        );
        self.register(
            "Event",
            "Tracks",
            MethodInfo::returning(SemanticType::pointer_collection_of(
                SemanticType::pointer_to("Track"),
            ))
            .with_include("event_model/Track.h"),
        );

        // Kinematics common to the particle types
        for obj in ["Jet", "Electron", "Muon", "Track"] {
            for method in ["pt", "eta", "phi", "e", "m"] {
                self.register(obj, method, MethodInfo::returning(SemanticType::double()));
            }
        }
        self.register(
            "Jet",
            "Tracks",
            MethodInfo::returning(SemanticType::pointer_collection_of(
                SemanticType::pointer_to("Track"),
            )),
        );
        self.register("Electron", "charge", MethodInfo::returning(SemanticType::int()));
        self.register("Muon", "charge", MethodInfo::returning(SemanticType::int()));
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        method: impl Into<String>,
        info: MethodInfo,
    ) {
        self.methods.insert((type_name.into(), method.into()), info);
    }

    /// Resolve `method` called on a value of `receiver` type. Unregistered
    /// methods on object types come back as a guess; method calls on numeric
    /// scalars are rejected outright.
    pub fn lookup(
        &self,
        receiver: &SemanticType,
        method: &str,
    ) -> Result<MethodLookup, TypeError> {
        if receiver.is_numeric_scalar() {
            return Err(TypeError::ScalarMethodCall {
                type_name: receiver.to_string(),
                method: method.to_string(),
            });
        }
        let key_name = match receiver {
            SemanticType::Terminal { name, .. } => name.clone(),
            other => other.to_string(),
        };
        match self.methods.get(&(key_name, method.to_string())) {
            Some(info) => Ok(MethodLookup::Known(info.clone())),
            None => Ok(MethodLookup::Guessed(MethodInfo::returning(SemanticType::double()))),
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
