//! Object macros: `<call>name args</call>` in a reply.
//!
//! Each macro belongs to a language, and each language has at most one
//! [`ObjectHandler`] registered on the brain. The brain only knows the
//! contract: hand the handler the macro's source at load time, then call it by
//! name with the already-expanded arguments.
//!
//! The crate ships one handler, [`FunctionHandler`], registered as `"rust"`:
//! its macros are host closures added with
//! [`Brain::set_subroutine`](crate::Brain::set_subroutine) rather than source
//! code.

use crate::engine::Brain;
use crate::error::MacroError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Language name of the built-in closure handler.
pub const RUST_LANGUAGE: &str = "rust";

/// Opaque host value passed through `reply_with_scope` to macros.
pub type Scope = Arc<dyn Any + Send + Sync>;

/// Everything a macro sees when it runs.
pub struct MacroCall<'a> {
    pub brain: &'a Brain,
    /// User whose reply is being built.
    pub user: &'a str,
    pub name: &'a str,
    pub args: &'a [String],
    pub scope: Option<&'a Scope>,
}

impl MacroCall<'_> {
    /// Downcast the scope to the host's concrete type.
    pub fn scope<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.scope.and_then(|scope| scope.downcast_ref::<T>())
    }
}

#[async_trait]
pub trait ObjectHandler: Send + Sync {
    /// Receive a macro's source. Called once per macro when a document loads.
    async fn load(&self, name: &str, code: &str) -> Result<(), MacroError>;

    /// Run a loaded macro. The returned text replaces the `<call>` tag.
    async fn call(&self, call: MacroCall<'_>) -> Result<String, MacroError>;
}

pub type Subroutine = Arc<dyn Fn(&MacroCall<'_>) -> Result<String, MacroError> + Send + Sync>;

/// Handler whose macros are native closures.
#[derive(Default)]
pub struct FunctionHandler {
    functions: RwLock<HashMap<String, Subroutine>>,
}

impl FunctionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, function: Subroutine) {
        self.functions.write().insert(name.into(), function);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.functions.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }
}

impl std::fmt::Debug for FunctionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("FunctionHandler").field("functions", &names).finish()
    }
}

#[async_trait]
impl ObjectHandler for FunctionHandler {
    async fn load(&self, name: &str, _code: &str) -> Result<(), MacroError> {
        Err(MacroError::new(format!("'{name}' has source code; rust macros are registered with set_subroutine")))
    }

    async fn call(&self, call: MacroCall<'_>) -> Result<String, MacroError> {
        let function = self.functions.read().get(call.name).cloned();
        match function {
            Some(function) => function(&call),
            None => Err(MacroError::new(format!("no subroutine named '{}'", call.name))),
        }
    }
}
