pub mod bytecodes;
pub mod codelets;
pub mod dump;
pub mod jit_section;
pub mod methods;
pub mod registry;
pub mod scopes;

pub use dump::JvmRuntime;
