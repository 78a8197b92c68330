//! Python execution middleware for Jupyter kernels.
//!
//! Sits between an editor and a kernel. Code sent for execution is grown to
//! the full statement around the cursor (decorators, `else`/`except` clauses,
//! closing brackets). After each execution a small helper installed inside
//! the kernel reports the user namespace, which is republished as
//! [`PluginEvent::DidUpdateVars`] for a variable explorer.
//!
//! Hosts create one [`HydrogenPython`], then [`attach`](HydrogenPython::attach)
//! it to each Python kernel's [`Executor`].

pub mod buffer;
pub mod events;
pub mod executor;
pub mod expander;
pub mod explorer;
pub mod installer;
pub mod kernel;
pub mod language;
pub mod message;
pub mod middleware;
pub mod plugin;
pub mod resources;
pub mod session;
pub mod settings;

#[cfg(test)]
mod testing;

pub use buffer::{Editor, LineBuffer, RunMode, SelectionSpan, SingleEditor, SourceBuffer, Workspace};
pub use events::{EventBus, PluginEvent};
pub use executor::{Executor, ExecutorError, ReplyStream};
pub use expander::{expand, CodeBlock, ExpansionResult, ExpansionRules};
pub use explorer::VariableRecord;
pub use kernel::KernelConnection;
pub use language::KernelLanguage;
pub use message::{KernelMessage, MessageChannel};
pub use middleware::PythonMiddleware;
pub use plugin::HydrogenPython;
pub use settings::Settings;
