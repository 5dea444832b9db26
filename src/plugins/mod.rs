//! Plugin system for garden-core
//!
//! Plugins contribute provider handlers, CLI commands, tools and module
//! types. A plugin may extend another plugin through `base`, inheriting
//! everything it does not override, and may depend on other plugins whose
//! module types it builds on.
//!
//! # Architecture
//!
//! - **types**: Declared and resolved plugin shapes, handler chains
//! - **registry**: Registration, base-chain resolution and conflict detection
//! - **graph**: Cycle detection for plugin and module type graphs
//! - **schema**: Module outputs validation against module type schemas
//!
//! # Inheritance
//!
//! ```text
//! grandparent ── configureProvider ◄─┐ base
//!      ▲                             │
//!   parent ───── configureProvider ──┘ ◄─┐ base
//!      ▲                                 │
//!    child ───── configureProvider ──────┘
//! ```
//!
//! An overriding handler keeps a `base` link to the handler it replaced, so
//! it can delegate to it. Handlers a generation does not override are passed
//! down unchanged.
//!
//! # Usage
//!
//! ```rust
//! use garden_core::plugins::{handler, ModuleTypeSpec, PluginDefinition, PluginRegistry};
//!
//! let mut registry = PluginRegistry::new().with_configured(["exec"]);
//! registry
//!     .register(vec![PluginDefinition::new("exec").create_module_type(
//!         ModuleTypeSpec::new("exec", "Run arbitrary commands")
//!             .with_handler("configure", handler(|p| Ok(p.params))),
//!     )])
//!     .unwrap();
//!
//! let module_types = registry.get_module_types().unwrap();
//! assert!(module_types.contains_key("exec"));
//! ```

mod graph;
pub mod registry;
pub mod schema;
pub mod types;

pub use registry::PluginRegistry;
pub use schema::{get_module_type_bases, validate_module_outputs};
pub use types::{
    handler, HandlerFn, HandlerParams, ModuleTypeDefinition, ModuleTypeExtension,
    ModuleTypeExtensionSpec, ModuleTypeSpec, PluginCommand, PluginDefinition, PluginHandler,
    PluginTool, ResolvedPlugin, ToolBuild, ToolType,
};
