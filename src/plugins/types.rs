//! Plugin types for garden-core
//!
//! This module defines the declared shape of a plugin (`PluginDefinition`)
//! and the shape it takes once its base chain has been merged in
//! (`ResolvedPlugin`). Handlers are plain closures wrapped in
//! [`PluginHandler`], which records where the handler came from and links to
//! the handler it overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A plugin, command or module type handler.
///
/// Handlers receive a [`HandlerParams`] and return a JSON result. They are
/// reference counted so the same closure can appear in several resolved
/// plugins without being cloned.
pub type HandlerFn = Arc<dyn Fn(HandlerParams) -> Result<Value> + Send + Sync>;

/// Wrap a closure as a [`HandlerFn`].
pub fn handler<F>(f: F) -> HandlerFn
where
    F: Fn(HandlerParams) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Parameters passed to a handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerParams {
    /// Caller supplied payload.
    pub params: Value,
    /// The handler this one overrides, if any. Call it to delegate.
    pub base: Option<Arc<PluginHandler>>,
}

// ============================================================================
// Handlers
// ============================================================================

/// A handler together with its provenance and override chain.
///
/// `base` points at the handler of the same type that this one replaced in
/// the plugin's base chain (or in the module type being extended). Following
/// `base` repeatedly walks back one generation at a time until `None`.
#[derive(Clone)]
pub struct PluginHandler {
    /// Handler type, e.g. `configureProvider` or `getModuleOutputs`.
    pub handler_type: String,
    /// Name of the plugin that declared this handler.
    pub plugin_name: String,
    /// Module type the handler belongs to, for module-scoped handlers.
    pub module_type: Option<String>,
    /// The overridden handler, if any.
    pub base: Option<Arc<PluginHandler>>,
    func: HandlerFn,
}

impl PluginHandler {
    pub fn new(
        plugin_name: impl Into<String>,
        handler_type: impl Into<String>,
        module_type: Option<String>,
        func: HandlerFn,
    ) -> Self {
        Self {
            handler_type: handler_type.into(),
            plugin_name: plugin_name.into(),
            module_type,
            base: None,
            func,
        }
    }

    /// Return a copy of this handler linked to `base`.
    pub fn with_base(mut self, base: Option<Arc<PluginHandler>>) -> Self {
        self.base = base;
        self
    }

    /// Invoke the handler. The overridden handler is passed along as `base`.
    pub fn call(&self, params: Value) -> Result<Value> {
        (self.func)(HandlerParams {
            params,
            base: self.base.clone(),
        })
    }

    /// Number of handlers below this one in the override chain.
    pub fn base_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.base.as_ref();
        while let Some(handler) = current {
            depth += 1;
            current = handler.base.as_ref();
        }
        depth
    }

    /// Whether both values wrap the same underlying closure.
    pub fn same_function(&self, other: &PluginHandler) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for PluginHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandler")
            .field("handler_type", &self.handler_type)
            .field("plugin_name", &self.plugin_name)
            .field("module_type", &self.module_type)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A CLI command contributed by a plugin.
#[derive(Clone)]
pub struct PluginCommand {
    pub name: String,
    pub description: String,
    /// Whether the command needs the full dependency graph to run.
    pub resolve_graph: bool,
    /// The same-named command this one overrides in the base chain.
    pub base: Option<Arc<PluginCommand>>,
    handler: HandlerFn,
}

impl PluginCommand {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: HandlerFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            resolve_graph: true,
            base: None,
            handler,
        }
    }

    pub fn with_resolve_graph(mut self, resolve_graph: bool) -> Self {
        self.resolve_graph = resolve_graph;
        self
    }

    pub fn with_base(mut self, base: Option<Arc<PluginCommand>>) -> Self {
        self.base = base;
        self
    }

    pub fn call(&self, params: Value) -> Result<Value> {
        (self.handler)(HandlerParams { params, base: None })
    }
}

impl fmt::Debug for PluginCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCommand")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("resolve_graph", &self.resolve_graph)
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Kind of a downloadable plugin tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    #[default]
    Binary,
    Library,
}

/// A platform specific build of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolBuild {
    pub platform: String,
    pub architecture: String,
    pub url: String,
    pub sha256: String,
}

/// An external tool a plugin makes available.
///
/// Tools override by name: a tool redeclared by a child plugin replaces the
/// base plugin's tool outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginTool {
    pub name: String,
    #[serde(rename = "type", default)]
    pub tool_type: ToolType,
    pub description: String,
    #[serde(default)]
    pub builds: Vec<ToolBuild>,
}

// ============================================================================
// Module types
// ============================================================================

/// A module type declared through `createModuleTypes`.
#[derive(Clone, Default)]
pub struct ModuleTypeSpec {
    pub name: String,
    pub docs: String,
    /// Config schema for modules of this type.
    pub schema: Option<Value>,
    /// Schema the module outputs must satisfy.
    pub module_outputs_schema: Option<Value>,
    /// Name of the module type this one builds on.
    pub base: Option<String>,
    pub handlers: BTreeMap<String, HandlerFn>,
}

impl ModuleTypeSpec {
    pub fn new(name: impl Into<String>, docs: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: docs.into(),
            ..Default::default()
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_outputs_schema(mut self, schema: Value) -> Self {
        self.module_outputs_schema = Some(schema);
        self
    }

    pub fn with_handler(mut self, handler_type: impl Into<String>, func: HandlerFn) -> Self {
        self.handlers.insert(handler_type.into(), func);
        self
    }
}

impl fmt::Debug for ModuleTypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTypeSpec")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Handlers added to a module type created by another plugin.
#[derive(Clone, Default)]
pub struct ModuleTypeExtensionSpec {
    pub name: String,
    pub handlers: BTreeMap<String, HandlerFn>,
}

impl ModuleTypeExtensionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn with_handler(mut self, handler_type: impl Into<String>, func: HandlerFn) -> Self {
        self.handlers.insert(handler_type.into(), func);
        self
    }
}

impl fmt::Debug for ModuleTypeExtensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTypeExtensionSpec")
            .field("name", &self.name)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A module type after resolution.
#[derive(Debug, Clone)]
pub struct ModuleTypeDefinition {
    pub name: String,
    pub docs: String,
    pub schema: Option<Value>,
    pub module_outputs_schema: Option<Value>,
    pub base: Option<String>,
    /// Plugin that originally declared the module type.
    pub plugin_name: String,
    /// Resolved plugin that carries the module type (differs from
    /// `plugin_name` when a child plugin takes over its base's types).
    pub owner: String,
    pub handlers: BTreeMap<String, Arc<PluginHandler>>,
}

impl ModuleTypeDefinition {
    pub(crate) fn from_spec(plugin_name: &str, spec: &ModuleTypeSpec) -> Self {
        let handlers = spec
            .handlers
            .iter()
            .map(|(handler_type, func)| {
                let h = PluginHandler::new(
                    plugin_name,
                    handler_type.clone(),
                    Some(spec.name.clone()),
                    func.clone(),
                );
                (handler_type.clone(), Arc::new(h))
            })
            .collect();

        Self {
            name: spec.name.clone(),
            docs: spec.docs.clone(),
            schema: spec.schema.clone(),
            module_outputs_schema: spec.module_outputs_schema.clone(),
            base: spec.base.clone(),
            plugin_name: plugin_name.to_string(),
            owner: plugin_name.to_string(),
            handlers,
        }
    }
}

/// A module type extension after resolution.
#[derive(Debug, Clone)]
pub struct ModuleTypeExtension {
    pub name: String,
    /// Plugin that contributed the most recent handlers.
    pub plugin_name: String,
    /// Whether extensions from several generations were merged into this
    /// entry. Coalesced handlers already carry their full `base` chain.
    pub coalesced: bool,
    pub handlers: BTreeMap<String, Arc<PluginHandler>>,
}

// ============================================================================
// Plugin definitions
// ============================================================================

/// A plugin as declared, before its base chain has been applied.
#[derive(Clone, Default)]
pub struct PluginDefinition {
    /// Unique plugin name.
    pub name: String,
    /// Plugin this one extends.
    pub base: Option<String>,
    /// Plugins that must be resolved before this one.
    pub dependencies: Vec<String>,
    pub docs: Option<String>,
    pub handlers: BTreeMap<String, HandlerFn>,
    pub commands: Vec<PluginCommand>,
    pub tools: Vec<PluginTool>,
    pub create_module_types: Vec<ModuleTypeSpec>,
    pub extend_module_types: Vec<ModuleTypeExtensionSpec>,
    pub config_schema: Option<Value>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    pub fn with_handler(mut self, handler_type: impl Into<String>, func: HandlerFn) -> Self {
        self.handlers.insert(handler_type.into(), func);
        self
    }

    pub fn with_command(mut self, command: PluginCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_tool(mut self, tool: PluginTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn create_module_type(mut self, spec: ModuleTypeSpec) -> Self {
        self.create_module_types.push(spec);
        self
    }

    pub fn extend_module_type(mut self, spec: ModuleTypeExtensionSpec) -> Self {
        self.extend_module_types.push(spec);
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Names of the plugins this one points at, base first.
    pub(crate) fn references(&self) -> impl Iterator<Item = &str> {
        self.base
            .as_deref()
            .into_iter()
            .chain(self.dependencies.iter().map(String::as_str))
    }
}

impl fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("dependencies", &self.dependencies)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("commands", &self.commands)
            .field("tools", &self.tools)
            .field("create_module_types", &self.create_module_types)
            .field("extend_module_types", &self.extend_module_types)
            .finish_non_exhaustive()
    }
}

/// A plugin with its whole base chain merged in.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub name: String,
    pub base: Option<String>,
    pub docs: Option<String>,
    /// Own dependencies first, then those inherited from the base chain.
    pub dependencies: Vec<String>,
    pub handlers: BTreeMap<String, Arc<PluginHandler>>,
    pub commands: Vec<Arc<PluginCommand>>,
    pub tools: Vec<PluginTool>,
    pub create_module_types: Vec<ModuleTypeDefinition>,
    pub extend_module_types: Vec<ModuleTypeExtension>,
    pub config_schema: Option<Value>,
}

impl ResolvedPlugin {
    pub fn handler(&self, handler_type: &str) -> Option<&Arc<PluginHandler>> {
        self.handlers.get(handler_type)
    }

    pub fn command(&self, name: &str) -> Option<&Arc<PluginCommand>> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&PluginTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn created_module_type(&self, name: &str) -> Option<&ModuleTypeDefinition> {
        self.create_module_types.iter().find(|t| t.name == name)
    }

    pub fn module_type_extension(&self, name: &str) -> Option<&ModuleTypeExtension> {
        self.extend_module_types.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn returns(value: Value) -> HandlerFn {
        handler(move |_| Ok(value.clone()))
    }

    #[test]
    fn test_handler_call_passes_base() {
        let base = Arc::new(PluginHandler::new("base", "getStatus", None, returns(json!("base"))));
        let child = PluginHandler::new(
            "child",
            "getStatus",
            None,
            handler(|p: HandlerParams| {
                let inner = p.base.expect("base handler").call(json!({}))?;
                Ok(json!(format!("child+{}", inner.as_str().unwrap_or_default())))
            }),
        )
        .with_base(Some(base));

        assert_eq!(child.call(json!({})).unwrap(), json!("child+base"));
        assert_eq!(child.base_depth(), 1);
    }

    #[test]
    fn test_handler_without_base_has_zero_depth() {
        let h = PluginHandler::new("p", "configureProvider", None, returns(json!(null)));
        assert!(h.base.is_none());
        assert_eq!(h.base_depth(), 0);
    }

    #[test]
    fn test_same_function_tracks_closure_identity() {
        let func = returns(json!(1));
        let a = PluginHandler::new("a", "x", None, func.clone());
        let b = PluginHandler::new("b", "x", None, func);
        let c = PluginHandler::new("c", "x", None, returns(json!(1)));
        assert!(a.same_function(&b));
        assert!(!a.same_function(&c));
    }

    #[test]
    fn test_definition_builder() {
        let def = PluginDefinition::new("child")
            .with_base("parent")
            .with_dependencies(["dep-a", "dep-b"])
            .with_handler("configureProvider", returns(json!({})))
            .create_module_type(ModuleTypeSpec::new("foo", "Foo modules"));

        assert_eq!(def.base.as_deref(), Some("parent"));
        assert_eq!(def.dependencies, vec!["dep-a", "dep-b"]);
        assert_eq!(def.references().collect::<Vec<_>>(), vec!["parent", "dep-a", "dep-b"]);
        assert!(def.handlers.contains_key("configureProvider"));
        assert_eq!(def.create_module_types[0].name, "foo");
    }

    #[test]
    fn test_module_type_definition_from_spec() {
        let spec = ModuleTypeSpec::new("foo", "Foo")
            .with_base("bar")
            .with_handler("configure", returns(json!({})));
        let def = ModuleTypeDefinition::from_spec("plugin-a", &spec);

        assert_eq!(def.plugin_name, "plugin-a");
        assert_eq!(def.owner, "plugin-a");
        assert_eq!(def.base.as_deref(), Some("bar"));
        let h = &def.handlers["configure"];
        assert_eq!(h.module_type.as_deref(), Some("foo"));
        assert_eq!(h.plugin_name, "plugin-a");
        assert!(h.base.is_none());
    }

    #[test]
    fn test_tool_deserializes_type_field() {
        let tool: PluginTool = serde_json::from_value(json!({
            "name": "kubectl",
            "type": "binary",
            "description": "The kubectl CLI",
            "builds": [{
                "platform": "linux",
                "architecture": "amd64",
                "url": "https://example.com/kubectl",
                "sha256": "abc"
            }]
        }))
        .unwrap();
        assert_eq!(tool.tool_type, ToolType::Binary);
        assert_eq!(tool.builds.len(), 1);
    }
}
