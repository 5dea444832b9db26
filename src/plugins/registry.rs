//! Plugin registry and resolver for garden-core
//!
//! This module provides the `PluginRegistry` struct, which stores declared
//! plugins by name and resolves them on demand. Resolution walks a plugin's
//! `base` chain from the root-most ancestor down, merging handlers,
//! commands, tools and module types one generation at a time. Every
//! resolved plugin is memoized, so each generation is merged once.
//!
//! Structural problems (unknown plugins, circular bases or dependencies,
//! redeclared or dangling module types) are reported eagerly from
//! [`PluginRegistry::get_plugin`] and [`PluginRegistry::get_all_plugins`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::config::PluginsConfig;
use crate::error::{GardenError, Result};

use super::graph::{find_cycle, format_cycle};
use super::types::{
    ModuleTypeDefinition, ModuleTypeExtension, ModuleTypeExtensionSpec, PluginCommand,
    PluginDefinition, PluginHandler, ResolvedPlugin,
};

static PLUGIN_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9\-]{0,62}$").expect("plugin name regex is valid"));

/// A registry of declared plugins with memoized resolution.
///
/// The registry is told which plugins are *configured* (referenced by
/// provider configuration). That set decides how module type extensions
/// inherited through a base chain are merged: extensions of a module type
/// whose creating plugin is configured stay separate, otherwise they are
/// coalesced.
///
/// # Example
///
/// ```rust
/// use garden_core::plugins::{handler, PluginDefinition, PluginRegistry};
/// use serde_json::json;
///
/// let mut registry = PluginRegistry::new().with_configured(["child"]);
/// registry
///     .register(vec![
///         PluginDefinition::new("parent")
///             .with_handler("configureProvider", handler(|_| Ok(json!({ "from": "parent" })))),
///         PluginDefinition::new("child")
///             .with_base("parent")
///             .with_handler("configureProvider", handler(|_| Ok(json!({ "from": "child" })))),
///     ])
///     .unwrap();
///
/// let child = registry.get_plugin("child").unwrap();
/// let configure = child.handler("configureProvider").unwrap();
/// assert_eq!(configure.plugin_name, "child");
/// assert_eq!(configure.base.as_ref().unwrap().plugin_name, "parent");
/// ```
pub struct PluginRegistry {
    /// Map from plugin name to its declaration.
    plugins: HashMap<String, PluginDefinition>,

    /// Plugin names in registration order.
    order: Vec<String>,

    /// Names of the plugins referenced by provider configuration.
    configured: Vec<String>,

    /// Memoized resolution results.
    resolved: Mutex<HashMap<String, Arc<ResolvedPlugin>>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry with no configured plugins.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            order: Vec::new(),
            configured: Vec::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty registry whose configured plugins are the providers
    /// named in `config`.
    pub fn from_config(config: &PluginsConfig) -> Self {
        Self::new().with_configured(config.providers.iter().cloned())
    }

    /// Set the plugins referenced by provider configuration.
    pub fn with_configured<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configured = names.into_iter().map(Into::into).collect();
        self.cache().clear();
        self
    }

    /// Names of the configured plugins, in configuration order.
    pub fn configured(&self) -> &[String] {
        &self.configured
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.configured.iter().any(|c| c == name)
    }

    /// Register plugin definitions.
    ///
    /// No resolution happens here. The whole batch is checked before any
    /// plugin is stored, so a failed call leaves the registry unchanged.
    ///
    /// # Errors
    /// `GardenError::Configuration` if a name is not a valid identifier or is
    /// already taken, either by a registered plugin or earlier in the batch.
    pub fn register(&mut self, plugins: Vec<PluginDefinition>) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &plugins {
            if !PLUGIN_NAME_RE.is_match(&plugin.name) {
                return Err(GardenError::Configuration(format!(
                    "Invalid plugin name '{}': must start with a lowercase letter and contain only lowercase letters, digits and dashes (max 63 characters)",
                    plugin.name
                )));
            }
            if self.plugins.contains_key(&plugin.name) || !seen.insert(plugin.name.as_str()) {
                return Err(GardenError::Configuration(format!(
                    "Plugin '{}' is registered more than once.",
                    plugin.name
                )));
            }
        }

        for plugin in plugins {
            info!(
                plugin = %plugin.name,
                base = ?plugin.base,
                dependencies = plugin.dependencies.len(),
                "Registered plugin"
            );
            self.order.push(plugin.name.clone());
            self.plugins.insert(plugin.name.clone(), plugin);
        }
        self.cache().clear();

        Ok(())
    }

    /// Get the number of registered plugins.
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Registered plugin names in registration order.
    pub fn plugin_names(&self) -> &[String] {
        &self.order
    }

    /// Resolve a plugin and its whole base chain.
    ///
    /// The plugin's base and dependency closure is validated first, so
    /// problems anywhere in that closure surface here.
    ///
    /// # Errors
    /// - `GardenError::Configuration` for unknown plugins, bases, dependencies
    ///   or module type bases
    /// - `GardenError::Plugin` for cycles and redeclared module types
    pub fn get_plugin(&self, name: &str) -> Result<Arc<ResolvedPlugin>> {
        if let Some(resolved) = self.cache().get(name) {
            return Ok(resolved.clone());
        }

        if !self.plugins.contains_key(name) {
            return Err(GardenError::Configuration(format!(
                "Could not find plugin '{}'. Are you missing a provider configuration?",
                name
            )));
        }

        self.validate(&[name.to_string()])?;
        self.resolve(name)
    }

    /// Resolve every registered plugin, configured or not.
    pub fn get_all_plugins(&self) -> Result<Vec<Arc<ResolvedPlugin>>> {
        self.validate(&self.order)?;
        self.order.iter().map(|name| self.resolve(name)).collect()
    }

    /// Merge the module types of every plugin in play.
    ///
    /// Plugins in play are the configured ones, or every registered plugin
    /// when nothing is configured. Created module types are collected first,
    /// then extensions are applied as patches, each handler linked to the
    /// handler it replaces.
    pub fn get_module_types(&self) -> Result<BTreeMap<String, ModuleTypeDefinition>> {
        let active: Vec<String> = if self.configured.is_empty() {
            self.order.clone()
        } else {
            self.configured.clone()
        };
        let plugins = active
            .iter()
            .map(|name| self.get_plugin(name))
            .collect::<Result<Vec<_>>>()?;

        let mut module_types: BTreeMap<String, ModuleTypeDefinition> = BTreeMap::new();

        for plugin in &plugins {
            for spec in &plugin.create_module_types {
                if let Some(existing) = module_types.get(&spec.name) {
                    if existing.owner != spec.owner {
                        return Err(GardenError::Plugin(format!(
                            "Module type '{}' is declared in multiple plugins: '{}' and '{}'.",
                            spec.name, existing.owner, spec.owner
                        )));
                    }
                    continue;
                }
                module_types.insert(spec.name.clone(), spec.clone());
            }
        }

        for plugin in &plugins {
            for extension in &plugin.extend_module_types {
                let Some(target) = module_types.get_mut(&extension.name) else {
                    if self.find_module_type_creator(&extension.name, None).is_none() {
                        return Err(GardenError::Configuration(format!(
                            "Plugin '{}' extends module type '{}' but the module type has not been declared. The '{}' plugin is likely missing a dependency declaration. Please report an issue with the author.",
                            plugin.name, extension.name, plugin.name
                        )));
                    }
                    debug!(
                        plugin = %plugin.name,
                        module_type = %extension.name,
                        "Skipping extension of a module type that is not in play"
                    );
                    continue;
                };

                for (handler_type, handler) in &extension.handlers {
                    let patched = if extension.coalesced && handler.base.is_some() {
                        handler.clone()
                    } else {
                        let current = target.handlers.get(handler_type).cloned();
                        Arc::new(handler.as_ref().clone().with_base(current))
                    };
                    target.handlers.insert(handler_type.clone(), patched);
                }
            }
        }

        Ok(module_types)
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<ResolvedPlugin>>> {
        self.resolved.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, name: &str) -> Result<Arc<ResolvedPlugin>> {
        let chain = self.base_chain(name)?;

        let mut accumulated: Option<Arc<ResolvedPlugin>> = None;
        for generation in chain.iter().rev() {
            if let Some(cached) = self.cache().get(generation).cloned() {
                accumulated = Some(cached);
                continue;
            }

            let definition = self.definition(generation)?;
            let resolved = Arc::new(self.merge_generation(definition, accumulated.as_deref())?);
            debug!(
                plugin = %generation,
                handlers = resolved.handlers.len(),
                module_types = resolved.create_module_types.len(),
                "Resolved plugin"
            );
            self.cache().insert(generation.clone(), resolved.clone());
            accumulated = Some(resolved);
        }

        accumulated.ok_or_else(|| {
            GardenError::Configuration(format!("Could not resolve plugin '{}'", name))
        })
    }

    fn definition(&self, name: &str) -> Result<&PluginDefinition> {
        self.plugins.get(name).ok_or_else(|| {
            GardenError::Configuration(format!(
                "Could not find plugin '{}'. Are you missing a provider configuration?",
                name
            ))
        })
    }

    /// `[name, base, base-of-base, ...]`, failing on loops and unknown bases.
    fn base_chain(&self, name: &str) -> Result<Vec<String>> {
        let mut chain = vec![name.to_string()];
        let mut current = self.definition(name)?;

        while let Some(base) = current.base.as_deref() {
            if let Some(pos) = chain.iter().position(|n| n == base) {
                let mut cycle = chain[pos..].to_vec();
                cycle.push(base.to_string());
                return Err(circular_plugins(&cycle));
            }
            let base_definition = self
                .plugins
                .get(base)
                .ok_or_else(|| missing_base(&current.name, base))?;
            chain.push(base.to_string());
            current = base_definition;
        }

        Ok(chain)
    }

    /// Merge one generation onto its already resolved base.
    fn merge_generation(
        &self,
        definition: &PluginDefinition,
        base: Option<&ResolvedPlugin>,
    ) -> Result<ResolvedPlugin> {
        let name = definition.name.as_str();

        // Own dependencies first, then inherited ones not already listed.
        let mut dependencies = definition.dependencies.clone();
        for dep in base.map(|b| b.dependencies.as_slice()).unwrap_or_default() {
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }

        let mut handlers = base.map(|b| b.handlers.clone()).unwrap_or_default();
        for (handler_type, func) in &definition.handlers {
            let overridden = handlers.get(handler_type).cloned();
            let handler = PluginHandler::new(name, handler_type.clone(), None, func.clone())
                .with_base(overridden);
            handlers.insert(handler_type.clone(), Arc::new(handler));
        }

        let mut commands: Vec<Arc<PluginCommand>> =
            base.map(|b| b.commands.clone()).unwrap_or_default();
        for command in &definition.commands {
            match commands.iter().position(|c| c.name == command.name) {
                Some(pos) => {
                    let overridden = commands[pos].clone();
                    commands[pos] = Arc::new(command.clone().with_base(Some(overridden)));
                }
                None => commands.push(Arc::new(command.clone())),
            }
        }

        let mut tools = base.map(|b| b.tools.clone()).unwrap_or_default();
        for tool in &definition.tools {
            match tools.iter().position(|t| t.name == tool.name) {
                Some(pos) => tools[pos] = tool.clone(),
                None => tools.push(tool.clone()),
            }
        }

        // A configured base owns its module types and extensions; an
        // unconfigured one hands them down to this plugin.
        let base_configured = base.map(|b| self.is_configured(&b.name)).unwrap_or(false);

        let mut create_module_types = Vec::new();
        let mut extend_module_types = Vec::new();
        if let Some(base) = base {
            if !base_configured {
                create_module_types = base
                    .create_module_types
                    .iter()
                    .cloned()
                    .map(|mut spec| {
                        spec.owner = name.to_string();
                        spec
                    })
                    .collect();
                extend_module_types = base.extend_module_types.clone();
            }
        }

        // Checked against every ancestor, configured or not.
        let ancestors = self.base_chain(name)?;
        for spec in &definition.create_module_types {
            let declared_by_ancestor = ancestors[1..]
                .iter()
                .filter_map(|ancestor| self.plugins.get(ancestor))
                .any(|ancestor| ancestor.create_module_types.iter().any(|t| t.name == spec.name));
            if declared_by_ancestor {
                return Err(GardenError::Plugin(format!(
                    "Plugin '{}' redeclares the '{}' module type, already declared by its base.",
                    name, spec.name
                )));
            }
            create_module_types.push(ModuleTypeDefinition::from_spec(name, spec));
        }

        for extension in &definition.extend_module_types {
            if let Some(created) = create_module_types
                .iter_mut()
                .find(|c| c.name == extension.name)
            {
                merge_extension_handlers(&mut created.handlers, name, extension, &BTreeMap::new());
                continue;
            }

            let creator = self.find_module_type_creator(&extension.name, None);
            let creator_handlers = creator
                .map(|c| creator_handlers(c, &extension.name))
                .unwrap_or_default();
            let creator_configured = creator.map(|c| self.is_configured(&c.name)).unwrap_or(false);

            if creator_configured {
                let mut handlers = BTreeMap::new();
                merge_extension_handlers(&mut handlers, name, extension, &creator_handlers);
                extend_module_types.push(ModuleTypeExtension {
                    name: extension.name.clone(),
                    plugin_name: name.to_string(),
                    coalesced: false,
                    handlers,
                });
                continue;
            }

            match extend_module_types
                .iter_mut()
                .find(|e| e.name == extension.name)
            {
                Some(existing) => {
                    merge_extension_handlers(
                        &mut existing.handlers,
                        name,
                        extension,
                        &creator_handlers,
                    );
                    existing.plugin_name = name.to_string();
                    existing.coalesced = true;
                }
                None => {
                    let mut handlers = BTreeMap::new();
                    merge_extension_handlers(&mut handlers, name, extension, &creator_handlers);
                    extend_module_types.push(ModuleTypeExtension {
                        name: extension.name.clone(),
                        plugin_name: name.to_string(),
                        coalesced: true,
                        handlers,
                    });
                }
            }
        }

        Ok(ResolvedPlugin {
            name: name.to_string(),
            base: definition.base.clone(),
            docs: definition
                .docs
                .clone()
                .or_else(|| base.and_then(|b| b.docs.clone())),
            dependencies,
            handlers,
            commands,
            tools,
            create_module_types,
            extend_module_types,
            config_schema: definition
                .config_schema
                .clone()
                .or_else(|| base.and_then(|b| b.config_schema.clone())),
        })
    }

    /// First registered plugin that creates `module_type`, optionally
    /// restricted to `within`.
    fn find_module_type_creator(
        &self,
        module_type: &str,
        within: Option<&BTreeSet<String>>,
    ) -> Option<&PluginDefinition> {
        self.order
            .iter()
            .filter(|name| within.map(|set| set.contains(*name)).unwrap_or(true))
            .filter_map(|name| self.plugins.get(name))
            .find(|plugin| plugin.create_module_types.iter().any(|t| t.name == module_type))
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    fn validate(&self, roots: &[String]) -> Result<()> {
        let reachable = self.reachable(roots)?;

        let graph: BTreeMap<String, Vec<String>> = reachable
            .iter()
            .filter_map(|name| self.plugins.get(name))
            .map(|plugin| {
                (
                    plugin.name.clone(),
                    plugin.references().map(String::from).collect(),
                )
            })
            .collect();
        if let Some(cycle) = find_cycle(&graph) {
            return Err(circular_plugins(&cycle));
        }

        self.validate_module_type_bases(&reachable)
    }

    /// Everything reachable from `roots` through `base` and `dependencies`,
    /// roots included.
    fn reachable(&self, roots: &[String]) -> Result<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let plugin = self.definition(&name)?;

            if let Some(base) = plugin.base.as_deref() {
                if !self.plugins.contains_key(base) {
                    return Err(missing_base(&plugin.name, base));
                }
                queue.push_back(base.to_string());
            }
            for dep in &plugin.dependencies {
                if !self.plugins.contains_key(dep) {
                    return Err(GardenError::Configuration(format!(
                        "Plugin '{}' lists '{}' as a dependency, but that plugin has not been registered.",
                        plugin.name, dep
                    )));
                }
                queue.push_back(dep.clone());
            }
        }

        Ok(seen)
    }

    fn validate_module_type_bases(&self, plugins: &BTreeSet<String>) -> Result<()> {
        let mut graph: BTreeMap<(String, String), Vec<(String, String)>> = BTreeMap::new();

        for name in plugins {
            let plugin = self.definition(name)?;
            let closure = self.reachable(std::slice::from_ref(name))?;

            for spec in &plugin.create_module_types {
                let mut edges = Vec::new();

                if let Some(base_type) = spec.base.as_deref() {
                    let creator = self
                        .find_module_type_creator(base_type, Some(&closure))
                        .or_else(|| self.find_module_type_creator(base_type, None));

                    match creator {
                        None => {
                            return Err(GardenError::Configuration(format!(
                                "Module type '{}', defined in plugin '{}', specifies base module type '{}' which cannot be found. The plugin is likely missing a dependency declaration. Please report an issue with the author.",
                                spec.name, plugin.name, base_type
                            )));
                        }
                        Some(creator) if !closure.contains(&creator.name) => {
                            return Err(GardenError::Configuration(format!(
                                "Module type '{}', defined in plugin '{}', specifies base module type '{}' which is defined by '{}' but '{}' does not specify a dependency on that plugin. Plugins must explicitly declare dependencies on plugins that define module types they reference. Please report an issue with the author.",
                                spec.name, plugin.name, base_type, creator.name, plugin.name
                            )));
                        }
                        Some(creator) => {
                            edges.push((creator.name.clone(), base_type.to_string()));
                        }
                    }
                }

                graph.insert((plugin.name.clone(), spec.name.clone()), edges);
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(GardenError::Plugin(format!(
                "Found circular dependency between module type bases:\n\n{}",
                format_cycle(&cycle, |(plugin, module_type)| {
                    format!("{} (from plugin {})", module_type, plugin)
                })
            )));
        }

        Ok(())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn circular_plugins(cycle: &[String]) -> GardenError {
    GardenError::Plugin(format!(
        "Found a circular dependency between registered plugins:\n\n{}",
        cycle.join(" <- ")
    ))
}

fn missing_base(plugin: &str, base: &str) -> GardenError {
    GardenError::Configuration(format!(
        "Plugin '{}' specifies plugin '{}' as a base, but that plugin has not been registered.",
        plugin, base
    ))
}

/// Handlers of `module_type` as created by `creator`, without base links.
fn creator_handlers(
    creator: &PluginDefinition,
    module_type: &str,
) -> BTreeMap<String, Arc<PluginHandler>> {
    creator
        .create_module_types
        .iter()
        .find(|t| t.name == module_type)
        .map(|spec| ModuleTypeDefinition::from_spec(&creator.name, spec).handlers)
        .unwrap_or_default()
}

/// Lay the handlers of `extension` over `target`.
///
/// Each new handler links to the handler it replaces in `target`, or failing
/// that to the same handler type in `fallback`.
fn merge_extension_handlers(
    target: &mut BTreeMap<String, Arc<PluginHandler>>,
    plugin_name: &str,
    extension: &ModuleTypeExtensionSpec,
    fallback: &BTreeMap<String, Arc<PluginHandler>>,
) {
    for (handler_type, func) in &extension.handlers {
        let overridden = target
            .get(handler_type)
            .or_else(|| fallback.get(handler_type))
            .cloned();
        let handler = PluginHandler::new(
            plugin_name,
            handler_type.clone(),
            Some(extension.name.clone()),
            func.clone(),
        )
        .with_base(overridden);
        target.insert(handler_type.clone(), Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::types::{
        handler, HandlerFn, ModuleTypeSpec, PluginTool, ToolBuild, ToolType,
    };
    use serde_json::{json, Value};

    fn returns(value: Value) -> HandlerFn {
        handler(move |_| Ok(value.clone()))
    }

    fn registry(configured: &[&str], plugins: Vec<PluginDefinition>) -> PluginRegistry {
        let mut registry = PluginRegistry::new().with_configured(configured.iter().copied());
        registry.register(plugins).unwrap();
        registry
    }

    fn tool(name: &str, description: &str) -> PluginTool {
        PluginTool {
            name: name.to_string(),
            tool_type: ToolType::Binary,
            description: description.to_string(),
            builds: vec![ToolBuild {
                platform: "linux".to_string(),
                architecture: "amd64".to_string(),
                url: format!("https://example.com/{}", name),
                sha256: "deadbeef".to_string(),
            }],
        }
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.plugin_count(), 0);
        assert!(registry.plugin_names().is_empty());
        assert!(registry.get_all_plugins().unwrap().is_empty());
    }

    #[test]
    fn test_registry_default_is_empty() {
        let registry = PluginRegistry::default();
        assert_eq!(registry.plugin_count(), 0);
        assert!(registry.configured().is_empty());
    }

    #[test]
    fn test_registry_from_config() {
        let config = PluginsConfig {
            providers: vec!["container".to_string(), "exec".to_string()],
        };
        let mut registry = PluginRegistry::from_config(&config);
        assert_eq!(registry.configured(), ["container", "exec"]);
        assert!(registry.is_configured("exec"));
        assert!(!registry.is_configured("base"));

        registry
            .register(vec![
                PluginDefinition::new("base").create_module_type(ModuleTypeSpec::new("foo", "Foo")),
                PluginDefinition::new("exec").with_base("base"),
                PluginDefinition::new("container"),
            ])
            .unwrap();
        let module_types = registry.get_module_types().unwrap();
        assert_eq!(module_types["foo"].owner, "exec");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .register(vec![PluginDefinition::new("test"), PluginDefinition::new("test")])
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Plugin 'test' is registered more than once."));
        assert_eq!(registry.plugin_count(), 0);

        registry.register(vec![PluginDefinition::new("test")]).unwrap();
        assert!(registry.register(vec![PluginDefinition::new("test")]).is_err());
        assert_eq!(registry.plugin_count(), 1);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry.register(vec![PluginDefinition::new("Bad_Name")]).unwrap_err();
        assert!(err.to_string().contains("Invalid plugin name 'Bad_Name'"));
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = registry(&[], vec![]);
        let err = registry.get_plugin("nope").unwrap_err();
        assert!(err.to_string().contains("Could not find plugin 'nope'"));
    }

    #[test]
    fn test_handlers_inherit_and_override() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("base")
                    .with_handler("configureProvider", returns(json!("base-configure")))
                    .with_handler("getEnvironmentStatus", returns(json!("base-status"))),
                PluginDefinition::new("child")
                    .with_base("base")
                    .with_handler("configureProvider", returns(json!("child-configure"))),
            ],
        );

        let base = registry.get_plugin("base").unwrap();
        let child = registry.get_plugin("child").unwrap();

        let configure = child.handler("configureProvider").unwrap();
        assert_eq!(configure.call(json!({})).unwrap(), json!("child-configure"));
        let configure_base = configure.base.as_ref().unwrap();
        assert_eq!(configure_base.plugin_name, "base");
        assert_eq!(configure_base.handler_type, "configureProvider");
        assert!(configure_base.module_type.is_none());
        assert_eq!(configure_base.call(json!({})).unwrap(), json!("base-configure"));

        // Not overridden: passed through untouched, no base attached.
        let status = child.handler("getEnvironmentStatus").unwrap();
        assert!(Arc::ptr_eq(status, base.handler("getEnvironmentStatus").unwrap()));
        assert!(status.base.is_none());
    }

    #[test]
    fn test_handler_base_chain_across_three_generations() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("grandparent")
                    .with_handler("configureProvider", returns(json!(1))),
                PluginDefinition::new("parent")
                    .with_base("grandparent")
                    .with_handler("configureProvider", returns(json!(2))),
                PluginDefinition::new("child")
                    .with_base("parent")
                    .with_handler("configureProvider", returns(json!(3))),
            ],
        );

        let child = registry.get_plugin("child").unwrap();
        let handler = child.handler("configureProvider").unwrap();
        assert_eq!(handler.base_depth(), 2);
        let parent = handler.base.as_ref().unwrap();
        let grandparent = parent.base.as_ref().unwrap();
        assert_eq!(parent.plugin_name, "parent");
        assert_eq!(grandparent.plugin_name, "grandparent");
        assert!(grandparent.base.is_none());
        assert_eq!(grandparent.call(json!(null)).unwrap(), json!(1));
    }

    #[test]
    fn test_overriding_handler_can_delegate_to_base() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("base")
                    .with_handler("getOutputs", returns(json!({ "a": 1 }))),
                PluginDefinition::new("child").with_base("base").with_handler(
                    "getOutputs",
                    handler(|p| {
                        let mut outputs = match &p.base {
                            Some(base) => base.call(p.params.clone())?,
                            None => json!({}),
                        };
                        outputs["b"] = json!(2);
                        Ok(outputs)
                    }),
                ),
            ],
        );

        let child = registry.get_plugin("child").unwrap();
        let outputs = child.handler("getOutputs").unwrap().call(json!({})).unwrap();
        assert_eq!(outputs, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_resolution_is_memoized() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("base"),
                PluginDefinition::new("child").with_base("base"),
            ],
        );
        let first = registry.get_plugin("child").unwrap();
        let second = registry.get_plugin("child").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let all = registry.get_all_plugins().unwrap();
        assert!(Arc::ptr_eq(&all[1], &first));
    }

    #[test]
    fn test_dependencies_merge_order() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("dep-a"),
                PluginDefinition::new("dep-b"),
                PluginDefinition::new("dep-c"),
                PluginDefinition::new("grandparent").with_dependencies(["dep-c", "dep-a"]),
                PluginDefinition::new("parent")
                    .with_base("grandparent")
                    .with_dependencies(["dep-b"]),
                PluginDefinition::new("child")
                    .with_base("parent")
                    .with_dependencies(["dep-a"]),
            ],
        );
        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.dependencies, vec!["dep-a", "dep-b", "dep-c"]);
    }

    #[test]
    fn test_missing_base() {
        let registry = registry(&[], vec![PluginDefinition::new("child").with_base("nope")]);
        let err = registry.get_plugin("child").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains(
            "Plugin 'child' specifies plugin 'nope' as a base, but that plugin has not been registered."
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let registry = registry(&[], vec![PluginDefinition::new("a").with_dependencies(["nope"])]);
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.to_string().contains("Plugin 'a' lists 'nope' as a dependency"));
    }

    #[test]
    fn test_circular_base() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("plugin-a").with_base("plugin-b"),
                PluginDefinition::new("plugin-b").with_base("plugin-a"),
            ],
        );
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.is_plugin());
        assert!(err.to_string().contains(
            "Found a circular dependency between registered plugins:\n\nplugin-a <- plugin-b <- plugin-a"
        ));
    }

    #[test]
    fn test_circular_dependencies() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("plugin-a").with_dependencies(["plugin-b"]),
                PluginDefinition::new("plugin-b").with_dependencies(["plugin-a"]),
            ],
        );
        let err = registry.get_plugin("plugin-b").unwrap_err();
        assert!(err.to_string().contains("plugin-a <- plugin-b <- plugin-a"));
    }

    #[test]
    fn test_self_dependency() {
        let registry = registry(
            &[],
            vec![PluginDefinition::new("plugin-a").with_dependencies(["plugin-a"])],
        );
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.to_string().contains("plugin-a <- plugin-a"));
    }

    #[test]
    fn test_errors_surface_for_unconfigured_plugins() {
        let registry = registry(
            &["fine"],
            vec![
                PluginDefinition::new("fine"),
                PluginDefinition::new("broken").with_base("missing"),
            ],
        );
        assert!(registry.get_plugin("fine").is_ok());
        assert!(registry.get_all_plugins().is_err());
    }

    #[test]
    fn test_commands_override_with_base_chain() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("grandparent")
                    .with_command(PluginCommand::new("foo", "grandparent foo", returns(json!(1))))
                    .with_command(PluginCommand::new("bar", "grandparent bar", returns(json!(1)))),
                PluginDefinition::new("parent")
                    .with_base("grandparent")
                    .with_command(PluginCommand::new("foo", "parent foo", returns(json!(2)))),
                PluginDefinition::new("child")
                    .with_base("parent")
                    .with_command(
                        PluginCommand::new("foo", "child foo", returns(json!(3)))
                            .with_resolve_graph(false),
                    ),
            ],
        );

        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.commands.len(), 2);

        let foo = child.command("foo").unwrap();
        assert_eq!(foo.description, "child foo");
        assert!(!foo.resolve_graph);
        assert_eq!(foo.call(json!({})).unwrap(), json!(3));
        let foo_base = foo.base.as_ref().unwrap();
        assert_eq!(foo_base.description, "parent foo");
        assert_eq!(foo_base.base.as_ref().unwrap().description, "grandparent foo");
        assert!(foo_base.base.as_ref().unwrap().base.is_none());

        let bar = child.command("bar").unwrap();
        assert_eq!(bar.description, "grandparent bar");
        assert!(bar.base.is_none());
    }

    #[test]
    fn test_tools_override_replaces() {
        let mut overriding = tool("kubectl", "child kubectl");
        overriding.builds.clear();

        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("base")
                    .with_tool(tool("kubectl", "base kubectl"))
                    .with_tool(tool("helm", "base helm")),
                PluginDefinition::new("child").with_base("base").with_tool(overriding.clone()),
            ],
        );

        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.tools.len(), 2);
        assert_eq!(child.tool("kubectl").unwrap(), &overriding);
        assert_eq!(child.tool("helm").unwrap().description, "base helm");
    }

    #[test]
    fn test_module_types_inherited_from_unconfigured_base() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("base").create_module_type(
                    ModuleTypeSpec::new("foo", "Foo")
                        .with_handler("configure", returns(json!("base"))),
                ),
                PluginDefinition::new("child").with_base("base"),
            ],
        );
        let child = registry.get_plugin("child").unwrap();
        let foo = child.created_module_type("foo").unwrap();
        assert_eq!(foo.plugin_name, "base");
        assert_eq!(foo.owner, "child");

        let module_types = registry.get_module_types().unwrap();
        assert_eq!(module_types["foo"].owner, "child");
    }

    #[test]
    fn test_configured_base_keeps_its_module_types() {
        let registry = registry(
            &["base", "child"],
            vec![
                PluginDefinition::new("base").create_module_type(ModuleTypeSpec::new("foo", "Foo")),
                PluginDefinition::new("child").with_base("base"),
            ],
        );
        let child = registry.get_plugin("child").unwrap();
        assert!(child.create_module_types.is_empty());
        let module_types = registry.get_module_types().unwrap();
        assert_eq!(module_types["foo"].owner, "base");
    }

    #[test]
    fn test_redeclared_module_type() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("base").create_module_type(ModuleTypeSpec::new("foo", "Foo")),
                PluginDefinition::new("child")
                    .with_base("base")
                    .create_module_type(ModuleTypeSpec::new("foo", "Foo again")),
            ],
        );
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.is_plugin());
        assert!(err.to_string().contains(
            "Plugin 'child' redeclares the 'foo' module type, already declared by its base."
        ));
    }

    #[test]
    fn test_redeclared_module_type_of_configured_ancestor() {
        let registry = registry(
            &["grandparent", "child"],
            vec![
                PluginDefinition::new("grandparent")
                    .create_module_type(ModuleTypeSpec::new("foo", "Foo")),
                PluginDefinition::new("parent").with_base("grandparent").extend_module_type(
                    ModuleTypeExtensionSpec::new("foo").with_handler("build", returns(json!(1))),
                ),
                PluginDefinition::new("child")
                    .with_base("parent")
                    .create_module_type(ModuleTypeSpec::new("foo", "Foo again")),
            ],
        );

        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.is_plugin());
        assert!(err.to_string().contains(
            "Plugin 'child' redeclares the 'foo' module type, already declared by its base."
        ));
        assert!(registry.get_plugin("child").is_err());
        assert!(registry.get_plugin("parent").is_ok());
    }

    #[test]
    fn test_module_type_base_not_found() {
        let registry = registry(
            &[],
            vec![PluginDefinition::new("foo")
                .create_module_type(ModuleTypeSpec::new("foo", "Foo").with_base("bar"))],
        );
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.to_string().contains(
            "Module type 'foo', defined in plugin 'foo', specifies base module type 'bar' which cannot be found."
        ));
        assert!(err.to_string().contains("likely missing a dependency declaration"));
    }

    #[test]
    fn test_module_type_base_without_dependency() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("base").create_module_type(ModuleTypeSpec::new("bar", "Bar")),
                PluginDefinition::new("foo")
                    .create_module_type(ModuleTypeSpec::new("foo", "Foo").with_base("bar")),
            ],
        );
        let err = registry.get_plugin("foo").unwrap_err();
        assert!(err.to_string().contains(
            "which is defined by 'base' but 'foo' does not specify a dependency on that plugin."
        ));
    }

    #[test]
    fn test_module_type_base_with_dependency() {
        let registry = registry(
            &["base", "foo"],
            vec![
                PluginDefinition::new("base").create_module_type(ModuleTypeSpec::new("bar", "Bar")),
                PluginDefinition::new("foo")
                    .with_dependencies(["base"])
                    .create_module_type(ModuleTypeSpec::new("foo", "Foo").with_base("bar")),
            ],
        );
        assert!(registry.get_all_plugins().is_ok());
        let module_types = registry.get_module_types().unwrap();
        assert_eq!(module_types["foo"].base.as_deref(), Some("bar"));
    }

    #[test]
    fn test_circular_module_type_bases() {
        let registry = registry(
            &[],
            vec![PluginDefinition::new("foo")
                .create_module_type(ModuleTypeSpec::new("foo", "Foo").with_base("bar"))
                .create_module_type(ModuleTypeSpec::new("bar", "Bar").with_base("foo"))],
        );
        let err = registry.get_all_plugins().unwrap_err();
        assert!(err.is_plugin());
        assert!(err.to_string().contains(
            "Found circular dependency between module type bases:\n\nbar (from plugin foo) <- foo (from plugin foo) <- bar (from plugin foo)"
        ));
    }

    #[test]
    fn test_extension_kept_separate_when_creator_configured() {
        let registry = registry(
            &["container", "base", "child"],
            vec![
                PluginDefinition::new("container").create_module_type(
                    ModuleTypeSpec::new("container", "Containers")
                        .with_handler("build", returns(json!("container-build"))),
                ),
                PluginDefinition::new("base").with_dependencies(["container"]).extend_module_type(
                    ModuleTypeExtensionSpec::new("container")
                        .with_handler("build", returns(json!("base-build"))),
                ),
                PluginDefinition::new("child").with_base("base").extend_module_type(
                    ModuleTypeExtensionSpec::new("container")
                        .with_handler("build", returns(json!("child-build"))),
                ),
            ],
        );

        // The base is configured, so the child only carries its own extension.
        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.extend_module_types.len(), 1);
        let ext = &child.extend_module_types[0];
        assert!(!ext.coalesced);
        let build = &ext.handlers["build"];
        assert_eq!(build.plugin_name, "child");
        assert_eq!(build.module_type.as_deref(), Some("container"));
        assert_eq!(build.base.as_ref().unwrap().plugin_name, "container");

        let module_types = registry.get_module_types().unwrap();
        let build = &module_types["container"].handlers["build"];
        assert_eq!(build.call(json!({})).unwrap(), json!("child-build"));
        let below = build.base.as_ref().unwrap();
        assert_eq!(below.call(json!({})).unwrap(), json!("base-build"));
        assert_eq!(below.base.as_ref().unwrap().plugin_name, "container");
    }

    #[test]
    fn test_extensions_coalesced_when_creator_not_configured() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("container").create_module_type(
                    ModuleTypeSpec::new("container", "Containers")
                        .with_handler("build", returns(json!("container-build")))
                        .with_handler("publish", returns(json!("container-publish"))),
                ),
                PluginDefinition::new("base").with_dependencies(["container"]).extend_module_type(
                    ModuleTypeExtensionSpec::new("container")
                        .with_handler("build", returns(json!("base-build")))
                        .with_handler("publish", returns(json!("base-publish"))),
                ),
                PluginDefinition::new("child").with_base("base").extend_module_type(
                    ModuleTypeExtensionSpec::new("container")
                        .with_handler("build", returns(json!("child-build"))),
                ),
            ],
        );

        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.extend_module_types.len(), 1);
        let ext = child.module_type_extension("container").unwrap();
        assert!(ext.coalesced);

        let build = &ext.handlers["build"];
        assert_eq!(build.plugin_name, "child");
        let base_build = build.base.as_ref().unwrap();
        assert_eq!(base_build.plugin_name, "base");
        let root_build = base_build.base.as_ref().unwrap();
        assert_eq!(root_build.plugin_name, "container");
        assert_eq!(root_build.call(json!({})).unwrap(), json!("container-build"));
        assert!(root_build.base.is_none());

        // Not redeclared by the child: inherited as-is from the base's extension.
        let publish = &ext.handlers["publish"];
        assert_eq!(publish.plugin_name, "base");
        assert_eq!(publish.base.as_ref().unwrap().plugin_name, "container");
    }

    #[test]
    fn test_extension_of_inherited_module_type_merges_into_create() {
        let registry = registry(
            &["child"],
            vec![
                PluginDefinition::new("base").create_module_type(
                    ModuleTypeSpec::new("foo", "Foo").with_handler("build", returns(json!("base"))),
                ),
                PluginDefinition::new("child").with_base("base").extend_module_type(
                    ModuleTypeExtensionSpec::new("foo")
                        .with_handler("build", returns(json!("child"))),
                ),
            ],
        );
        let child = registry.get_plugin("child").unwrap();
        assert!(child.extend_module_types.is_empty());
        let build = &child.created_module_type("foo").unwrap().handlers["build"];
        assert_eq!(build.plugin_name, "child");
        assert_eq!(build.base.as_ref().unwrap().plugin_name, "base");
    }

    #[test]
    fn test_module_type_declared_twice() {
        let registry = registry(
            &["a", "b"],
            vec![
                PluginDefinition::new("a").create_module_type(ModuleTypeSpec::new("foo", "Foo")),
                PluginDefinition::new("b").create_module_type(ModuleTypeSpec::new("foo", "Foo")),
            ],
        );
        let err = registry.get_module_types().unwrap_err();
        assert!(err
            .to_string()
            .contains("Module type 'foo' is declared in multiple plugins: 'a' and 'b'."));
    }

    #[test]
    fn test_extending_undeclared_module_type() {
        let registry = registry(
            &["a"],
            vec![PluginDefinition::new("a").extend_module_type(
                ModuleTypeExtensionSpec::new("ghost").with_handler("build", returns(json!(null))),
            )],
        );
        let err = registry.get_module_types().unwrap_err();
        assert!(err.to_string().contains(
            "Plugin 'a' extends module type 'ghost' but the module type has not been declared."
        ));
    }

    #[test]
    fn test_docs_and_config_schema_inherit() {
        let registry = registry(
            &[],
            vec![
                PluginDefinition::new("base")
                    .with_docs("base docs")
                    .with_config_schema(json!({ "type": "object" })),
                PluginDefinition::new("child").with_base("base"),
            ],
        );
        let child = registry.get_plugin("child").unwrap();
        assert_eq!(child.docs.as_deref(), Some("base docs"));
        assert_eq!(child.config_schema, Some(json!({ "type": "object" })));
        assert_eq!(child.base.as_deref(), Some("base"));
    }
}
