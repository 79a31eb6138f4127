//! Service root: the process-wide plugin registry, the registration
//! compatibility checks and the construction helpers for selectors and
//! selection managers.

// ───── Std Lib ─────
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ───── Crates ─────
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

// ───── Local Modules ─────
use crate::error::ServiceError;
use crate::executor::lock;
use crate::plugin::{CardReader, Plugin, PoolPlugin};
use crate::selection::CardSelectionManager;
use crate::selector::{BasicCardSelector, IsoCardSelector};
use crate::spi::{PluginSpi, PoolPluginSpi};

/// Version of the plugin-facing API implemented by this crate, as
/// "major.minor".
pub const PLUGIN_API_VERSION: &str = "2.3";

/// Version of the application-facing reader API implemented by this crate.
pub const READER_API_VERSION: &str = "2.0";

/// Provides a plugin driver together with the API versions it was built
/// against.
pub trait PluginFactory: Send + Sync {
    /// Name of the plugin the factory produces.
    fn plugin_name(&self) -> String;

    /// Version of the plugin API the driver was compiled against.
    fn plugin_api_version(&self) -> String;

    /// Version of the reader API the driver was compiled against.
    fn reader_api_version(&self) -> String;

    fn plugin(&self) -> Arc<dyn PluginSpi>;
}

/// Declares the API versions a card extension library was built against.
pub trait CardExtension {
    fn reader_api_version(&self) -> String;
}

/// Same contract as `PluginFactory` for pool plugin drivers.
pub trait PoolPluginFactory: Send + Sync {
    fn plugin_name(&self) -> String;

    fn plugin_api_version(&self) -> String;

    fn reader_api_version(&self) -> String;

    fn pool_plugin(&self) -> Arc<dyn PoolPluginSpi>;
}

enum RegisteredPlugin {
    Local(Plugin),
    Pool(PoolPlugin),
}

/// Process-wide registry of plugins.
pub struct SmartCardService {
    plugins: Mutex<BTreeMap<String, RegisteredPlugin>>,
}

impl Default for SmartCardService {
    fn default() -> Self {
        SmartCardService::new()
    }
}

impl SmartCardService {
    /// Creates an isolated service instance. Most applications go through
    /// the process-wide `smart_card_service()` handle instead.
    pub fn new() -> Self {
        SmartCardService {
            plugins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a plugin and wraps the readers its driver exposes.
    pub fn register_plugin(&self, factory: &dyn PluginFactory) -> Result<Plugin, ServiceError> {
        let plugin_name = factory.plugin_name();
        info!("Registering a new plugin to the service: [{}]", plugin_name);
        self.check_registration(&plugin_name)?;
        check_version_compatibility(
            &plugin_name,
            &factory.plugin_api_version(),
            &factory.reader_api_version(),
        );
        let spi = factory.plugin();
        if spi.name() != plugin_name {
            return Err(ServiceError::PluginRegistration(format!(
                "the plugin name '{}' mismatches the name '{}' provided by the factory",
                spi.name(),
                plugin_name
            )));
        }
        let plugin = Plugin::new(spi);
        plugin.do_register()?;
        lock(&self.plugins).insert(plugin_name, RegisteredPlugin::Local(plugin.clone()));
        Ok(plugin)
    }

    /// Registers a pool plugin.
    pub fn register_pool_plugin(
        &self,
        factory: &dyn PoolPluginFactory,
    ) -> Result<PoolPlugin, ServiceError> {
        let plugin_name = factory.plugin_name();
        info!(
            "Registering a new pool plugin to the service: [{}]",
            plugin_name
        );
        self.check_registration(&plugin_name)?;
        check_version_compatibility(
            &plugin_name,
            &factory.plugin_api_version(),
            &factory.reader_api_version(),
        );
        let spi = factory.pool_plugin();
        if spi.name() != plugin_name {
            return Err(ServiceError::PluginRegistration(format!(
                "the pool plugin name '{}' mismatches the name '{}' provided by the factory",
                spi.name(),
                plugin_name
            )));
        }
        let plugin = PoolPlugin::new(spi);
        plugin.do_register();
        lock(&self.plugins).insert(plugin_name, RegisteredPlugin::Pool(plugin.clone()));
        Ok(plugin)
    }

    /// Unregisters a plugin and every reader it holds.
    pub fn unregister_plugin(&self, plugin_name: &str) {
        info!(
            "Unregistering a plugin from the service: [{}]",
            plugin_name
        );
        let removed = lock(&self.plugins).remove(plugin_name);
        match removed {
            Some(RegisteredPlugin::Local(plugin)) => plugin.do_unregister(),
            Some(RegisteredPlugin::Pool(plugin)) => plugin.do_unregister(),
            None => warn!("The plugin [{}] is not registered", plugin_name),
        }
    }

    pub fn is_plugin_registered(&self, plugin_name: &str) -> bool {
        lock(&self.plugins).contains_key(plugin_name)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        lock(&self.plugins).keys().cloned().collect()
    }

    pub fn get_plugin(&self, plugin_name: &str) -> Option<Plugin> {
        match lock(&self.plugins).get(plugin_name) {
            Some(RegisteredPlugin::Local(plugin)) => Some(plugin.clone()),
            _ => None,
        }
    }

    pub fn get_pool_plugin(&self, plugin_name: &str) -> Option<PoolPlugin> {
        match lock(&self.plugins).get(plugin_name) {
            Some(RegisteredPlugin::Pool(plugin)) => Some(plugin.clone()),
            _ => None,
        }
    }

    /// The plugin holding the given reader, if any.
    pub fn get_plugin_of_reader(&self, reader_name: &str) -> Option<Plugin> {
        let plugins = lock(&self.plugins);
        for registered in plugins.values() {
            if let RegisteredPlugin::Local(plugin) = registered {
                if let Ok(names) = plugin.reader_names() {
                    if names.iter().any(|name| name == reader_name) {
                        return Some(plugin.clone());
                    }
                }
            }
        }
        None
    }

    /// Looks a reader up by exact name across every registered plugin.
    pub fn get_reader(&self, reader_name: &str) -> Option<CardReader> {
        let plugins = lock(&self.plugins);
        for registered in plugins.values() {
            if let RegisteredPlugin::Local(plugin) = registered {
                if let Ok(reader) = plugin.get_reader(reader_name) {
                    return Some(reader);
                }
            }
        }
        None
    }

    /// First reader whose name matches the given regular expression, across
    /// every registered plugin.
    pub fn find_reader(&self, reader_name_regex: &str) -> Result<CardReader, ServiceError> {
        Regex::new(reader_name_regex).map_err(|e| {
            ServiceError::illegal_argument(format!(
                "invalid reader name regex '{}': {}",
                reader_name_regex, e
            ))
        })?;
        let plugins = lock(&self.plugins);
        for registered in plugins.values() {
            if let RegisteredPlugin::Local(plugin) = registered {
                if let Ok(reader) = plugin.find_reader(reader_name_regex) {
                    return Ok(reader);
                }
            }
        }
        Err(ServiceError::illegal_argument(format!(
            "no reader matching '{}' in any registered plugin",
            reader_name_regex
        )))
    }

    /// Builds a selector with protocol and power-on data filters.
    pub fn create_basic_card_selector(&self) -> BasicCardSelector {
        BasicCardSelector::new()
    }

    /// Builds a selector with ISO 7816-4 application selection criteria.
    pub fn create_iso_card_selector(&self) -> IsoCardSelector {
        IsoCardSelector::new()
    }

    pub fn create_card_selection_manager(&self) -> CardSelectionManager {
        CardSelectionManager::new()
    }

    /// Reports a version mismatch between a card extension library and the
    /// service, without preventing its use.
    pub fn check_card_extension(&self, card_extension: &dyn CardExtension) {
        if !compare_versions(&card_extension.reader_api_version(), READER_API_VERSION) {
            warn!(
                "The card extension uses reader API {} while the service uses {}",
                card_extension.reader_api_version(),
                READER_API_VERSION
            );
        }
    }

    fn check_registration(&self, plugin_name: &str) -> Result<(), ServiceError> {
        if plugin_name.is_empty() {
            return Err(ServiceError::illegal_argument(
                "the plugin name is empty",
            ));
        }
        if self.is_plugin_registered(plugin_name) {
            return Err(ServiceError::PluginRegistration(format!(
                "the plugin '{}' has already been registered to the service",
                plugin_name
            )));
        }
        Ok(())
    }
}

/// Compares "major.minor" version strings numerically, the way the API
/// compatibility check needs it.
fn compare_versions(provided: &str, local: &str) -> bool {
    version_to_number(provided) == version_to_number(local)
}

fn version_to_number(version: &str) -> u32 {
    version
        .split('.')
        .take(2)
        .filter_map(|part| part.parse::<u32>().ok())
        .fold(0, |acc, num| acc * 1000 + num)
}

/// API mismatches are reported but do not prevent the registration.
fn check_version_compatibility(
    plugin_name: &str,
    plugin_api_version: &str,
    reader_api_version: &str,
) {
    if !compare_versions(plugin_api_version, PLUGIN_API_VERSION) {
        warn!(
            "The plugin [{}] uses plugin API {} while the service uses {}",
            plugin_name, plugin_api_version, PLUGIN_API_VERSION
        );
    }
    if !compare_versions(reader_api_version, READER_API_VERSION) {
        warn!(
            "The plugin [{}] uses reader API {} while the service uses {}",
            plugin_name, reader_api_version, READER_API_VERSION
        );
    }
}

lazy_static! {
    /// Process-wide service instance.
    static ref SMART_CARD_SERVICE: SmartCardService = SmartCardService::new();
}

/// The process-wide service handle, initialized on first use.
pub fn smart_card_service() -> &'static SmartCardService {
    &SMART_CARD_SERVICE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_compare_on_major_and_minor_only() {
        assert!(compare_versions("2.3", "2.3"));
        assert!(compare_versions("2.3.1", "2.3"));
        assert!(!compare_versions("2.2", "2.3"));
        assert!(!compare_versions("1.3", "2.3"));
    }

    #[test]
    fn empty_plugin_name_is_rejected() {
        let service = SmartCardService::new();
        assert!(matches!(
            service.check_registration(""),
            Err(ServiceError::IllegalArgument(_))
        ));
    }

    #[test]
    fn card_extension_version_check_only_warns() {
        struct OldExtension;
        impl CardExtension for OldExtension {
            fn reader_api_version(&self) -> String {
                "1.0".to_string()
            }
        }
        // a mismatch is reported in the logs, never an error
        SmartCardService::new().check_card_extension(&OldExtension);
    }

    #[test]
    fn unknown_lookups_return_nothing() {
        let service = SmartCardService::new();
        assert!(service.get_plugin("missing").is_none());
        assert!(service.get_reader("missing").is_none());
        assert!(service.plugin_names().is_empty());
        assert!(matches!(
            service.find_reader("missing.*"),
            Err(ServiceError::IllegalArgument(_))
        ));
    }
}
