//! LUKS crypto manager plugin for credstore.

mod command;
mod cryptsetup;
mod loopdev;
mod mount;
mod system;

pub use system::LuksCryptoManager;

use credstore_core::registry::{BoxedCryptoManager, PluginRegistry};

/// Registry name for [`LuksCryptoManager`].
pub const PLUGIN_NAME: &str = "luks";

/// Make the LUKS crypto manager selectable by configuration.
pub fn register(registry: &mut PluginRegistry) {
    registry.register_crypto_manager(PLUGIN_NAME, |config| {
        Ok(Box::new(LuksCryptoManager::from_config(config)?) as BoxedCryptoManager)
    });
}
