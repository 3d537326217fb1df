use std::sync::Arc;
use std::time::Duration;

use crate::crypto::KeyMaterial;

/// Runtime configuration threaded explicitly into every operation-mode entry
/// point and captured by each spawned thread, rather than read from globals.
#[derive(Clone)]
pub struct Config {
    /// Key material derived from the `-k` hex argument, if any descriptor
    /// enables encryption.
    pub key: Option<Arc<KeyMaterial>>,
    /// Dial timeout applied to outbound TCP connects.
    pub timeout: Duration,
    /// Gates `log::info` output.
    pub verbose: bool,
}

impl Config {
    pub fn new(raw_key: Option<&[u8]>, timeout: Duration, verbose: bool) -> Self {
        Self {
            key: raw_key.map(|k| Arc::new(KeyMaterial::expand(k))),
            timeout,
            verbose,
        }
    }

    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.key.as_deref()
    }
}
