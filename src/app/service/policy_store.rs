use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app::security::signer::{PayloadSigner, SignerError};

/// Process-wide relay policy. Immutable snapshot; the store swaps whole
/// instances so a reader sees one consistent view per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    #[serde(default = "default_true")]
    pub mitm_enabled: bool,
    #[serde(default)]
    pub bypass_pin: bool,
    #[serde(default)]
    pub cdcvm_enabled: bool,
    #[serde(default)]
    pub enhanced_limits: bool,
    #[serde(default)]
    pub block_all: bool,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            mitm_enabled: true,
            bypass_pin: false,
            cdcvm_enabled: false,
            enhanced_limits: false,
            block_all: false,
            private_key_path: None,
        }
    }
}

/// Partial update. `private_key_path` uses a double Option: outer
/// `Some` means "change it", inner `None` clears the key.
#[derive(Debug, Clone, Default)]
pub struct PolicyPatch {
    pub mitm_enabled: Option<bool>,
    pub bypass_pin: Option<bool>,
    pub cdcvm_enabled: Option<bool>,
    pub enhanced_limits: Option<bool>,
    pub block_all: Option<bool>,
    pub private_key_path: Option<Option<PathBuf>>,
}

/// Snapshot-on-read policy store.
///
/// Reads are lock-free (`ArcSwap::load_full`); updates are serialized
/// behind a mutex. A patch that changes the key path re-loads the key
/// synchronously and is rejected wholesale on failure, keeping both the
/// prior policy and the prior key.
pub struct PolicyStore {
    state: ArcSwap<PolicyState>,
    signer: ArcSwap<PayloadSigner>,
    update_lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(state: PolicyState, signer: PayloadSigner) -> Self {
        Self {
            state: ArcSwap::from_pointee(state),
            signer: ArcSwap::from_pointee(signer),
            update_lock: Mutex::new(()),
        }
    }

    /// Atomic snapshot, valid for the duration of one frame.
    pub fn read(&self) -> Arc<PolicyState> {
        self.state.load_full()
    }

    /// Current key handle; shared by reference, never re-read per request.
    pub fn signer(&self) -> Arc<PayloadSigner> {
        self.signer.load_full()
    }

    /// Apply a patch. Field updates are atomic with respect to readers:
    /// they either see the old snapshot or the fully-patched one.
    pub async fn update(&self, patch: PolicyPatch) -> Result<(), SignerError> {
        let _guard = self.update_lock.lock().await;

        let current = self.state.load_full();
        let mut next = (*current).clone();

        if let Some(v) = patch.mitm_enabled {
            next.mitm_enabled = v;
        }
        if let Some(v) = patch.bypass_pin {
            next.bypass_pin = v;
        }
        if let Some(v) = patch.cdcvm_enabled {
            next.cdcvm_enabled = v;
        }
        if let Some(v) = patch.enhanced_limits {
            next.enhanced_limits = v;
        }
        if let Some(v) = patch.block_all {
            if v && !next.block_all {
                warn!("block_all engaged: all NFC_DATA traffic will be rejected");
            }
            next.block_all = v;
        }

        if let Some(new_path) = patch.private_key_path {
            if new_path != next.private_key_path {
                // Key reload happens before the swap so a failing key
                // leaves the previous policy and key untouched.
                let signer = PayloadSigner::from_config(new_path.as_deref())?;
                next.private_key_path = new_path;
                self.signer.store(Arc::new(signer));
            }
        }

        self.state.store(Arc::new(next));
        info!("policy updated");
        Ok(())
    }
}
