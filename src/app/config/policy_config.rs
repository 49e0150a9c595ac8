use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use tracing::info;

use crate::app::service::policy_store::PolicyState;

/// Load the bootstrap policy blob: a JSON file plus `NFCGATE_`-prefixed
/// environment overrides (`NFCGATE_BLOCK_ALL=true` and friends).
pub fn load_policy(path: &Path) -> Result<PolicyState, config::ConfigError> {
    let policy: PolicyState = Config::builder()
        .add_source(File::from(path).format(FileFormat::Json))
        .add_source(Environment::with_prefix("NFCGATE").try_parsing(true))
        .build()?
        .try_deserialize()?;

    info!(
        "policy loaded from {}: mitm={} bypass_pin={} cdcvm={} enhanced_limits={} block_all={}",
        path.display(),
        policy.mitm_enabled,
        policy.bypass_pin,
        policy.cdcvm_enabled,
        policy.enhanced_limits,
        policy.block_all
    );
    Ok(policy)
}
