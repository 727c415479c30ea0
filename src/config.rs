use figment::Figment;
use figment::providers::Env;
use std::sync::OnceLock;

static CONFIG: OnceLock<Figment> = OnceLock::new();

/// Process-wide configuration source. Settings come straight from the
/// environment (`PACS_IP`, `CALLING_AET`, ...), matching the variable names
/// the deployment scripts export.
pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(|| Figment::new().merge(Env::raw()))
}
