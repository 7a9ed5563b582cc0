use std::path::Path;

use config::{Config, Environment, File};
use tracing::{debug, info};

use crate::error::Result;
use crate::SessionConfig;

/// Load the session configuration: built-in defaults, then an optional
/// file, then `CAMSTAGE__SECTION__KEY` environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let mut builder = Config::builder().add_source(Config::try_from(&SessionConfig::default())?);

    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path));
    }

    let config = builder
        .add_source(Environment::with_prefix("CAMSTAGE").separator("__"))
        .build()?
        .try_deserialize()?;
    Ok(config)
}

/// Pin the calling thread to a core, wrapping `slot` around the available
/// cores. Returns false when pinning is unsupported.
pub fn pin_current_thread(slot: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids().filter(|c| !c.is_empty()) else {
        return false;
    };
    let core = cores[slot % cores.len()];
    let pinned = core_affinity::set_for_current(core);
    debug!(core = core.id, pinned, "Pinned thread");
    pinned
}

/// Round `size` up to a whole number of pages (at least one).
pub fn align_to_page(size: usize) -> usize {
    let page = page_size::get();
    size.max(1).div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_page() {
        let page = page_size::get();
        assert_eq!(align_to_page(0), page);
        assert_eq!(align_to_page(1), page);
        assert_eq!(align_to_page(page), page);
        assert_eq!(align_to_page(page + 1), page * 2);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.sensor.fps, 30);
        assert_eq!(config.capture.hold_count, 1);
        assert_eq!(config.buffers.pool(crate::StageId::Sensor).max_count, 8);
    }

    #[test]
    fn test_load_config_file() {
        let dir = std::env::temp_dir().join(format!("camstage-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.toml");
        std::fs::write(
            &path,
            "[sensor]\nwidth = 640\nheight = 480\nfps = 60\n\n[topology]\nreprocessing = true\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sensor.width, 640);
        assert_eq!(config.sensor.fps, 60);
        assert!(config.topology.reprocessing);
        assert_eq!(config.display.fps, 30);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
