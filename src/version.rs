//! Build metadata
//!
//! Values are stamped by `build.rs`; anything it could not determine reads
//! `unknown`.

use tracing::info;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const REVISION: &str = env!("MICRO_BUILD_REVISION");
pub const BRANCH: &str = env!("MICRO_BUILD_BRANCH");
pub const BUILD_USER: &str = env!("MICRO_BUILD_USER");
pub const BUILD_DATE: &str = env!("MICRO_BUILD_DATE");
pub const TARGET: &str = env!("MICRO_BUILD_TARGET");

/// Multi-line version text for `--version`
pub fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (revision ",
        env!("MICRO_BUILD_REVISION"),
        ", branch ",
        env!("MICRO_BUILD_BRANCH"),
        ")\nbuild user: ",
        env!("MICRO_BUILD_USER"),
        "\nbuild date: ",
        env!("MICRO_BUILD_DATE"),
        "\ntarget:     ",
        env!("MICRO_BUILD_TARGET"),
    )
}

/// Log build metadata once at startup
pub fn log_build_info() {
    info!(
        app = APP_NAME,
        version = VERSION,
        revision = REVISION,
        branch = BRANCH,
        build_user = BUILD_USER,
        build_date = BUILD_DATE,
        target = TARGET,
        "starting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_version_mentions_every_field() {
        let text = long_version();
        assert!(text.starts_with(VERSION));
        assert!(text.contains(REVISION));
        assert!(text.contains(BRANCH));
        assert!(text.contains(TARGET));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "micro-device-plugin");
    }
}
