mod defaults;
mod resolve;
mod types;

pub use self::defaults::{parse_daily_at, parse_human_duration};
pub use self::resolve::{
    default_config_search_paths, load_config, minimal_config_template, parse_config,
    resolve_config_path, ConfigSource, CONFIG_ENV_VAR,
};
pub use self::types::*;

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(""), Some(home)) => home.to_string_lossy().to_string(),
        (Some(rest), Some(home)) if rest.starts_with('/') => home
            .join(rest.trim_start_matches('/'))
            .to_string_lossy()
            .to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_only_touches_home_prefix() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home.to_string_lossy());
        assert_eq!(
            expand_tilde("~/backups"),
            home.join("backups").to_string_lossy()
        );
        assert_eq!(expand_tilde("~other/x"), "~other/x");
        assert_eq!(expand_tilde("/abs"), "/abs");
    }
}
