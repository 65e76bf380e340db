// Configuration loading from files

use picshift::config::Config;
use picshift::constants::SAMPLE_CONFIG;
use picshift::eviction::EvictionOrder;
use picshift::metadata::ChecksumMode;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write config");
    file
}

#[test]
fn test_sample_config_loads_and_validates() {
    let file = write_config(SAMPLE_CONFIG);
    let config = Config::load(file.path()).expect("sample config should load");

    assert_eq!(config.checksum_mode, ChecksumMode::Content);
    assert_eq!(config.eviction_order, EvictionOrder::AccessTime);
    assert!(config.quality >= 1 && config.quality <= 100);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("{}");
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.convert_types, vec!["webp".to_string()]);
    assert_eq!(config.max_cache_size_bytes(), None);
    assert!(config.proxy.is_none());
}

#[test]
fn test_env_substitution_in_file() {
    std::env::set_var("PICSHIFT_TEST_ORIGIN", "https://origin.example.com");
    let file = write_config("proxy: \"${PICSHIFT_TEST_ORIGIN}\"\n");
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.proxy.as_deref(), Some("https://origin.example.com"));
}

#[test]
fn test_missing_env_var_is_an_error() {
    let file = write_config("proxy: \"${PICSHIFT_TEST_DEFINITELY_UNSET}\"\n");
    let err = Config::load(file.path()).unwrap_err();

    assert!(err.contains("PICSHIFT_TEST_DEFINITELY_UNSET"));
}

#[test]
fn test_invalid_values_rejected_on_load() {
    for yaml in [
        "quality: 0",
        "convert_types: [webp, heic]",
        "proxy: \"ftp://origin\"",
        "allowed_types: []",
    ] {
        let file = write_config(yaml);
        assert!(
            Config::load(file.path()).is_err(),
            "expected '{}' to be rejected",
            yaml
        );
    }
}

#[test]
fn test_missing_file_reports_read_failure() {
    let err = Config::load("/nonexistent/picshift.yaml").unwrap_err();
    assert!(err.starts_with("Failed to read config file"));
}

#[test]
fn test_type_lists_are_lowercased() {
    let file = write_config("allowed_types: [JPG, Png]\nconvert_types: [WEBP, Avif]\n");
    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.allowed_types, vec!["jpg", "png"]);
    assert_eq!(config.convert_types, vec!["webp", "avif"]);
}
