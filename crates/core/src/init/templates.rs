//! Embedded template files for `.airway` initialization.
//!
//! Templates under the workspace `templates/` directory are embedded at
//! compile time with `rust-embed`, so `airway init` needs no files on disk.

use rust_embed::RustEmbed;

/// Embedded template files from the `templates/` directory.
///
/// `CARGO_MANIFEST_DIR` is `crates/core`, so `../../templates` is the
/// workspace root `templates/`.
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/../../templates"]
pub struct TemplateAssets;

/// Get template file content by path.
///
/// # Arguments
/// * `path` - Relative path from templates root (e.g., "config.toml", "pipelines/airway-cfd.yaml")
///
/// # Example
/// ```
/// use ak_core::init::templates::get_template;
///
/// let config = get_template("config.toml").unwrap();
/// assert!(config.contains("kill-grace-ms"));
/// ```
pub fn get_template(path: &str) -> Option<String> {
    TemplateAssets::get(path).map(|file| String::from_utf8_lossy(file.data.as_ref()).to_string())
}

/// List all template files under a directory prefix, sorted.
pub fn list_templates(prefix: &str) -> Vec<String> {
    let mut templates: Vec<String> = TemplateAssets::iter()
        .filter(|path| path.starts_with(prefix))
        .map(|path| path.to_string())
        .collect();
    templates.sort();
    templates
}
