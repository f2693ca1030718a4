//! Configuration loading and schema definitions for shardpool.
//!
//! This module provides types and functions for loading sharding options
//! from TOML files or strings. The schema covers exactly the knobs the
//! sharding engine reads; everything else about an invocation comes from
//! the embedding harness.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads sharding options from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use shardpool::config::load_options;
/// use std::path::Path;
///
/// let options = load_options(Path::new("shardpool.toml"))?;
/// println!("Shard count: {:?}", options.sharding.shard_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_options(path: &Path) -> Result<Options> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let options: Options = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(options)
}

/// Loads sharding options from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Example
///
/// ```
/// use shardpool::config::load_options_str;
///
/// let options = load_options_str(r#"
///     [sharding]
///     shard_count = 4
///     token_sharding = true
/// "#)?;
/// assert_eq!(options.sharding.shard_count, Some(4));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_options_str(content: &str) -> Result<Options> {
    let options: Options = toml::from_str(content).context("Failed to parse config")?;

    Ok(options)
}
