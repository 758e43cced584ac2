use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;

use crate::{pipeline::PluginExecutionResponse, plugin::PluginManifest};

pub const MANIFEST_SCHEMA_FILE: &str = "plugin-manifest.schema.json";
pub const RESPONSE_SCHEMA_FILE: &str = "pipeline-response.schema.json";

/// The entry point invoked by `main.rs` for `Commands::Schema`.
pub fn write_schema(out_dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(out_dir)?;

    // 1) manifest schema
    let manifest_schema = schema_for!(PluginManifest);
    fs::write(
        out_dir.join(MANIFEST_SCHEMA_FILE),
        serde_json::to_string_pretty(&manifest_schema)?,
    )?;

    // 2) response schema
    let response_schema = schema_for!(PluginExecutionResponse);
    fs::write(
        out_dir.join(RESPONSE_SCHEMA_FILE),
        serde_json::to_string_pretty(&response_schema)?,
    )?;

    Ok(())
}
