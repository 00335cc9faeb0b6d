use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use schemars::{Schema, schema_for};
use switchyard_protocol::BusMessage;

use crate::{function::FunctionDefinition, jobs::JobSpec, orchestrator::Decision};

/// Writes one JSON Schema per public document type into `out_dir` and
/// returns the paths written.
pub fn write_schemas(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let schemas: [(&str, Schema); 4] = [
        ("message.schema.json", schema_for!(BusMessage)),
        ("job_spec.schema.json", schema_for!(JobSpec)),
        ("decision.schema.json", schema_for!(Decision)),
        ("functions.schema.json", schema_for!(Vec<FunctionDefinition>)),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (file, schema) in schemas {
        let path = out_dir.join(file);
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
