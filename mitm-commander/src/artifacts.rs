//! Per-entity build artifacts: entrypoint scripts and Dockerfiles.
//!
//! The Dockerfile template carries two substitution markers,
//! `# <ENTRYPOINT>` and `# <EXEC_COMMAND>`. Generated files land under
//! `docker/` inside the build context so the `COPY` paths in the rendered
//! Dockerfiles stay context-relative.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mitm_topology::{redirect, ConfigDoc, Entity};

use crate::error::CommanderError;

pub const ENTRYPOINT_MARKER: &str = "# <ENTRYPOINT>";
pub const EXEC_COMMAND_MARKER: &str = "# <EXEC_COMMAND>";

const ARTIFACT_SUBDIR: &str = "docker";

#[derive(Clone, Debug)]
pub struct EntityArtifacts {
    pub entity: String,
    pub dockerfile: PathBuf,
    pub entrypoint: PathBuf,
}

pub fn load_template(path: &Path) -> Result<String, CommanderError> {
    if !path.is_file() {
        return Err(CommanderError::Template(path.to_path_buf()));
    }
    Ok(fs::read_to_string(path)?)
}

/// Context-relative path of an entity's rendered Dockerfile.
pub fn dockerfile_name(entity: &str) -> String {
    format!("{ARTIFACT_SUBDIR}/Dockerfile.{entity}")
}

pub fn generate_all(
    doc: &ConfigDoc,
    template: &str,
    context_dir: &Path,
) -> Result<Vec<EntityArtifacts>, CommanderError> {
    let out_dir = context_dir.join(ARTIFACT_SUBDIR);
    fs::create_dir_all(&out_dir)?;
    doc.entities
        .iter()
        .map(|(name, entity)| generate(doc, name, entity, template, &out_dir))
        .collect()
}

fn generate(
    doc: &ConfigDoc,
    name: &str,
    entity: &Entity,
    template: &str,
    out_dir: &Path,
) -> Result<EntityArtifacts, CommanderError> {
    let entrypoint = out_dir.join(format!("entrypoint_{name}.sh"));
    let mut script = String::from("#!/bin/sh\n");
    for line in redirect::entrypoint_rules(doc, entity) {
        script.push_str(&line);
        script.push('\n');
    }
    script.push_str("exec \"$@\"\n");
    fs::write(&entrypoint, script)?;
    let mut perms = fs::metadata(&entrypoint)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&entrypoint, perms)?;
    log::info!("Entrypoint script -> {}", entrypoint.display());

    let entry_block = format!(
        "COPY {ARTIFACT_SUBDIR}/entrypoint_{name}.sh /entrypoint.sh\n\
         RUN chmod +x /entrypoint.sh\n\
         ENTRYPOINT [\"/entrypoint.sh\"]"
    );
    // containers idle until the driver launches the workload
    let cmd_block = r#"CMD ["tail", "-f", "/dev/null"]"#;

    let content = template
        .replace(ENTRYPOINT_MARKER, &entry_block)
        .replace(EXEC_COMMAND_MARKER, cmd_block);

    let dockerfile = out_dir.join(format!("Dockerfile.{name}"));
    fs::write(&dockerfile, content)?;
    log::info!("Generated Dockerfile -> {}", dockerfile.display());

    Ok(EntityArtifacts {
        entity: name.to_string(),
        dockerfile,
        entrypoint,
    })
}

/// The in-container workload command for an entity, built from its launch
/// parameters. Entities without a `binary_path` have nothing to launch.
pub fn workload_command(entity: &Entity) -> Option<String> {
    let binary = entity.binary_path.as_deref()?.trim();
    if binary.is_empty() {
        return None;
    }
    let container_path = format!("/app/{}", binary.trim_start_matches("./").trim_start_matches('/'));

    let mut parts = Vec::new();
    if let Some(exec_with) = entity.exec_with.as_deref() {
        let exec_with = exec_with.trim();
        if !exec_with.is_empty() {
            parts.push(exec_with.to_string());
        }
    }
    parts.push(container_path);
    parts.extend(entity.args.iter().filter(|a| !a.is_empty()).cloned());

    Some(
        parts
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn shell_quote(arg: &str) -> String {
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='));
    if plain && !arg.is_empty() {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
