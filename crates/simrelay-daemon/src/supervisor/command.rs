//! Command-line construction for the simulation process.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;

use simrelay_core::config::EngineConfig;

use super::types::SupervisorError;

/// Check a start request before anything is spawned.
pub fn validate(target: &str, parameters: &BTreeMap<String, String>) -> Result<(), SupervisorError> {
    if target.trim().is_empty() {
        return Err(SupervisorError::InvalidArgument {
            reason: "target identifier must not be empty".to_string(),
        });
    }
    if target.starts_with('-') {
        return Err(SupervisorError::InvalidArgument {
            reason: format!("target identifier must not start with '-': {target}"),
        });
    }
    for key in parameters.keys() {
        let well_formed = !key.is_empty()
            && !key.starts_with('-')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !well_formed {
            return Err(SupervisorError::InvalidArgument {
                reason: format!("invalid parameter name: {key:?}"),
            });
        }
    }
    Ok(())
}

/// Arguments passed to `engine.program`, in order: leading args, target,
/// one `--key value` pair per parameter (sorted by key), trailing flags.
pub fn invocation_args(
    engine: &EngineConfig,
    target: &str,
    parameters: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = engine.args.clone();
    args.push(target.to_string());
    for (key, value) in parameters {
        args.push(format!("--{key}"));
        args.push(value.clone());
    }
    args.extend(engine.flags.iter().cloned());
    args
}

/// Build the child command with piped output and a null stdin.
pub fn build_command(
    engine: &EngineConfig,
    target: &str,
    parameters: &BTreeMap<String, String>,
) -> Command {
    let mut cmd = Command::new(&engine.program);
    cmd.args(invocation_args(engine, target, parameters))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &engine.working_directory {
        cmd.current_dir(dir);
    }
    cmd
}
