//! Lifecycle hook execution.
//!
//! Hooks are configured external commands run at named lifecycle points:
//! server start/stop, tenant start/stop, machine idle/resume. A hook group
//! runs in order and stops at the first failure. A hook may point at a
//! configuration file via `reload_config`; if the hook leaves a different or
//! newer file there, the caller is told to reload.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// Path this hook may rewrite; checked after the hook returns.
    #[serde(default)]
    pub reload_config: Option<Utf8PathBuf>,
}

/// Outcome of running a hook group.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HookOutcome {
    /// Set when some hook's `reload_config` file differs from the current
    /// config path or was modified while the hook ran.
    pub reload_config: Option<Utf8PathBuf>,
}

/// Run each hook in order with `env` overlayed on the process environment.
/// Server-lifecycle hooks pass an empty `env`; tenant hooks pass the tenant
/// env. On non-zero exit the first error is returned and the remaining
/// hooks of the group do not run.
pub async fn execute(
    hooks: &[HookConfig],
    env: &HashMap<String, String>,
    hook_type: &str,
    current_config: Option<&Utf8Path>,
) -> anyhow::Result<HookOutcome> {
    let mut outcome = HookOutcome::default();
    for hook in hooks {
        let started_at = SystemTime::now();
        run_one(hook, env, hook_type).await?;
        if let Some(decision) = reload_decision(hook, current_config, started_at) {
            outcome.reload_config = Some(decision);
        }
    }
    Ok(outcome)
}

async fn run_one(
    hook: &HookConfig,
    env: &HashMap<String, String>,
    hook_type: &str,
) -> anyhow::Result<()> {
    let mut cmd = Command::new(&hook.command);
    cmd.args(&hook.args)
        .envs(env)
        .envs(&hook.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match hook.timeout {
        Some(timeout) => tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{hook_type} hook {:?} timed out after {}",
                    hook.command,
                    humantime::format_duration(timeout)
                )
            })?,
        None => cmd.output().await,
    }
    .with_context(|| format!("running {hook_type} hook {:?}", hook.command))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        info!(hook = %hook.command, hook_type, "hook stdout: {}", stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        warn!(hook = %hook.command, hook_type, "hook stderr: {}", stderr.trim_end());
    }

    if !output.status.success() {
        anyhow::bail!(
            "{hook_type} hook {:?} exited with {}",
            hook.command,
            output.status
        );
    }
    info!(hook = %hook.command, hook_type, "hook completed");
    Ok(())
}

fn reload_decision(
    hook: &HookConfig,
    current_config: Option<&Utf8Path>,
    started_at: SystemTime,
) -> Option<Utf8PathBuf> {
    let declared = hook.reload_config.as_deref()?;
    if current_config != Some(declared) {
        return Some(declared.to_owned());
    }
    // Same path: reload only if the hook rewrote the file.
    let modified = std::fs::metadata(declared).and_then(|m| m.modified()).ok()?;
    if modified > started_at {
        return Some(declared.to_owned());
    }
    None
}
