//! Configuration: the immutable snapshot the request path consumes, and the
//! TOML loader that produces it.
//!
//! The snapshot is swapped wholesale on reload (`SIGHUP`); readers clone an
//! `Arc` and never observe a half-updated config. Live backends keep the
//! settings they were started with until eviction.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use hyper::Method;
use serde::Deserialize;

use crate::auth::AuthConfig;
use crate::hooks::HookConfig;
use crate::idle::{IdleAction, IdleConfig};
use crate::logging::LogFormat;
use crate::proxy::{ProxySettings, MAX_RETRY_BUFFER_SIZE, PROXY_RETRY_TIMEOUT};
use crate::rules::{RewriteRule, RuleFlag, RuleSet};
use crate::static_files::StaticConfig;
use crate::tenant::pool::{PoolConfig, EVICTION_CHECK_INTERVAL};
use crate::tenant::spawn::{FrameworkDefaults, StarterConfig};
use crate::tenant::{normalize_scope, Tenant, TenantHooks};

pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
    pub const DEFAULT_PID_FILE: &str = "/tmp/navigator.pid";
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
    pub const DEFAULT_START_PORT: u16 = 4000;
    pub const DEFAULT_PORT_RANGE: u16 = 100;
}

/// Server-lifecycle hooks; these run with no tenant environment.
#[derive(Debug, Clone, Default)]
pub struct ServerHooks {
    pub start: Vec<HookConfig>,
    pub stop: Vec<HookConfig>,
}

/// Everything the request path needs, parsed and validated once.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub listen: SocketAddr,
    pub root_path: String,
    pub maintenance_page: Option<Utf8PathBuf>,
    pub pid_file: Utf8PathBuf,
    pub log_format: LogFormat,
    /// Orchestrator waits this long on a starting backend before serving
    /// the maintenance page; tenants may override.
    pub startup_timeout: Duration,
    pub tenants: Vec<Arc<Tenant>>,
    pub rules: RuleSet,
    pub pool: PoolConfig,
    pub proxy: ProxySettings,
    pub idle: IdleConfig,
    pub server_hooks: ServerHooks,
    pub auth: Option<AuthConfig>,
    pub static_files: StaticConfig,
}

impl ConfigSnapshot {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Arc<ConfigSnapshot>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {path}"))?;
        Self::parse_and_validate(&contents)
            .with_context(|| format!("invalid configuration in {path}"))
    }

    pub fn parse_and_validate(contents: &str) -> anyhow::Result<Arc<ConfigSnapshot>> {
        let file: ConfigFile = toml::from_str(contents).context("parsing configuration")?;

        let listen: SocketAddr = file
            .listen
            .as_deref()
            .unwrap_or(defaults::DEFAULT_LISTEN)
            .parse()
            .with_context(|| format!("invalid listen address {:?}", file.listen))?;
        let root_path = normalize_scope(file.root_path.as_deref().unwrap_or("/"));
        anyhow::ensure!(
            root_path.starts_with('/'),
            "root_path must start with '/', got {root_path:?}"
        );

        let mut seen = HashSet::new();
        let mut tenants = Vec::with_capacity(file.tenants.len());
        for section in file.tenants {
            anyhow::ensure!(
                seen.insert(section.name.clone()),
                "duplicate tenant name {:?}",
                section.name
            );
            tenants.push(Arc::new(section.into_tenant(&root_path)?));
        }

        let mut compiled = Vec::with_capacity(file.rewrite.len());
        for rule in file.rewrite {
            let flag = RuleFlag::parse(&rule.flag)?;
            let methods = rule
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .with_context(|| format!("invalid method {m:?} in rewrite rule"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            compiled.push(RewriteRule::new(
                &rule.pattern,
                &rule.replacement,
                flag,
                methods,
            )?);
        }
        let mut rules = RuleSet::new(compiled);
        rules.add_trailing_slash_rules(
            tenants
                .iter()
                .map(|t| t.path.as_str())
                .chain([root_path.as_str()]),
        )?;

        let starter = StarterConfig {
            framework: FrameworkDefaults {
                runtime: file.framework.runtime,
                server: file.framework.server,
                args: file.framework.args,
            },
            default_tenant_hooks: TenantHooks {
                start: file.hooks.tenant.start,
                stop: file.hooks.tenant.stop,
            },
            readiness_deadline: file
                .pool
                .readiness_deadline
                .unwrap_or(crate::tenant::spawn::DEFAULT_READINESS_DEADLINE),
            cgroup_root: file
                .cgroup
                .root
                .unwrap_or_else(|| Utf8PathBuf::from(crate::tenant::cgroup::DEFAULT_CGROUP_ROOT)),
            cgroup_strict: file.cgroup.strict,
        };
        let pool = PoolConfig {
            start_port: file.pool.start_port.unwrap_or(defaults::DEFAULT_START_PORT),
            port_range: file.pool.port_range.unwrap_or(defaults::DEFAULT_PORT_RANGE),
            idle_timeout: file
                .pool
                .idle_timeout
                .unwrap_or(defaults::DEFAULT_IDLE_TIMEOUT),
            track_websockets: file.pool.track_websockets,
            starter,
            eviction_check_interval: EVICTION_CHECK_INTERVAL,
        };

        let proxy = ProxySettings {
            max_retry_buffer: file.proxy.max_retry_buffer.unwrap_or(MAX_RETRY_BUFFER_SIZE),
            retry_timeout: file.proxy.retry_timeout.unwrap_or(PROXY_RETRY_TIMEOUT),
            trust_proxy: file.trust_proxy,
            disable_compression: file.disable_compression,
        };

        let idle = IdleConfig {
            action: file.idle.action,
            timeout: file.idle.timeout.unwrap_or(Duration::ZERO),
            idle_hooks: file.hooks.idle,
            resume_hooks: file.hooks.resume,
        };

        Ok(Arc::new(ConfigSnapshot {
            listen,
            root_path,
            maintenance_page: file.maintenance_page,
            pid_file: file
                .pid_file
                .unwrap_or_else(|| Utf8PathBuf::from(defaults::DEFAULT_PID_FILE)),
            log_format: file.log_format.unwrap_or_default(),
            startup_timeout: file
                .pool
                .startup_timeout
                .unwrap_or(defaults::DEFAULT_STARTUP_TIMEOUT),
            tenants,
            rules,
            pool,
            proxy,
            idle,
            server_hooks: ServerHooks {
                start: file.hooks.start,
                stop: file.hooks.stop,
            },
            auth: file.auth,
            static_files: file.static_files,
        }))
    }

    /// The effective startup deadline a request waits for this tenant.
    pub fn startup_timeout_for(&self, tenant: &Tenant) -> Duration {
        tenant.startup_timeout.unwrap_or(self.startup_timeout)
    }
}

/// Parse a human memory size: plain bytes, or a binary-scaled suffix
/// (`512MB`, `1gb`, `256k`). Zero means "no limit".
pub fn parse_memory_size(input: &str) -> anyhow::Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let digits_len = s.trim_end_matches(|c: char| c.is_ascii_alphabetic()).len();
    let (digits, suffix) = s.split_at(digits_len);
    let multiplier: u64 = match suffix {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => anyhow::bail!("unknown size suffix {suffix:?} in {input:?}"),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size {input:?}"))?;
    Ok(value * multiplier)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    listen: Option<String>,
    root_path: Option<String>,
    maintenance_page: Option<Utf8PathBuf>,
    pid_file: Option<Utf8PathBuf>,
    log_format: Option<LogFormat>,
    #[serde(default)]
    trust_proxy: bool,
    #[serde(default)]
    disable_compression: bool,
    #[serde(default)]
    pool: PoolSection,
    #[serde(default)]
    proxy: ProxySection,
    #[serde(default)]
    idle: IdleSection,
    #[serde(default)]
    framework: FrameworkSection,
    #[serde(default)]
    cgroup: CgroupSection,
    auth: Option<AuthConfig>,
    #[serde(default, rename = "static")]
    static_files: StaticConfig,
    #[serde(default)]
    hooks: HooksSection,
    #[serde(default)]
    rewrite: Vec<RewriteSection>,
    #[serde(default)]
    tenants: Vec<TenantSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    start_port: Option<u16>,
    port_range: Option<u16>,
    #[serde(default, with = "humantime_serde::option")]
    idle_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    startup_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    readiness_deadline: Option<Duration>,
    #[serde(default)]
    track_websockets: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProxySection {
    max_retry_buffer: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    retry_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IdleSection {
    #[serde(default)]
    action: IdleAction,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrameworkSection {
    runtime: Option<String>,
    server: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgroupSection {
    root: Option<Utf8PathBuf>,
    #[serde(default)]
    strict: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HooksSection {
    #[serde(default)]
    start: Vec<HookConfig>,
    #[serde(default)]
    stop: Vec<HookConfig>,
    #[serde(default)]
    idle: Vec<HookConfig>,
    #[serde(default)]
    resume: Vec<HookConfig>,
    #[serde(default)]
    tenant: TenantHooksSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TenantHooksSection {
    #[serde(default)]
    start: Vec<HookConfig>,
    #[serde(default)]
    stop: Vec<HookConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RewriteSection {
    pattern: String,
    replacement: String,
    flag: String,
    #[serde(default)]
    methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TenantSection {
    name: String,
    /// Defaults to `<root_path><name>/`.
    path: Option<String>,
    root: Option<Utf8PathBuf>,
    runtime: Option<String>,
    server: Option<String>,
    args: Option<Vec<String>>,
    #[serde(default)]
    env: HashMap<String, String>,
    health_check: Option<String>,
    memory_limit: Option<String>,
    user: Option<String>,
    group: Option<String>,
    track_websockets: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    startup_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    idle_timeout: Option<Duration>,
    #[serde(default)]
    hooks: TenantHooksSection,
}

impl TenantSection {
    fn into_tenant(self, root_path: &str) -> anyhow::Result<Tenant> {
        let path = normalize_scope(
            &self
                .path
                .unwrap_or_else(|| format!("{root_path}{}", self.name)),
        );
        anyhow::ensure!(
            path.starts_with('/'),
            "tenant {:?} path must start with '/', got {path:?}",
            self.name
        );
        let memory_limit = match self.memory_limit.as_deref() {
            None => None,
            Some(limit) => match parse_memory_size(limit)? {
                0 => None,
                bytes => Some(bytes),
            },
        };
        Ok(Tenant {
            name: self.name,
            path,
            root: self.root.unwrap_or_default(),
            runtime: self.runtime,
            server: self.server,
            args: self.args,
            env: self.env,
            health_check: self.health_check,
            memory_limit,
            user: self.user,
            group: self.group,
            track_websockets: self.track_websockets,
            startup_timeout: self.startup_timeout,
            idle_timeout: self.idle_timeout,
            hooks: TenantHooks {
                start: self.hooks.start,
                stop: self.hooks.stop,
            },
        })
    }
}
