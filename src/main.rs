use clap::{Parser, Subcommand};
use dirs::home_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const CONFIG_VERSION: u32 = 1;
const LOCAL_CONFIG_FILE: &str = "salt-solo.yaml";
const SANDBOX_MARKER: &str = ".salt-solo-sandbox";

const LATEST: &str = "latest";
// salt-call releases newer than this understand --retcode-passthrough.
const RETCODE_VERSION: &str = "0.17.5";

const BOOTSTRAP_SCRIPT_PATH: &str = "/tmp/bootstrap-salt.sh";
const APT_KEY_PATH: &str = "/tmp/repo.key";
const APT_SETTLE_SECONDS: u32 = 10;
const INSTALL_FAILURE_EXIT: i32 = 2;

const RUNTIME_DEPENDENCY_MARKER: &str = "/opt/chef";
const RUNTIME_DEPENDENCY_CACHE_DIR: &str = "/tmp/vagrant-cache/omnibus_chef";
const RUNTIME_DEPENDENCY_TEMP_DIR: &str = "/tmp";

const FAILURE_SIGNATURES: [&str; 3] = [
    "Result.*False",
    "Data.failed.to.compile",
    "No.matching.sls.found.for",
];
const GREP_FOUND: i32 = 0;
const GREP_NOT_FOUND: i32 = 1;
const GREP_ERROR: i32 = 2;

const SALT_EXTENSION_DIRS: [&str; 5] = [
    "_modules",
    "_states",
    "_grains",
    "_renderers",
    "_returners",
];

const SHELL_HELPERS: &str = r#"# returns 0 when the command is on PATH
exists() {
  command -v "$1" >/dev/null 2>&1
}

do_wget() {
  echo "trying wget..."
  wget -q -O "$2" "$1" || return 1
}

do_curl() {
  echo "trying curl..."
  curl -sSfL -o "$2" "$1" || return 1
}

do_fetch() {
  echo "trying fetch..."
  fetch -q -o "$2" "$1" || return 1
}

do_download() {
  echo "downloading $1"
  echo "  to file $2"
  if exists wget; then
    do_wget "$1" "$2" && return 0
  fi
  if exists curl; then
    do_curl "$1" "$2" && return 0
  fi
  if exists fetch; then
    do_fetch "$1" "$2" && return 0
  fi
  echo "Unable to download $1 (tried wget, curl, fetch)"
  return 1
}
"#;

#[derive(Parser, Debug)]
#[command(
    name = "salt-solo",
    version,
    about = "Masterless Salt provisioner for test instances"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    InitScript,
    Sandbox {
        #[arg(long)]
        sandbox_dir: Option<PathBuf>,
    },
    InstallScript,
    RunScript {
        #[arg(long)]
        installed_version: Option<String>,
    },
    Classify {
        #[arg(long, value_parser = clap::value_parser!(i32).range(0..=255))]
        exit_code: i32,
        #[arg(long)]
        output_file: Option<PathBuf>,
        #[arg(long)]
        installed_version: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Error)]
enum SaltSoloError {
    #[error("config error: {0}")]
    Config(String),
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum InstallMethod {
    #[default]
    Bootstrap,
    Apt,
    Ppa,
}

impl InstallMethod {
    fn as_str(&self) -> &'static str {
        match self {
            InstallMethod::Bootstrap => "bootstrap",
            InstallMethod::Apt => "apt",
            InstallMethod::Ppa => "ppa",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct Dependency {
    path: String,
    name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct ProvisionerConfig {
    version: u32,
    install_method: InstallMethod,
    requested_version: String,
    bootstrap_url: String,
    bootstrap_options: String,
    apt_repo: String,
    apt_repo_key: String,
    ppa_name: String,
    require_runtime_dependency: bool,
    runtime_dependency_url: String,
    runtime_dependency_cache: bool,
    sudo: bool,
    sudo_command: String,
    salt_call: String,
    root_path: String,
    config_dir: String,
    minion_config: String,
    salt_env: String,
    file_root: String,
    pillar_root: String,
    state_top_path: String,
    state_top: BTreeMap<String, serde_yaml::Value>,
    state_top_from_file: bool,
    run_highstate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
    capture_file: String,
    state_collection_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection_name: Option<String>,
    is_file_root: bool,
    copy_filter: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor_path: Option<String>,
    dependencies: Vec<Dependency>,
    kitchen_root: String,
    formula_name: String,
    pillars: BTreeMap<String, serde_yaml::Value>,
    pillars_from_files: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grains: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_path: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            install_method: InstallMethod::Bootstrap,
            requested_version: LATEST.to_string(),
            bootstrap_url: "http://bootstrap.saltstack.org".to_string(),
            bootstrap_options: "".to_string(),
            apt_repo: "http://apt.mccartney.ie".to_string(),
            apt_repo_key: "http://apt.mccartney.ie/KEY".to_string(),
            ppa_name: "ppa:saltstack/salt".to_string(),
            require_runtime_dependency: true,
            runtime_dependency_url: "https://www.getchef.com/chef/install.sh".to_string(),
            runtime_dependency_cache: false,
            sudo: true,
            sudo_command: "sudo -E".to_string(),
            salt_call: "salt-call".to_string(),
            root_path: "/tmp/kitchen".to_string(),
            config_dir: "/etc/salt".to_string(),
            minion_config: "/etc/salt/minion".to_string(),
            salt_env: "base".to_string(),
            file_root: "/srv/salt".to_string(),
            pillar_root: "/srv/pillar".to_string(),
            state_top_path: "/srv/salt/top.sls".to_string(),
            state_top: BTreeMap::new(),
            state_top_from_file: false,
            run_highstate: true,
            log_level: None,
            capture_file: "/tmp/salt-call-output".to_string(),
            state_collection_mode: false,
            collection_name: None,
            is_file_root: false,
            copy_filter: Vec::new(),
            vendor_path: None,
            dependencies: Vec::new(),
            kitchen_root: ".".to_string(),
            formula_name: "".to_string(),
            pillars: BTreeMap::new(),
            pillars_from_files: BTreeMap::new(),
            grains: None,
            data_path: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), SaltSoloError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command).map(|()| 0),
        Commands::InitScript => handle_init_script(&ctx).map(|()| 0),
        Commands::Sandbox { sandbox_dir } => handle_sandbox(&ctx, sandbox_dir).map(|()| 0),
        Commands::InstallScript => handle_install_script(&ctx).map(|()| 0),
        Commands::RunScript { installed_version } => {
            handle_run_script(&ctx, installed_version).map(|()| 0)
        }
        Commands::Classify {
            exit_code,
            output_file,
            installed_version,
        } => handle_classify(&ctx, exit_code, output_file, installed_version),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{err}");
            }
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("SALT_SOLO_LOG")
        .from_env_lossy();
    // stdout carries scripts and JSON, so logs stay on stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SALT_SOLO_CONFIG") {
        return PathBuf::from(path);
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SALT_SOLO_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("salt-solo");
    base
}

fn ensure_parent(path: &Path) -> Result<(), SaltSoloError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config_from_str(content: &str) -> Result<ProvisionerConfig, SaltSoloError> {
    let cfg: ProvisionerConfig = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(SaltSoloError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<ProvisionerConfig, SaltSoloError> {
    let content = fs::read_to_string(path).map_err(|err| {
        SaltSoloError::Config(format!("cannot read {}: {err}", path.display()))
    })?;
    read_config_from_str(&content)
}

fn is_shell_word(value: &str) -> bool {
    !value.is_empty() && !value.chars().any(|ch| ch.is_whitespace() || ch == '\'' || ch == '"')
}

fn validate_config(cfg: &ProvisionerConfig) -> Result<(), SaltSoloError> {
    let root = cfg.root_path.trim();
    if !is_shell_word(root) {
        return Err(SaltSoloError::Config(
            "root_path must be a non-empty path without whitespace or quotes".to_string(),
        ));
    }
    if !root.starts_with('/') {
        return Err(SaltSoloError::Config(format!(
            "root_path must be absolute, got '{root}'"
        )));
    }
    if root.trim_end_matches('/').is_empty() {
        return Err(SaltSoloError::Config(
            "root_path must not be the filesystem root".to_string(),
        ));
    }
    let version = cfg.requested_version.as_str();
    let version_ok = version == LATEST
        || (!version.is_empty()
            && version
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_')));
    if !version_ok {
        return Err(SaltSoloError::Config(format!(
            "requested_version must be '{LATEST}' or a release like 2015.5.3, got '{version}'"
        )));
    }
    if cfg.salt_call.trim().is_empty() {
        return Err(SaltSoloError::Config("salt_call must be non-empty".to_string()));
    }
    if !is_shell_word(&cfg.capture_file) {
        return Err(SaltSoloError::Config(
            "capture_file must be a non-empty path without whitespace or quotes".to_string(),
        ));
    }
    if let Some(level) = cfg.log_level.as_deref() {
        if !is_shell_word(level) {
            return Err(SaltSoloError::Config(format!(
                "log_level must be a single word, got '{level}'"
            )));
        }
    }
    let layout = [
        ("config_dir", &cfg.config_dir),
        ("minion_config", &cfg.minion_config),
        ("file_root", &cfg.file_root),
        ("pillar_root", &cfg.pillar_root),
        ("state_top_path", &cfg.state_top_path),
    ];
    for (field, value) in layout {
        validate_layout_path(field, value)?;
    }
    for (index, dep) in cfg.dependencies.iter().enumerate() {
        if dep.path.trim().is_empty() || dep.name.trim().is_empty() {
            return Err(SaltSoloError::Config(format!(
                "dependencies[{index}] needs both path and name"
            )));
        }
    }
    Ok(())
}

// Layout paths live under root_path remotely and under the sandbox locally.
fn validate_layout_path(field: &str, value: &str) -> Result<(), SaltSoloError> {
    let path = Path::new(value);
    let confined = is_shell_word(value)
        && value.starts_with('/')
        && !value.trim_end_matches('/').is_empty()
        && !path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
    if !confined {
        return Err(SaltSoloError::Config(format!(
            "{field} must be an absolute path below the root without '..', whitespace or quotes, got '{value}'"
        )));
    }
    Ok(())
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn diagnose(cfg: &ProvisionerConfig) -> String {
    match serde_yaml::to_string(cfg) {
        Ok(text) => format!("provisioner config:\n{text}"),
        Err(err) => format!("provisioner config could not be rendered: {err}"),
    }
}

fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn remote_join(root: &str, path: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shell {
    sudo_command: Option<String>,
}

impl Shell {
    fn from_config(cfg: &ProvisionerConfig) -> Self {
        let sudo_command = cfg.sudo_command.trim();
        Self {
            sudo_command: if cfg.sudo && !sudo_command.is_empty() {
                Some(sudo_command.to_string())
            } else {
                None
            },
        }
    }

    fn sudo(&self, command: &str) -> String {
        match &self.sudo_command {
            Some(prefix) => format!("{prefix} {command}"),
            None => command.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum VersionOrdering {
    Below,
    AtOrAbove,
    Unknown,
}

// Orders `requested` against `threshold` the way the shell's string `>` does:
// byte by byte, so "0.9" sorts above "0.17.5" and "0.10.0" below it.
fn compare_version(requested: &str, threshold: &str) -> VersionOrdering {
    if requested == LATEST {
        return VersionOrdering::AtOrAbove;
    }
    if requested.trim().is_empty() {
        return VersionOrdering::Unknown;
    }
    if requested > threshold {
        VersionOrdering::AtOrAbove
    } else {
        VersionOrdering::Below
    }
}

#[derive(Debug, Clone, Serialize)]
struct InstallPlan {
    script: String,
    version_check: String,
    bootstrap_options: String,
}

#[derive(Debug, Clone)]
struct RuntimeDependency {
    url: String,
    download_dir: &'static str,
}

#[derive(Debug, Clone)]
struct InstallParams {
    method: InstallMethod,
    version: String,
    salt_call: String,
    bootstrap_url: String,
    bootstrap_options: String,
    apt_repo: String,
    apt_repo_key: String,
    ppa_name: String,
    runtime_dependency: Option<RuntimeDependency>,
}

impl InstallParams {
    fn from_config(cfg: &ProvisionerConfig) -> Self {
        let runtime_dependency = cfg.require_runtime_dependency.then(|| RuntimeDependency {
            url: cfg.runtime_dependency_url.clone(),
            download_dir: if cfg.runtime_dependency_cache {
                RUNTIME_DEPENDENCY_CACHE_DIR
            } else {
                RUNTIME_DEPENDENCY_TEMP_DIR
            },
        });
        Self {
            method: cfg.install_method,
            version: cfg.requested_version.clone(),
            salt_call: cfg.salt_call.clone(),
            bootstrap_url: cfg.bootstrap_url.clone(),
            bootstrap_options: effective_bootstrap_options(cfg),
            apt_repo: cfg.apt_repo.clone(),
            apt_repo_key: cfg.apt_repo_key.clone(),
            ppa_name: cfg.ppa_name.clone(),
            runtime_dependency,
        }
    }
}

fn effective_bootstrap_options(cfg: &ProvisionerConfig) -> String {
    if cfg.requested_version != LATEST
        && cfg.install_method == InstallMethod::Bootstrap
        && cfg.bootstrap_options.trim().is_empty()
    {
        debug!(
            "using bootstrap git to install {}",
            cfg.requested_version
        );
        return format!("-P git v{}", cfg.requested_version);
    }
    cfg.bootstrap_options.clone()
}

fn build_install_script(cfg: &ProvisionerConfig) -> InstallPlan {
    debug!("{}", diagnose(cfg));
    let params = InstallParams::from_config(cfg);
    render_install_script(&params, &Shell::from_config(cfg))
}

fn echo_line(indent: &str, text: &str) -> String {
    format!("{indent}echo {}\n", shell_single_quote(text))
}

fn render_install_strategy(params: &InstallParams, shell: &Shell) -> String {
    let version = &params.version;
    let mut out = String::new();
    match params.method {
        InstallMethod::Bootstrap => {
            // a failed download falls through to the re-probe below
            out.push_str(&format!(
                "  if do_download {} {BOOTSTRAP_SCRIPT_PATH}\n  then\n",
                shell_single_quote(&params.bootstrap_url)
            ));
            out.push_str(&format!(
                "    {} {BOOTSTRAP_SCRIPT_PATH} {}\n  fi\n",
                shell.sudo("sh"),
                params.bootstrap_options
            ));
        }
        InstallMethod::Apt => {
            out.push_str("  if exists lsb_release; then\n");
            out.push_str("    DISTRIB_CODENAME=`lsb_release -s -c`\n");
            out.push_str("  else\n");
            out.push_str("    . /etc/lsb-release\n");
            out.push_str("  fi\n");
            out.push_str(&echo_line(
                "  ",
                &format!("-----> Configuring apt repo for salt {version}"),
            ));
            out.push_str(&format!(
                "  echo \"deb {}/salt-{version} ${{DISTRIB_CODENAME}} main\" | {} /etc/apt/sources.list.d/salt-{version}.list\n",
                params.apt_repo.trim_end_matches('/'),
                shell.sudo("tee")
            ));
            out.push_str(&format!(
                "  do_download {} {APT_KEY_PATH}\n",
                shell_single_quote(&params.apt_repo_key)
            ));
            out.push_str(&format!("  {} add {APT_KEY_PATH}\n", shell.sudo("apt-key")));
            out.push_str(&format!("  {} update\n", shell.sudo("apt-get")));
            // apt-get update races the following installs without a pause
            out.push_str(&format!("  sleep {APT_SETTLE_SECONDS}\n"));
            out.push_str(&echo_line(
                "  ",
                &format!("-----> Installing salt-minion ({version})"),
            ));
            for package in ["python-support", "salt-minion", "salt-common", "salt-minion"] {
                out.push_str(&format!(
                    "  {} install -y {package}\n",
                    shell.sudo("apt-get")
                ));
            }
        }
        InstallMethod::Ppa => {
            out.push_str(&format!(
                "  {} -y {}\n",
                shell.sudo("apt-add-repository"),
                shell_single_quote(&params.ppa_name)
            ));
            out.push_str(&format!("  {} update\n", shell.sudo("apt-get")));
            out.push_str(&format!(
                "  {} install -y salt-minion\n",
                shell.sudo("apt-get")
            ));
        }
    }
    out
}

fn render_runtime_dependency(dependency: &RuntimeDependency, shell: &Shell) -> String {
    let dir = dependency.download_dir;
    let mut out = String::new();
    out.push_str(&format!("if [ ! -d \"{RUNTIME_DEPENDENCY_MARKER}\" ]\nthen\n"));
    out.push_str(&echo_line(
        "  ",
        "-----> Installing Chef Omnibus (for busser/serverspec ruby support)",
    ));
    out.push_str(&format!("  mkdir -p {dir}\n"));
    out.push_str(&format!("  if [ ! -x {dir}/install.sh ]\n  then\n"));
    out.push_str(&format!(
        "    do_download {} {dir}/install.sh || exit 1\n",
        shell_single_quote(&dependency.url)
    ));
    out.push_str("  fi\n");
    out.push_str(&format!(
        "  {} {dir}/install.sh -d {dir}\n",
        shell.sudo("sh")
    ));
    out.push_str("fi\n");
    out
}

fn render_install_script(params: &InstallParams, shell: &Shell) -> InstallPlan {
    let version = &params.version;
    let probe = format!(
        "SALT_VERSION=`{} --version 2>/dev/null | cut -d \" \" -f 2`\n",
        params.salt_call
    );
    let version_check = format!(
        "[ \"${{SALT_VERSION}}\" = \"{version}\" -o \"{version}\" = \"{LATEST}\" ]"
    );

    let mut body = String::new();
    body.push_str(SHELL_HELPERS);
    body.push('\n');
    body.push_str("# what version of salt is installed?\n");
    body.push_str(&probe);
    body.push_str("\nif [ -z \"${SALT_VERSION}\" ]\nthen\n");
    body.push_str(&render_install_strategy(params, shell));
    body.push_str("fi\n\n");

    body.push_str("# check again, now that an install of some form should have happened\n");
    body.push_str(&probe);
    body.push_str("\nif [ -z \"${SALT_VERSION}\" ]\nthen\n");
    body.push_str(&echo_line(
        "  ",
        "No salt-minion installed, install must have failed!!",
    ));
    let settings = [
        ("install_method", params.method.as_str()),
        ("bootstrap_url", params.bootstrap_url.as_str()),
        ("bootstrap_options", params.bootstrap_options.as_str()),
        ("requested_version", params.version.as_str()),
        ("apt_repo", params.apt_repo.as_str()),
        ("apt_repo_key", params.apt_repo_key.as_str()),
        ("ppa_name", params.ppa_name.as_str()),
    ];
    for (key, value) in settings {
        body.push_str(&echo_line("  ", &format!("{key} = {value}")));
    }
    body.push_str(&format!("  exit {INSTALL_FAILURE_EXIT}\n"));
    body.push_str(&format!("elif {version_check}\nthen\n"));
    body.push_str(&format!(
        "  echo \"You asked for {version} and you have ${{SALT_VERSION}} installed, sweet!\"\n"
    ));
    if params.method == InstallMethod::Bootstrap {
        body.push_str("else\n");
        body.push_str(
            "  echo \"You asked for bootstrap install and you have got ${SALT_VERSION}, hope thats ok!\"\n",
        );
    } else {
        body.push_str("else\n");
        body.push_str(&format!(
            "  echo \"You asked for {version} and you have got ${{SALT_VERSION}} installed, dunno how to fix that, sorry!\"\n"
        ));
        body.push_str(&format!("  exit {INSTALL_FAILURE_EXIT}\n"));
    }
    body.push_str("fi\n");

    if let Some(dependency) = &params.runtime_dependency {
        body.push('\n');
        body.push_str(&render_runtime_dependency(dependency, shell));
    }

    InstallPlan {
        script: format!("sh -c {}\n", shell_single_quote(&body)),
        version_check,
        bootstrap_options: params.bootstrap_options.clone(),
    }
}

fn build_init_script(cfg: &ProvisionerConfig) -> String {
    debug!("initialising instance by cleaning {}", cfg.root_path);
    let shell = Shell::from_config(cfg);
    let root = cfg.root_path.trim();
    format!("{} -rf {root} ; mkdir -p {root}", shell.sudo("rm"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DetectionMode {
    Passthrough,
    Heuristic,
}

// One step of the heuristic decision table. Rules are tried in order and the
// first one that fires decides the exit code; `SC` is salt-call's status and
// `EC` is the status of the grep for failure signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitRule {
    NonZeroStatus,
    SignatureFound(i32),
    SignatureAbsent(i32),
}

const HEURISTIC_RULES: [ExitRule; 3] = [
    ExitRule::NonZeroStatus,
    ExitRule::SignatureFound(1),
    ExitRule::SignatureAbsent(0),
];
// Subshell status when no rule fires: the last `[` test failed.
const UNMATCHED_EXIT: i32 = 1;

impl ExitRule {
    fn apply(&self, status: i32, grep_status: i32) -> Option<i32> {
        match *self {
            ExitRule::NonZeroStatus => (status != 0).then_some(status),
            ExitRule::SignatureFound(code) => (grep_status == GREP_FOUND).then_some(code),
            ExitRule::SignatureAbsent(code) => (grep_status == GREP_NOT_FOUND).then_some(code),
        }
    }

    fn render(&self) -> String {
        match *self {
            ExitRule::NonZeroStatus => "[ ${SC} -ne 0 ] && exit ${SC}".to_string(),
            ExitRule::SignatureFound(code) => {
                format!("[ ${{EC}} -eq {GREP_FOUND} ] && exit {code}")
            }
            ExitRule::SignatureAbsent(code) => {
                format!("[ ${{EC}} -eq {GREP_NOT_FOUND} ] && exit {code}")
            }
        }
    }
}

fn heuristic_exit_code(status: i32, grep_status: i32) -> i32 {
    HEURISTIC_RULES
        .iter()
        .find_map(|rule| rule.apply(status, grep_status))
        .unwrap_or(UNMATCHED_EXIT)
}

fn failure_grep() -> String {
    let mut grep = "grep".to_string();
    for signature in FAILURE_SIGNATURES {
        grep.push_str(" -e ");
        grep.push_str(signature);
    }
    grep
}

// Returns grep's status for the captured output: lines that restate the
// grep command itself are dropped before looking for a failure signature.
fn scan_for_failures(output: &str) -> Result<i32, SaltSoloError> {
    let restatement = Regex::new(&failure_grep())?;
    let signatures = Regex::new(&FAILURE_SIGNATURES.join("|"))?;
    let found = output
        .lines()
        .filter(|line| !restatement.is_match(line))
        .any(|line| signatures.is_match(line));
    Ok(if found { GREP_FOUND } else { GREP_NOT_FOUND })
}

#[derive(Debug, Clone, Serialize)]
struct RunOutcome {
    exit_code: i32,
    detection_mode: DetectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    captured_output: Option<String>,
}

fn classify_run(
    mode: DetectionMode,
    status: i32,
    captured_output: Option<String>,
) -> Result<RunOutcome, SaltSoloError> {
    match mode {
        DetectionMode::Passthrough => Ok(RunOutcome {
            exit_code: status,
            detection_mode: mode,
            captured_output: None,
        }),
        DetectionMode::Heuristic => {
            let grep_status = match captured_output.as_deref() {
                Some(output) => scan_for_failures(output)?,
                None => GREP_ERROR,
            };
            Ok(RunOutcome {
                exit_code: heuristic_exit_code(status, grep_status),
                detection_mode: mode,
                captured_output,
            })
        }
    }
}

#[derive(Debug, Clone)]
struct RunParams {
    command: String,
    mode: DetectionMode,
    evaluated_version: String,
    capture_file: String,
}

impl RunParams {
    fn from_config(cfg: &ProvisionerConfig, installed_version: Option<&str>) -> Self {
        let shell = Shell::from_config(cfg);
        let mut command = shell.sudo(&format!(
            "{} --config-dir={} --local state.highstate",
            cfg.salt_call,
            remote_join(&cfg.root_path, &cfg.config_dir)
        ));
        if let Some(level) = cfg.log_level.as_deref() {
            command.push_str(&format!(" --log-level={level}"));
        }
        let (mode, evaluated_version) =
            select_detection_mode(&cfg.requested_version, installed_version);
        Self {
            command,
            mode,
            evaluated_version,
            capture_file: cfg.capture_file.clone(),
        }
    }
}

fn select_detection_mode(requested: &str, installed: Option<&str>) -> (DetectionMode, String) {
    let evaluated = match installed.map(str::trim) {
        Some(version) if requested != LATEST && !version.is_empty() => version,
        _ => requested,
    };
    let mode = match compare_version(evaluated, RETCODE_VERSION) {
        VersionOrdering::AtOrAbove => DetectionMode::Passthrough,
        VersionOrdering::Below | VersionOrdering::Unknown => DetectionMode::Heuristic,
    };
    debug!("salt version {evaluated} selects {mode:?} result detection");
    (mode, evaluated.to_string())
}

fn render_run_script(params: &RunParams) -> String {
    match params.mode {
        DetectionMode::Passthrough => format!("{} --retcode-passthrough", params.command),
        DetectionMode::Heuristic => {
            let grep = failure_grep();
            let capture = &params.capture_file;
            let rules = HEURISTIC_RULES
                .iter()
                .map(ExitRule::render)
                .collect::<Vec<_>>()
                .join(" ; ");
            format!(
                "set -o pipefail ; {command} 2>&1 | tee {capture} ; SC=$? ; echo salt-call exit code: $SC ; \
                 (sed '/{grep}/d' {capture} | {grep} ; EC=$? ; echo salt-call output grep exit code ${{EC}} ; {rules})",
                command = params.command
            )
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RunScript {
    #[serde(skip_serializing_if = "Option::is_none")]
    detection_mode: Option<DetectionMode>,
    evaluated_version: String,
    script: String,
}

fn build_run_script(cfg: &ProvisionerConfig, installed_version: Option<&str>) -> RunScript {
    debug!("{}", diagnose(cfg));
    if !cfg.run_highstate {
        info!("run_highstate is disabled, the run script only reports the skip");
        return RunScript {
            detection_mode: None,
            evaluated_version: cfg.requested_version.clone(),
            script: "echo '-----> run_highstate is disabled, skipping salt-call'".to_string(),
        };
    }
    let params = RunParams::from_config(cfg, installed_version);
    RunScript {
        detection_mode: Some(params.mode),
        evaluated_version: params.evaluated_version.clone(),
        script: render_run_script(&params),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum ArtifactKind {
    Data,
    MinionConfig,
    PillarRoot,
    Pillar,
    Grains,
    Formula,
    StateCollection,
    StateTop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ArtifactSource {
    Directory,
    Tree { path: PathBuf },
    File { path: PathBuf },
    Generated { content: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct StagedArtifact {
    kind: ArtifactKind,
    destination: PathBuf,
    source: ArtifactSource,
}

#[derive(Debug, Clone, Default, Serialize)]
struct SandboxManifest {
    artifacts: Vec<StagedArtifact>,
    copy_filter: Vec<String>,
}

impl SandboxManifest {
    fn stage(&mut self, kind: ArtifactKind, destination: PathBuf, source: ArtifactSource) {
        debug!("staging {kind:?} at {}", destination.display());
        self.artifacts.push(StagedArtifact {
            kind,
            destination,
            source,
        });
    }
}

#[derive(Debug, Serialize)]
struct MinionConfig {
    state_top: String,
    file_client: String,
    file_roots: BTreeMap<String, Vec<String>>,
    pillar_roots: BTreeMap<String, Vec<String>>,
}

fn sandbox_relative(remote_path: &str) -> PathBuf {
    PathBuf::from(remote_path.trim_start_matches('/'))
}

fn kitchen_root(cfg: &ProvisionerConfig) -> PathBuf {
    PathBuf::from(expand_path(&cfg.kitchen_root))
}

fn resolve_local(cfg: &ProvisionerConfig, raw: &str) -> PathBuf {
    let path = PathBuf::from(expand_path(raw));
    if path.is_absolute() {
        path
    } else {
        kitchen_root(cfg).join(path)
    }
}

fn checked_name<'a>(name: &'a str, field: &str) -> Result<&'a str, SaltSoloError> {
    let name = name.trim();
    let path = Path::new(name);
    let plain = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(SaltSoloError::Config(format!(
            "{field} must be a relative name without '..', got '{name}'"
        )));
    }
    Ok(name)
}

fn assemble_sandbox(cfg: &ProvisionerConfig) -> Result<SandboxManifest, SaltSoloError> {
    debug!("{}", diagnose(cfg));
    let mut manifest = SandboxManifest {
        artifacts: Vec::new(),
        copy_filter: cfg.copy_filter.clone(),
    };
    stage_data(cfg, &mut manifest)?;
    stage_minion(cfg, &mut manifest)?;
    stage_pillars(cfg, &mut manifest)?;
    stage_grains(cfg, &mut manifest)?;

    if cfg.state_collection_mode || cfg.is_file_root {
        stage_state_collection(cfg, &mut manifest)?;
    } else {
        let formula = checked_name(&cfg.formula_name, "formula_name")?;
        stage_formula(cfg, &kitchen_root(cfg), formula, &mut manifest)?;
        if let Some(vendor_path) = cfg.vendor_path.as_deref() {
            let vendor_dir = resolve_local(cfg, vendor_path);
            if !vendor_dir.is_dir() {
                return Err(SaltSoloError::Config(format!(
                    "invalid vendor_path set: {vendor_path}"
                )));
            }
            for name in subdirectory_names(&vendor_dir)? {
                stage_formula(cfg, &vendor_dir, &name, &mut manifest)?;
            }
        }
    }

    for dep in &cfg.dependencies {
        let name = checked_name(&dep.name, "dependencies.name")?;
        stage_formula(cfg, &resolve_local(cfg, &dep.path), name, &mut manifest)?;
    }
    stage_state_top(cfg, &mut manifest)?;
    Ok(manifest)
}

fn subdirectory_names(dir: &Path) -> Result<Vec<String>, SaltSoloError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn stage_data(cfg: &ProvisionerConfig, manifest: &mut SandboxManifest) -> Result<(), SaltSoloError> {
    let destination = PathBuf::from("data");
    match cfg.data_path.as_deref() {
        Some(raw) => {
            let path = resolve_local(cfg, raw);
            if !path.is_dir() {
                return Err(SaltSoloError::Config(format!(
                    "data_path is not a directory: {}",
                    path.display()
                )));
            }
            manifest.stage(ArtifactKind::Data, destination, ArtifactSource::Tree { path });
        }
        None => manifest.stage(ArtifactKind::Data, destination, ArtifactSource::Directory),
    }
    Ok(())
}

fn stage_minion(cfg: &ProvisionerConfig, manifest: &mut SandboxManifest) -> Result<(), SaltSoloError> {
    let state_top = Path::new(&cfg.state_top_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "top.sls".to_string());
    let mut file_roots = BTreeMap::new();
    file_roots.insert(
        cfg.salt_env.clone(),
        vec![remote_join(&cfg.root_path, &cfg.file_root)],
    );
    let mut pillar_roots = BTreeMap::new();
    pillar_roots.insert(
        cfg.salt_env.clone(),
        vec![remote_join(&cfg.root_path, &cfg.pillar_root)],
    );
    let minion = MinionConfig {
        state_top,
        file_client: "local".to_string(),
        file_roots,
        pillar_roots,
    };
    manifest.stage(
        ArtifactKind::MinionConfig,
        sandbox_relative(&cfg.minion_config),
        ArtifactSource::Generated {
            content: serde_yaml::to_string(&minion)?,
        },
    );
    Ok(())
}

fn stage_pillars(cfg: &ProvisionerConfig, manifest: &mut SandboxManifest) -> Result<(), SaltSoloError> {
    let pillar_root = sandbox_relative(&cfg.pillar_root);
    manifest.stage(
        ArtifactKind::PillarRoot,
        pillar_root.clone(),
        ArtifactSource::Directory,
    );
    for (name, value) in &cfg.pillars {
        let name = checked_name(name, "pillars key")?;
        manifest.stage(
            ArtifactKind::Pillar,
            pillar_root.join(name),
            ArtifactSource::Generated {
                content: serde_yaml::to_string(value)?,
            },
        );
    }
    for (name, raw) in &cfg.pillars_from_files {
        let name = checked_name(name, "pillars_from_files key")?;
        let path = resolve_local(cfg, raw);
        if !path.is_file() {
            return Err(SaltSoloError::Config(format!(
                "pillar file for '{name}' not found: {}",
                path.display()
            )));
        }
        manifest.stage(
            ArtifactKind::Pillar,
            pillar_root.join(name),
            ArtifactSource::File { path },
        );
    }
    Ok(())
}

fn stage_grains(cfg: &ProvisionerConfig, manifest: &mut SandboxManifest) -> Result<(), SaltSoloError> {
    if let Some(grains) = &cfg.grains {
        manifest.stage(
            ArtifactKind::Grains,
            sandbox_relative(&cfg.config_dir).join("grains"),
            ArtifactSource::Generated {
                content: serde_yaml::to_string(grains)?,
            },
        );
    }
    Ok(())
}

fn stage_state_collection(
    cfg: &ProvisionerConfig,
    manifest: &mut SandboxManifest,
) -> Result<(), SaltSoloError> {
    let file_root = sandbox_relative(&cfg.file_root);
    let source = kitchen_root(cfg);
    if !source.is_dir() {
        return Err(SaltSoloError::Config(format!(
            "kitchen_root is not a directory: {}",
            source.display()
        )));
    }
    if cfg.is_file_root {
        info!("preparing {} as the salt file root", source.display());
        manifest.stage(
            ArtifactKind::StateCollection,
            file_root,
            ArtifactSource::Tree { path: source },
        );
        return Ok(());
    }
    let name = match cfg.collection_name.as_deref() {
        Some(name) if !name.trim().is_empty() => checked_name(name, "collection_name")?,
        _ => checked_name(&cfg.formula_name, "collection_name or formula_name")?,
    };
    info!("preparing state collection {name} from {}", source.display());
    manifest.stage(
        ArtifactKind::StateCollection,
        file_root.join(name),
        ArtifactSource::Tree { path: source },
    );
    Ok(())
}

fn stage_formula(
    cfg: &ProvisionerConfig,
    base: &Path,
    name: &str,
    manifest: &mut SandboxManifest,
) -> Result<(), SaltSoloError> {
    let source = base.join(name);
    if !source.is_dir() {
        return Err(SaltSoloError::Config(format!(
            "formula '{name}' not found in {}",
            base.display()
        )));
    }
    info!("preparing formula {name} from {}", base.display());
    let file_root = sandbox_relative(&cfg.file_root);
    manifest.stage(
        ArtifactKind::Formula,
        file_root.join(name),
        ArtifactSource::Tree { path: source },
    );
    for extension in SALT_EXTENSION_DIRS {
        let path = base.join(extension);
        if path.is_dir() {
            manifest.stage(
                ArtifactKind::Formula,
                file_root.join(extension),
                ArtifactSource::Tree { path },
            );
        }
    }
    Ok(())
}

fn stage_state_top(cfg: &ProvisionerConfig, manifest: &mut SandboxManifest) -> Result<(), SaltSoloError> {
    let destination = sandbox_relative(&cfg.state_top_path);
    if cfg.state_top_from_file {
        let path = kitchen_root(cfg).join("top.sls");
        if !path.is_file() {
            return Err(SaltSoloError::Config(format!(
                "state_top_from_file is set but {} does not exist",
                path.display()
            )));
        }
        manifest.stage(ArtifactKind::StateTop, destination, ArtifactSource::File { path });
        return Ok(());
    }
    let content = if cfg.state_top.is_empty() {
        let formula = checked_name(&cfg.formula_name, "formula_name (needed for the default state_top)")?;
        let mut targets = BTreeMap::new();
        targets.insert("*".to_string(), vec![formula.to_string()]);
        let mut top = BTreeMap::new();
        top.insert(cfg.salt_env.clone(), targets);
        serde_yaml::to_string(&top)?
    } else {
        serde_yaml::to_string(&cfg.state_top)?
    };
    manifest.stage(
        ArtifactKind::StateTop,
        destination,
        ArtifactSource::Generated { content },
    );
    Ok(())
}

fn default_sandbox_dir(cfg: &ProvisionerConfig) -> PathBuf {
    let name = if cfg.formula_name.trim().is_empty() {
        "sandbox".to_string()
    } else {
        cfg.formula_name.trim().replace(['/', '\\'], "_")
    };
    env::temp_dir().join("salt-solo").join(name)
}

fn prepare_sandbox_dir(sandbox_dir: &Path) -> Result<(), SaltSoloError> {
    if sandbox_dir.exists() {
        let owned = sandbox_dir.join(SANDBOX_MARKER).exists();
        let empty = fs::read_dir(sandbox_dir)?.next().is_none();
        if !owned && !empty {
            return Err(SaltSoloError::Sandbox(format!(
                "refusing to clear {}: not a salt-solo sandbox",
                sandbox_dir.display()
            )));
        }
        fs::remove_dir_all(sandbox_dir)?;
    }
    fs::create_dir_all(sandbox_dir)?;
    fs::write(sandbox_dir.join(SANDBOX_MARKER), "")?;
    Ok(())
}

fn write_sandbox(manifest: &SandboxManifest, sandbox_dir: &Path) -> Result<(), SaltSoloError> {
    prepare_sandbox_dir(sandbox_dir)?;
    let sandbox_abs = fs::canonicalize(sandbox_dir)?;
    for artifact in &manifest.artifacts {
        let destination = sandbox_dir.join(&artifact.destination);
        match &artifact.source {
            ArtifactSource::Directory => fs::create_dir_all(&destination)?,
            ArtifactSource::Tree { path } => {
                copy_tree(path, &destination, &manifest.copy_filter, &sandbox_abs)?
            }
            ArtifactSource::File { path } => {
                ensure_parent(&destination)?;
                fs::copy(path, &destination)?;
            }
            ArtifactSource::Generated { content } => {
                ensure_parent(&destination)?;
                fs::write(&destination, content)?;
            }
        }
    }
    info!(
        "wrote {} artifacts to {}",
        manifest.artifacts.len(),
        sandbox_dir.display()
    );
    Ok(())
}

// Entries named in `filter`, and anything under `skip` (the sandbox itself),
// are not copied. Existing files at the destination are overwritten.
fn copy_tree(
    source: &Path,
    destination: &Path,
    filter: &[String],
    skip: &Path,
) -> Result<(), SaltSoloError> {
    let source = fs::canonicalize(source)?;
    fs::create_dir_all(destination)?;
    let walker = WalkDir::new(&source)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !filter.iter().any(|skipped| *skipped == *name)
                && !entry.path().starts_with(skip)
        });
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(&source)
            .map_err(|err| SaltSoloError::Sandbox(err.to_string()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            ensure_parent(&target)?;
            fs::copy(entry.path(), &target)?;
        } else {
            warn!("skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SaltSoloError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = read_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn handle_init_script(ctx: &Context) -> Result<(), SaltSoloError> {
    let cfg = read_config(&ctx.config_path)?;
    let script = build_init_script(&cfg);
    if ctx.json {
        return output(ctx, json!({"script": script}));
    }
    println!("{script}");
    Ok(())
}

fn handle_sandbox(ctx: &Context, sandbox_dir: Option<PathBuf>) -> Result<(), SaltSoloError> {
    let cfg = read_config(&ctx.config_path)?;
    let manifest = assemble_sandbox(&cfg)?;
    let sandbox_dir = sandbox_dir.unwrap_or_else(|| default_sandbox_dir(&cfg));
    write_sandbox(&manifest, &sandbox_dir)?;
    if ctx.json {
        return output(
            ctx,
            json!({"sandbox_dir": sandbox_dir, "manifest": manifest}),
        );
    }
    for artifact in &manifest.artifacts {
        println!(
            "{}",
            sandbox_dir.join(&artifact.destination).display()
        );
    }
    Ok(())
}

fn handle_install_script(ctx: &Context) -> Result<(), SaltSoloError> {
    let cfg = read_config(&ctx.config_path)?;
    let plan = build_install_script(&cfg);
    if ctx.json {
        return output(ctx, serde_json::to_value(&plan)?);
    }
    print!("{}", plan.script);
    Ok(())
}

fn handle_run_script(ctx: &Context, installed_version: Option<String>) -> Result<(), SaltSoloError> {
    let cfg = read_config(&ctx.config_path)?;
    let run = build_run_script(&cfg, installed_version.as_deref());
    if ctx.json {
        return output(ctx, serde_json::to_value(&run)?);
    }
    println!("{}", run.script);
    Ok(())
}

fn handle_classify(
    ctx: &Context,
    exit_code: i32,
    output_file: Option<PathBuf>,
    installed_version: Option<String>,
) -> Result<i32, SaltSoloError> {
    let cfg = read_config(&ctx.config_path)?;
    let run = build_run_script(&cfg, installed_version.as_deref());
    let mode = run.detection_mode.unwrap_or(DetectionMode::Passthrough);
    let captured = match output_file {
        Some(path) => match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!("cannot read captured output {}: {err}", path.display());
                None
            }
        },
        None => None,
    };
    let outcome = classify_run(mode, exit_code, captured)?;
    if ctx.json {
        output(ctx, serde_json::to_value(&outcome)?)?;
    } else {
        println!("{}", outcome.exit_code);
    }
    Ok(outcome.exit_code)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SaltSoloError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SaltSoloError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
