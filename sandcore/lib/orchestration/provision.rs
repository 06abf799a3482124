use std::fmt::Write as _;

use chrono::Utc;
use serde_json::json;

use crate::{
    agent::GuestFile,
    config::ServicePorts,
    models::{GuestProvisioning, Repository, Workspace},
    network::NetworkAllocation,
    SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The unprivileged guest user.
pub const GUEST_USER: &str = "dev";

/// Home directory of [`GUEST_USER`].
pub const GUEST_HOME: &str = "/home/dev";

/// Working directory when a sandbox has zero or several repositories.
pub const DEFAULT_WORKSPACE_DIR: &str = "/home/dev/workspace";

/// Network script run by the guest init.
pub const NETWORK_SCRIPT_PATH: &str = "/etc/network-setup.sh";

/// Sandbox description read by the guest agent and init.
pub const SANDBOX_CONFIG_PATH: &str = "/etc/sandbox/config.json";

/// Environment secrets in dotenv form.
pub const SECRETS_ENV_PATH: &str = "/etc/sandbox/secrets/.env";

/// Store used by the git credential helper.
pub const GIT_CREDENTIALS_PATH: &str = "/etc/sandbox/secrets/git-credentials";

/// Guest services started once the agent is up.
pub const AUTOSTART_SERVICES: [&str; 2] = ["vscode", "opencode"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the per-boot guest files are derived from.
#[derive(Debug, Clone, Copy)]
pub struct GuestContext<'a> {
    /// The sandbox id.
    pub sandbox_id: &'a str,

    /// The workspace, if any.
    pub workspace: Option<&'a Workspace>,

    /// The sandbox's network identity.
    pub network: &'a NetworkAllocation,

    /// Nameservers for the guest.
    pub dns_servers: &'a [String],

    /// Guest service ports.
    pub ports: &'a ServicePorts,

    /// Secrets and config files.
    pub provisioning: &'a GuestProvisioning,
}

/// One shell command run in the guest during setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestStep {
    /// What the command is for, used in errors.
    pub context: String,

    /// The shell command line.
    pub command: String,

    /// Whether a non-zero exit fails the setup.
    pub required: bool,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the files injected into a root device before first boot.
pub fn boot_files(ctx: &GuestContext<'_>) -> SandcoreResult<Vec<GuestFile>> {
    let mut files = vec![
        GuestFile::new(NETWORK_SCRIPT_PATH, network_script(ctx.network, ctx.dns_servers))
            .with_mode("755"),
        GuestFile::new(SANDBOX_CONFIG_PATH, sandbox_config(ctx)?).with_owner(GUEST_USER),
    ];

    files.extend(secret_files(ctx.provisioning));

    for (path, content) in &ctx.provisioning.config_files {
        files.push(GuestFile::new(expand_home(path), content.as_str()).with_owner(GUEST_USER));
    }

    files.push(
        GuestFile::new(format!("{GUEST_HOME}/SANDBOX.md"), sandbox_md(ctx)).with_owner(GUEST_USER),
    );

    Ok(files)
}

/// Builds the files re-pushed through the agent after a snapshot restore or a restart: secrets,
/// credentials and config files, but no network script or onboarding doc.
pub fn sync_files(provisioning: &GuestProvisioning) -> Vec<GuestFile> {
    let mut files = secret_files(provisioning);
    for (path, content) in &provisioning.config_files {
        files.push(GuestFile::new(expand_home(path), content.as_str()).with_owner(GUEST_USER));
    }
    files
}

/// The shell command re-addressing `eth0` of a guest restored from a snapshot.
pub fn network_reconfigure_command(network: &NetworkAllocation) -> String {
    format!(
        "ip addr flush dev eth0 && ip addr add {ip}/24 dev eth0 && ip link set eth0 up && ip route replace default via {gw} dev eth0",
        ip = network.ip_address,
        gw = network.gateway,
    )
}

/// The guest commands cloning `repository` from `url`. Only the clone itself must succeed.
pub fn clone_steps(repository: &Repository, url: &str) -> Vec<GuestStep> {
    let target = clone_target(repository);
    let quoted = shell_quote(&target);

    vec![
        GuestStep {
            context: format!("clean {target}"),
            command: format!("rm -rf {quoted}"),
            required: false,
        },
        GuestStep {
            context: format!("clone {}", repository.url),
            command: format!(
                "git clone --depth 1 -b {} {} {quoted}",
                shell_quote(&repository.branch),
                shell_quote(url),
            ),
            required: true,
        },
        GuestStep {
            context: format!("chown {target}"),
            command: format!("chown -R {GUEST_USER}:{GUEST_USER} {quoted}"),
            required: false,
        },
        GuestStep {
            context: format!("trust {target}"),
            command: format!(
                "su - {GUEST_USER} -c {}",
                shell_quote(&format!("git config --global --add safe.directory {target}"))
            ),
            required: false,
        },
    ]
}

/// Where a repository is cloned in the guest.
pub fn clone_target(repository: &Repository) -> String {
    let path = repository.clone_path.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{GUEST_HOME}{path}")
    } else {
        format!("{GUEST_HOME}/{path}")
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn network_script(network: &NetworkAllocation, dns_servers: &[String]) -> String {
    let mut script = format!(
        "#!/bin/sh\n\
         ip addr add 127.0.0.1/8 dev lo\n\
         ip link set lo up\n\
         ip addr add {ip}/24 dev eth0\n\
         ip link set eth0 up\n\
         ip route add default via {gw} dev eth0\n\
         : > /etc/resolv.conf\n",
        ip = network.ip_address,
        gw = network.gateway,
    );
    for dns in dns_servers {
        let _ = writeln!(script, "echo 'nameserver {dns}' >> /etc/resolv.conf");
    }
    script
}

fn sandbox_config(ctx: &GuestContext<'_>) -> SandcoreResult<String> {
    let repos: Vec<_> = ctx
        .workspace
        .map(|ws| ws.repositories.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|r| json!({ "clonePath": r.clone_path, "branch": r.branch }))
        .collect();
    let workspace_dir = workspace_dir(ctx.workspace);
    let ports = ctx.ports;

    let config = json!({
        "sandboxId": ctx.sandbox_id,
        "workspaceId": ctx.workspace.map(|ws| ws.id.as_str()),
        "workspaceName": ctx.workspace.map(|ws| ws.name.as_str()),
        "repos": repos,
        "createdAt": Utc::now().to_rfc3339(),
        "network": {
            "ipAddress": ctx.network.ip_address,
            "gateway": ctx.network.gateway,
        },
        "services": {
            "vscode": {
                "port": ports.get_vscode(),
                "command": format!(
                    "code-server --bind-addr 0.0.0.0:{} --auth none --disable-telemetry {workspace_dir}",
                    ports.get_vscode()
                ),
                "user": GUEST_USER,
                "autoStart": true,
            },
            "opencode": {
                "port": ports.get_opencode(),
                "command": format!(
                    "cd {workspace_dir} && opencode serve --hostname 0.0.0.0 --port {}",
                    ports.get_opencode()
                ),
                "user": GUEST_USER,
                "autoStart": true,
            },
            "terminal": {
                "port": ports.get_terminal(),
                "command": format!("ttyd -p {} -W su - {GUEST_USER}", ports.get_terminal()),
                "user": "root",
                "autoStart": true,
            },
        },
    });

    Ok(serde_json::to_string_pretty(&config)?)
}

fn secret_files(provisioning: &GuestProvisioning) -> Vec<GuestFile> {
    let mut files = Vec::new();

    if !provisioning.secrets.is_empty() {
        let env = provisioning
            .secrets
            .iter()
            .map(|(key, value)| format!("export {key}={}", shell_quote(value)))
            .collect::<Vec<_>>()
            .join("\n");
        files.push(
            GuestFile::new(SECRETS_ENV_PATH, env)
                .with_mode("600")
                .with_owner("root"),
        );
    }

    for (path, content) in &provisioning.file_secrets {
        files.push(
            GuestFile::new(expand_home(path), content.as_str())
                .with_mode("600")
                .with_owner(GUEST_USER),
        );
    }

    if !provisioning.git_credentials.is_empty() {
        files.push(
            GuestFile::new(
                GIT_CREDENTIALS_PATH,
                format!("{}\n", provisioning.git_credentials.join("\n")),
            )
            .with_mode("600")
            .with_owner(GUEST_USER),
        );
        files.push(
            GuestFile::new(
                format!("{GUEST_HOME}/.gitconfig"),
                format!(
                    "[credential]\n\thelper = store --file={GIT_CREDENTIALS_PATH}\n[user]\n\temail = sandbox@localhost\n\tname = Sandbox User\n"
                ),
            )
            .with_owner(GUEST_USER),
        );
    }

    files
}

fn sandbox_md(ctx: &GuestContext<'_>) -> String {
    let mut doc = format!("# Sandbox Environment: {}\n\n", ctx.sandbox_id);

    if let Some(workspace) = ctx.workspace {
        let _ = writeln!(doc, "## Workspace: {}\n\n### Repositories", workspace.name);
        if workspace.repositories.is_empty() {
            doc.push_str("No repositories configured\n");
        }
        for repo in &workspace.repositories {
            let _ = writeln!(doc, "- {} (branch: {})", repo.url, repo.branch);
        }
        doc.push('\n');
    }

    let ports = ctx.ports;
    let _ = write!(
        doc,
        "## Available Services\n\n\
         | Service | URL | Port |\n\
         |---------|-----|------|\n\
         | VSCode Server | http://localhost:{vs} | {vs} |\n\
         | OpenCode Server | http://localhost:{oc} | {oc} |\n\
         | Terminal | http://localhost:{tt} | {tt} |\n\
         | SSH | `ssh dev@{ip}` | {ssh} |\n\n",
        vs = ports.get_vscode(),
        oc = ports.get_opencode(),
        tt = ports.get_terminal(),
        ssh = ports.get_ssh(),
        ip = ctx.network.ip_address,
    );

    doc.push_str(
        "## Secrets\n\n\
         Environment variables are in `/etc/sandbox/secrets/.env`.\n\
         Load them with `source /etc/sandbox/secrets/.env`.\n",
    );

    if !ctx.provisioning.file_secrets.is_empty() {
        doc.push_str("\n### File Secrets\n\n| Path |\n|------|\n");
        for path in ctx.provisioning.file_secrets.keys() {
            let _ = writeln!(doc, "| `{}` |", expand_home(path));
        }
    }

    let _ = write!(
        doc,
        "\n## Workspace\n\nYour code is located in `{}`.\n",
        workspace_dir(ctx.workspace)
    );

    doc
}

fn workspace_dir(workspace: Option<&Workspace>) -> String {
    match workspace.map(|ws| ws.repositories.as_slice()) {
        Some([only]) => clone_target(only),
        _ => DEFAULT_WORKSPACE_DIR.to_string(),
    }
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix('~') {
        Some(rest) => format!("{GUEST_HOME}{rest}"),
        None => path.to_string(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
