//! Agent bootstrap plan
//!
//! The ordered remote steps that install and start an agent on a node over a
//! secure-shell session: probe the platform, create the install directory,
//! stage the binary, write `agent.toml`, then install and start the service.

use bytes::Bytes;

use fp_core::config::{AgentConfig, DeployConfig};
use fp_core::PanelError;

pub const SERVICE_NAME: &str = "fleet-agent";
pub const BINARY_NAME: &str = "fleet-agent";

/// What the node reported for `uname -sm`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn parse(uname: &str) -> Result<Self, PanelError> {
        let mut parts = uname.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(os), Some(arch)) => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
            _ => Err(PanelError::Invalid(format!(
                "unexpected platform probe output '{}'",
                uname.trim()
            ))),
        }
    }

    pub fn ensure_supported(&self) -> Result<(), PanelError> {
        if self.os != "Linux" {
            return Err(PanelError::Invalid(format!(
                "unsupported platform {} {}; agents run on Linux only",
                self.os, self.arch
            )));
        }
        Ok(())
    }
}

/// How a step talks to the node
#[derive(Debug, Clone)]
pub enum StepAction {
    Exec(String),
    Upload {
        path: String,
        content: Bytes,
        mode: u32,
    },
}

#[derive(Debug, Clone)]
pub struct BootstrapStep {
    pub name: &'static str,
    pub action: StepAction,
}

/// Where the binary comes from
#[derive(Debug, Clone)]
pub enum AgentArtifact {
    /// Bytes read from the configured local binary
    Local(Bytes),
    /// URL the node fetches itself; `{arch}` is replaced with the node's
    /// machine architecture
    Download(String),
}

pub const PROBE_COMMAND: &str = "uname -sm";

pub struct BootstrapPlan {
    pub steps: Vec<BootstrapStep>,
}

impl BootstrapPlan {
    pub fn build(
        settings: &DeployConfig,
        platform: &Platform,
        artifact: AgentArtifact,
        agent: &AgentConfig,
    ) -> Result<Self, PanelError> {
        let dir = settings.remote_dir.trim_end_matches('/').to_string();
        let binary = format!("{}/{}", dir, BINARY_NAME);
        let config_path = format!("{}/agent.toml", dir);

        let agent_toml = toml::to_string_pretty(agent)
            .map_err(|e| PanelError::Invalid(format!("cannot render agent.toml: {}", e)))?;

        let mut steps = vec![BootstrapStep {
            name: "create directories",
            action: StepAction::Exec(format!(
                "mkdir -p {dir} && chmod 700 {dir}",
                dir = shell_quote(&dir)
            )),
        }];

        steps.push(match artifact {
            AgentArtifact::Local(content) => BootstrapStep {
                name: "upload agent binary",
                action: StepAction::Upload {
                    path: binary.clone(),
                    content,
                    mode: 0o755,
                },
            },
            AgentArtifact::Download(url) => {
                let url = shell_quote(&url.replace("{arch}", &platform.arch));
                let target = shell_quote(&binary);
                BootstrapStep {
                    name: "download agent binary",
                    action: StepAction::Exec(format!(
                        "if command -v curl >/dev/null 2>&1; then curl -fsSL -o {target} {url}; \
                         elif command -v wget >/dev/null 2>&1; then wget -qO {target} {url}; \
                         else echo 'neither curl nor wget is installed' >&2; exit 127; fi \
                         && chmod 755 {target}"
                    )),
                }
            }
        });

        steps.push(BootstrapStep {
            name: "write agent configuration",
            action: StepAction::Upload {
                path: config_path.clone(),
                content: Bytes::from(agent_toml),
                mode: 0o600,
            },
        });

        steps.push(BootstrapStep {
            name: "install and start service",
            action: StepAction::Exec(service_script(&dir, &binary, &config_path)),
        });

        Ok(Self { steps })
    }
}

/// systemd unit when systemd is running, otherwise a `nohup` background
/// process
fn service_script(dir: &str, binary: &str, config_path: &str) -> String {
    let unit = format!(
        "[Unit]\n\
         Description=fleet-panel node agent\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={binary} --config {config}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        binary = binary,
        config = config_path,
    );

    format!(
        "if command -v systemctl >/dev/null 2>&1 && [ -d /run/systemd/system ]; then \
         printf '%s' {unit} > /etc/systemd/system/{svc}.service \
         && systemctl daemon-reload \
         && systemctl enable {svc} \
         && systemctl restart {svc}; \
         else \
         pkill -f {pattern} >/dev/null 2>&1; \
         nohup {binary} --config {config} > {log} 2>&1 < /dev/null & \
         sleep 1; pgrep -f {pattern} >/dev/null; \
         fi",
        unit = shell_quote(&unit),
        svc = SERVICE_NAME,
        pattern = shell_quote(&format!("{} --config", binary)),
        binary = shell_quote(binary),
        config = shell_quote(config_path),
        log = shell_quote(&format!("{}/agent.log", dir)),
    )
}

/// Single-quote for POSIX sh
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig {
            panel_address: "panel.example.net:2222".into(),
            agent_id: "agt-1".into(),
            node_id: "n1".into(),
            token: "tok".into(),
            ..Default::default()
        }
    }

    fn linux() -> Platform {
        Platform::parse("Linux x86_64\n").unwrap()
    }

    #[test]
    fn platform_probe() {
        assert_eq!(linux().arch, "x86_64");
        linux().ensure_supported().unwrap();
        assert!(Platform::parse("Darwin arm64")
            .unwrap()
            .ensure_supported()
            .is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn local_artifact_is_uploaded() {
        let plan = BootstrapPlan::build(
            &DeployConfig::default(),
            &linux(),
            AgentArtifact::Local(Bytes::from_static(b"\x7fELF")),
            &agent(),
        )
        .unwrap();

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "create directories",
                "upload agent binary",
                "write agent configuration",
                "install and start service"
            ]
        );
        match &plan.steps[2].action {
            StepAction::Upload { path, content, mode } => {
                assert_eq!(path, "/opt/fleet-agent/agent.toml");
                assert_eq!(*mode, 0o600);
                let text = std::str::from_utf8(content).unwrap();
                assert!(text.contains("agent_id = \"agt-1\""));
                assert!(text.contains("panel.example.net:2222"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn download_substitutes_arch() {
        let plan = BootstrapPlan::build(
            &DeployConfig::default(),
            &linux(),
            AgentArtifact::Download("https://dl.example.net/agent-{arch}".into()),
            &agent(),
        )
        .unwrap();
        match &plan.steps[1].action {
            StepAction::Exec(cmd) => {
                assert!(cmd.contains("https://dl.example.net/agent-x86_64"));
                assert!(cmd.contains("wget"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn service_script_covers_both_managers() {
        let script = service_script("/opt/a", "/opt/a/fleet-agent", "/opt/a/agent.toml");
        assert!(script.contains("systemctl restart fleet-agent"));
        assert!(script.contains("nohup '/opt/a/fleet-agent'"));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
