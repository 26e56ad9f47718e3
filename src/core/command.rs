/// Shell command templates
///
/// User-configurable commands (such as the compose invocation) are templates
/// with `{{docker_compose}}`, `{{service}}` and `{{container}}` placeholders.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::utils::app_config::CommandTemplates;
use crate::utils::{TEMPLATE_CONTAINER, TEMPLATE_DOCKER_COMPOSE, TEMPLATE_SERVICE};

/// Values available to a template. Unset fields render as empty strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandObject {
    pub docker_compose: Option<String>,
    pub service: Option<String>,
    pub container: Option<String>,
}

impl CommandObject {
    /// Default object (compose command from the templates) with every field
    /// set in `obj` taking precedence
    pub fn merged_with_defaults(templates: &CommandTemplates, obj: CommandObject) -> CommandObject {
        CommandObject {
            docker_compose: obj
                .docker_compose
                .or_else(|| Some(templates.docker_compose.clone())),
            service: obj.service,
            container: obj.container,
        }
    }
}

pub fn apply_template(template: &str, obj: &CommandObject) -> String {
    template
        .replace(TEMPLATE_DOCKER_COMPOSE, obj.docker_compose.as_deref().unwrap_or(""))
        .replace(TEMPLATE_SERVICE, obj.service.as_deref().unwrap_or(""))
        .replace(TEMPLATE_CONTAINER, obj.container.as_deref().unwrap_or(""))
}

/// Run a command line through the shell and return its stdout.
/// A non-zero exit becomes an error carrying stderr.
pub async fn run_command_with_output(command: &str, dir: Option<&Path>) -> Result<String> {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };

    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to execute `{}`", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("`{}` failed: {}", command, stderr.trim()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
