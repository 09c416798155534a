use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::process::Command;

/// Everything the game needs to connect to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartDescriptor {
    pub car_id: String,
    pub skin_id: Option<String>,
    pub track_id: Option<String>,
    pub server: SocketAddr,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub driver_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Completed,
    Cancelled,
    Failed { message: String },
}

/// Starts the game process.
pub trait Launcher: Send + Sync {
    fn start(&self, descriptor: StartDescriptor) -> BoxFuture<'_, LaunchOutcome>;
}

/// Runs the configured game executable and waits for it to exit.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

/// Password goes through the environment, not the command line.
pub const PASSWORD_ENV: &str = "SERVER_PASSWORD";

impl CommandLauncher {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn command(&self, descriptor: &StartDescriptor) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--join")
            .arg(descriptor.server.to_string())
            .arg("--car")
            .arg(&descriptor.car_id)
            .arg("--name")
            .arg(&descriptor.driver_name)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(skin) = &descriptor.skin_id {
            cmd.arg("--skin").arg(skin);
        }
        if let Some(track) = &descriptor.track_id {
            cmd.arg("--track").arg(track);
        }
        if let Some(password) = &descriptor.password {
            cmd.env(PASSWORD_ENV, password);
        }
        cmd
    }
}

impl Launcher for CommandLauncher {
    fn start(&self, descriptor: StartDescriptor) -> BoxFuture<'_, LaunchOutcome> {
        Box::pin(async move {
            tracing::info!(
                "Launching {} for {} with {}",
                self.program.display(),
                descriptor.server,
                descriptor.car_id
            );
            let status = match self.command(&descriptor).status().await {
                Ok(status) => status,
                Err(e) => {
                    return LaunchOutcome::Failed {
                        message: format!("Failed to start {}: {}", self.program.display(), e),
                    }
                }
            };

            match status.code() {
                Some(0) => LaunchOutcome::Completed,
                // Killed by a signal: the user closed the game window
                None => LaunchOutcome::Cancelled,
                Some(code) => LaunchOutcome::Failed {
                    message: format!("Game exited with code {}", code),
                },
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn descriptor() -> StartDescriptor {
        StartDescriptor {
            car_id: "ks_toyota_gt86".to_string(),
            skin_id: None,
            track_id: Some("drift".to_string()),
            server: "10.0.0.1:9600".parse().unwrap(),
            password: Some("secret".to_string()),
            driver_name: "Tester".to_string(),
        }
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_outcomes() {
        let ok = CommandLauncher::new(PathBuf::from("true"), Vec::new());
        assert_eq!(ok.start(descriptor()).await, LaunchOutcome::Completed);

        let failing = CommandLauncher::new(PathBuf::from("false"), Vec::new());
        assert!(matches!(failing.start(descriptor()).await, LaunchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let launcher = CommandLauncher::new(PathBuf::from("/nonexistent/acs"), Vec::new());
        assert!(matches!(launcher.start(descriptor()).await, LaunchOutcome::Failed { .. }));
    }

    #[test]
    fn test_password_is_never_serialized() {
        let json = serde_json::to_string(&descriptor()).unwrap();
        assert!(!json.contains("secret"));
    }
}
