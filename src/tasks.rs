//! # Benchmark Tasks
//!
//! Shell command sequences run on target instances over SSH: tool install,
//! backend bring-up, and load generator start/stop. Task bodies are plain
//! data so the runner stays generic.

/// A named command sequence executed on every target host
#[derive(Debug, Clone)]
pub enum RemoteTask {
    /// Install the HTTP benchmark client and process tools
    InstallBenchTools { image_family: String },
    /// Install and enable docker
    InstallDocker { image_family: String },
    /// Start the container pool backends serve traffic from
    StartBackendServer { image: String },
    /// Start `fanout` detached `ab` load generators against the VIP
    StartLoad { vip: String, fanout: u32 },
    StopLoad,
}

impl RemoteTask {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteTask::InstallBenchTools { .. } => "install-bench-tools",
            RemoteTask::InstallDocker { .. } => "install-docker",
            RemoteTask::StartBackendServer { .. } => "start-backend-server",
            RemoteTask::StartLoad { .. } => "start-load",
            RemoteTask::StopLoad => "stop-load",
        }
    }

    /// Commands in execution order. Package installs are only defined for
    /// centos image families; other families yield nothing and the task is a
    /// logged no-op for the host.
    pub fn commands(&self) -> Vec<String> {
        match self {
            RemoteTask::InstallBenchTools { image_family } => {
                if image_family.contains("centos") {
                    vec!["sudo yum install -y httpd-tools psmisc".to_string()]
                } else {
                    Vec::new()
                }
            }
            RemoteTask::InstallDocker { image_family } => {
                if image_family.contains("centos") {
                    vec![
                        "sudo yum install -y docker".to_string(),
                        "sudo systemctl start docker".to_string(),
                        "sudo systemctl enable docker".to_string(),
                    ]
                } else {
                    Vec::new()
                }
            }
            RemoteTask::StartBackendServer { image } => {
                vec![format!("sudo docker run -d -p 80:80 {image}")]
            }
            RemoteTask::StartLoad { vip, fanout } => {
                let mut commands = vec!["killall ab || true".to_string()];
                for _ in 0..*fanout {
                    commands.push(format!(
                        "nohup ab -r -c 100 -n 100000000 https://{vip}/ >/dev/null 2>&1 </dev/null &"
                    ));
                }
                commands
            }
            RemoteTask::StopLoad => vec!["killall ab".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_load_fans_out_per_thread() {
        let task = RemoteTask::StartLoad {
            vip: "10.10.0.5".to_string(),
            fanout: 3,
        };
        let commands = task.commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].starts_with("killall"));
        assert!(commands[1].contains("https://10.10.0.5/"));
        assert!(commands[3].starts_with("nohup ab"));
    }

    #[test]
    fn installs_are_noops_off_centos() {
        let task = RemoteTask::InstallBenchTools {
            image_family: "debian-12".to_string(),
        };
        assert!(task.commands().is_empty());

        let task = RemoteTask::InstallDocker {
            image_family: "centos-7".to_string(),
        };
        assert_eq!(task.commands().len(), 3);
    }
}
