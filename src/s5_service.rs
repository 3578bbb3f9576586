//! Boot-time registration of the supervisor with the platform service
//! manager: a systemd user unit, a launchd agent, or a logon task.

use crate::GmemError;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const SERVICE_NAME: &str = "gmem-supervisor";
const LAUNCHD_LABEL: &str = "dev.gmem.supervisor";

/// What the registered service runs.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub exe: PathBuf,
    pub config_path: PathBuf,
    pub gmem_home: PathBuf,
}

impl ServiceSpec {
    pub fn current() -> Result<Self, GmemError> {
        Ok(Self {
            exe: std::env::current_exe()?,
            config_path: crate::s5_config::config_path(),
            gmem_home: crate::gmem_home(),
        })
    }
}

pub trait ServiceManager {
    fn name(&self) -> &'static str;
    /// Where the service definition is written.
    fn definition_path(&self, spec: &ServiceSpec) -> PathBuf;
    fn render(&self, spec: &ServiceSpec) -> String;
    fn install_commands(&self, spec: &ServiceSpec) -> Vec<Vec<String>>;
    fn uninstall_commands(&self, spec: &ServiceSpec) -> Vec<Vec<String>>;
    fn status_command(&self, spec: &ServiceSpec) -> Vec<String>;
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub struct Systemd {
    pub user_home: PathBuf,
}

impl ServiceManager for Systemd {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn definition_path(&self, _spec: &ServiceSpec) -> PathBuf {
        self.user_home
            .join(".config/systemd/user")
            .join(format!("{SERVICE_NAME}.service"))
    }

    fn render(&self, spec: &ServiceSpec) -> String {
        format!(
            "[Unit]\n\
             Description=gmem supervisor\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             ExecStart=\"{exe}\" supervise\n\
             Environment=GMEM_CONFIG={config}\n\
             Environment=GMEM_HOME={home}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n",
            exe = spec.exe.display(),
            config = spec.config_path.display(),
            home = spec.gmem_home.display(),
        )
    }

    fn install_commands(&self, _spec: &ServiceSpec) -> Vec<Vec<String>> {
        let unit = format!("{SERVICE_NAME}.service");
        vec![
            cmd(&["systemctl", "--user", "daemon-reload"]),
            cmd(&["systemctl", "--user", "enable", "--now", unit.as_str()]),
        ]
    }

    fn uninstall_commands(&self, _spec: &ServiceSpec) -> Vec<Vec<String>> {
        let unit = format!("{SERVICE_NAME}.service");
        vec![cmd(&["systemctl", "--user", "disable", "--now", unit.as_str()])]
    }

    fn status_command(&self, _spec: &ServiceSpec) -> Vec<String> {
        cmd(&["systemctl", "--user", "is-active", format!("{SERVICE_NAME}.service").as_str()])
    }
}

pub struct Launchd {
    pub user_home: PathBuf,
}

impl ServiceManager for Launchd {
    fn name(&self) -> &'static str {
        "launchd"
    }

    fn definition_path(&self, _spec: &ServiceSpec) -> PathBuf {
        self.user_home
            .join("Library/LaunchAgents")
            .join(format!("{LAUNCHD_LABEL}.plist"))
    }

    fn render(&self, spec: &ServiceSpec) -> String {
        let log = spec.gmem_home.join("supervisor.log");
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key><string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{exe}</string>
    <string>supervise</string>
  </array>
  <key>EnvironmentVariables</key>
  <dict>
    <key>GMEM_CONFIG</key><string>{config}</string>
    <key>GMEM_HOME</key><string>{home}</string>
  </dict>
  <key>RunAtLoad</key><true/>
  <key>KeepAlive</key><true/>
  <key>StandardOutPath</key><string>{log}</string>
  <key>StandardErrorPath</key><string>{log}</string>
</dict>
</plist>
"#,
            label = LAUNCHD_LABEL,
            exe = xml_escape(&spec.exe.display().to_string()),
            config = xml_escape(&spec.config_path.display().to_string()),
            home = xml_escape(&spec.gmem_home.display().to_string()),
            log = xml_escape(&log.display().to_string()),
        )
    }

    fn install_commands(&self, spec: &ServiceSpec) -> Vec<Vec<String>> {
        let plist = self.definition_path(spec).display().to_string();
        vec![cmd(&["launchctl", "load", "-w", plist.as_str()])]
    }

    fn uninstall_commands(&self, spec: &ServiceSpec) -> Vec<Vec<String>> {
        let plist = self.definition_path(spec).display().to_string();
        vec![cmd(&["launchctl", "unload", "-w", plist.as_str()])]
    }

    fn status_command(&self, _spec: &ServiceSpec) -> Vec<String> {
        cmd(&["launchctl", "list", LAUNCHD_LABEL])
    }
}

/// Scheduled task triggered at logon.
pub struct WindowsTask;

impl ServiceManager for WindowsTask {
    fn name(&self) -> &'static str {
        "task-scheduler"
    }

    fn definition_path(&self, spec: &ServiceSpec) -> PathBuf {
        spec.gmem_home.join(format!("{SERVICE_NAME}.xml"))
    }

    fn render(&self, spec: &ServiceSpec) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo><Description>gmem supervisor</Description></RegistrationInfo>
  <Triggers><LogonTrigger><Enabled>true</Enabled></LogonTrigger></Triggers>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <ExecutionTimeLimit>PT0S</ExecutionTimeLimit>
    <RestartOnFailure><Interval>PT1M</Interval><Count>3</Count></RestartOnFailure>
  </Settings>
  <Actions>
    <Exec>
      <Command>{exe}</Command>
      <Arguments>supervise</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
            exe = xml_escape(&spec.exe.display().to_string()),
        )
    }

    fn install_commands(&self, spec: &ServiceSpec) -> Vec<Vec<String>> {
        let xml = self.definition_path(spec).display().to_string();
        vec![cmd(&["schtasks", "/Create", "/TN", SERVICE_NAME, "/XML", xml.as_str(), "/F"])]
    }

    fn uninstall_commands(&self, _spec: &ServiceSpec) -> Vec<Vec<String>> {
        vec![cmd(&["schtasks", "/Delete", "/TN", SERVICE_NAME, "/F"])]
    }

    fn status_command(&self, _spec: &ServiceSpec) -> Vec<String> {
        cmd(&["schtasks", "/Query", "/TN", SERVICE_NAME])
    }
}

fn user_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

pub fn platform_manager() -> Box<dyn ServiceManager> {
    if cfg!(target_os = "macos") {
        Box::new(Launchd { user_home: user_home() })
    } else if cfg!(windows) {
        Box::new(WindowsTask)
    } else {
        Box::new(Systemd { user_home: user_home() })
    }
}

fn run(argv: &[String]) -> Result<String, GmemError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GmemError::Config("empty service command".into()))?;
    log::debug!("running {}", argv.join(" "));
    let out = Command::new(program).args(args).output()?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    if !out.status.success() {
        return Err(GmemError::Config(format!(
            "`{}` failed ({}): {}",
            argv.join(" "),
            out.status,
            text.trim()
        )));
    }
    Ok(text)
}

fn write_definition(path: &Path, content: &str) -> Result<(), GmemError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

pub fn install(manager: &dyn ServiceManager, spec: &ServiceSpec) -> Result<PathBuf, GmemError> {
    let path = manager.definition_path(spec);
    write_definition(&path, &manager.render(spec))?;
    log::info!("wrote {} service definition to {}", manager.name(), path.display());
    for argv in manager.install_commands(spec) {
        run(&argv)?;
    }
    Ok(path)
}

pub fn uninstall(manager: &dyn ServiceManager, spec: &ServiceSpec) -> Result<(), GmemError> {
    for argv in manager.uninstall_commands(spec) {
        if let Err(e) = run(&argv) {
            log::warn!("{e}");
        }
    }
    let path = manager.definition_path(spec);
    match std::fs::remove_file(&path) {
        Ok(()) => log::info!("removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Registration status as the platform manager reports it.
pub fn query(manager: &dyn ServiceManager, spec: &ServiceSpec) -> (bool, String) {
    let installed = manager.definition_path(spec).exists();
    let detail = match run(&manager.status_command(spec)) {
        Ok(out) => out.trim().to_string(),
        Err(e) => e.to_string(),
    };
    (installed, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            exe: PathBuf::from("/opt/gmem/bin/gmem"),
            config_path: PathBuf::from("/home/dev/.gmem/config.json"),
            gmem_home: PathBuf::from("/home/dev/.gmem"),
        }
    }

    #[test]
    fn systemd_unit_runs_supervise() {
        let m = Systemd { user_home: PathBuf::from("/home/dev") };
        let unit = m.render(&spec());
        assert!(unit.contains("ExecStart=\"/opt/gmem/bin/gmem\" supervise"));
        assert!(unit.contains("Environment=GMEM_CONFIG=/home/dev/.gmem/config.json"));
        assert!(unit.contains("WantedBy=default.target"));
        assert_eq!(
            m.definition_path(&spec()),
            PathBuf::from("/home/dev/.config/systemd/user/gmem-supervisor.service")
        );
        assert_eq!(m.install_commands(&spec())[1].last().unwrap(), "gmem-supervisor.service");
    }

    #[test]
    fn launchd_plist_escapes_paths() {
        let m = Launchd { user_home: PathBuf::from("/Users/dev") };
        let mut s = spec();
        s.exe = PathBuf::from("/Apps/R&D/gmem");
        let plist = m.render(&s);
        assert!(plist.contains("<string>/Apps/R&amp;D/gmem</string>"));
        assert!(plist.contains("<key>RunAtLoad</key><true/>"));
        assert!(plist.contains(LAUNCHD_LABEL));
        let load = &m.install_commands(&s)[0];
        assert_eq!(load[..3], ["launchctl", "load", "-w"]);
    }

    #[test]
    fn windows_task_uses_logon_trigger() {
        let xml = WindowsTask.render(&spec());
        assert!(xml.contains("<LogonTrigger>"));
        assert!(xml.contains("<Arguments>supervise</Arguments>"));
        let create = &WindowsTask.install_commands(&spec())[0];
        assert!(create.contains(&"/XML".to_string()));
        assert_eq!(WindowsTask.uninstall_commands(&spec())[0][1], "/Delete");
    }

    #[test]
    fn definition_written_before_commands() {
        struct Fake(PathBuf);
        impl ServiceManager for Fake {
            fn name(&self) -> &'static str {
                "fake"
            }
            fn definition_path(&self, _spec: &ServiceSpec) -> PathBuf {
                self.0.join("nested/unit")
            }
            fn render(&self, _spec: &ServiceSpec) -> String {
                "unit".into()
            }
            fn install_commands(&self, _spec: &ServiceSpec) -> Vec<Vec<String>> {
                Vec::new()
            }
            fn uninstall_commands(&self, _spec: &ServiceSpec) -> Vec<Vec<String>> {
                Vec::new()
            }
            fn status_command(&self, _spec: &ServiceSpec) -> Vec<String> {
                Vec::new()
            }
        }
        let dir = tempfile::TempDir::new().unwrap();
        let fake = Fake(dir.path().to_path_buf());
        let path = install(&fake, &spec()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "unit");
        let (installed, detail) = query(&fake, &spec());
        assert!(installed);
        assert!(detail.contains("empty service command"));
        uninstall(&fake, &spec()).unwrap();
        assert!(!path.exists());
    }
}
