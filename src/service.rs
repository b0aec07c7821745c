//! systemd collaborator. Thin wrappers over `systemctl`; exit codes are reported,
//! not interpreted, except where systemctl gives them a meaning.

use log::warn;
use serde::Serialize;

use crate::shell::{self, Capture};

/// `systemctl status` uses exit code 4 for "no such unit".
const SYSTEMCTL_NO_SUCH_UNIT: i32 = 4;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub exists: bool,
    pub active: bool,
    pub enabled: bool,
}

pub trait ServiceControl: Send + Sync {
    /// Run `systemctl <verb> <name>` (or equivalent) and return the exit code.
    fn command(&self, verb: &str, name: &str) -> i32;

    /// Query a single-word state such as `is-active` -> `active`.
    fn query(&self, verb: &str, name: &str) -> Option<String>;

    /// Re-read unit files after one was installed or replaced.
    fn daemon_reload(&self) -> i32;

    fn restart(&self, name: &str) -> i32 {
        self.command("restart", name)
    }

    fn start(&self, name: &str) -> i32 {
        self.command("start", name)
    }

    fn stop(&self, name: &str) -> i32 {
        self.command("stop", name)
    }

    fn enable(&self, name: &str) -> i32 {
        self.command("enable", name)
    }

    fn disable(&self, name: &str) -> i32 {
        self.command("disable", name)
    }

    fn exists(&self, name: &str) -> bool {
        self.command("status", name) != SYSTEMCTL_NO_SUCH_UNIT
    }

    fn status(&self, name: &str) -> ServiceStatus {
        ServiceStatus {
            exists: self.exists(name),
            active: self.query("is-active", name).as_deref() == Some("active"),
            enabled: self.query("is-enabled", name).as_deref() == Some("enabled"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Systemctl;

impl ServiceControl for Systemctl {
    fn command(&self, verb: &str, name: &str) -> i32 {
        match shell::run("systemctl", &[verb, name], Capture::None) {
            Ok((code, _)) => code,
            Err(e) => {
                warn!("systemctl {verb} {name}: {e:#}");
                -1
            }
        }
    }

    fn query(&self, verb: &str, name: &str) -> Option<String> {
        shell::run("systemctl", &[verb, name], Capture::Stdout)
            .ok()
            .map(|(_, out)| out.trim().to_string())
    }

    fn daemon_reload(&self) -> i32 {
        match shell::run("systemctl", &["daemon-reload"], Capture::None) {
            Ok((code, _)) => code,
            Err(e) => {
                warn!("systemctl daemon-reload: {e:#}");
                -1
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeServices;
    use super::*;

    #[test]
    fn status_combines_queries() {
        let svc = FakeServices::default();
        let st = svc.status("tunup");
        assert_eq!(
            st,
            ServiceStatus {
                exists: true,
                active: true,
                enabled: false
            }
        );
    }

    #[test]
    fn exit_code_four_means_missing_unit() {
        let svc = FakeServices {
            code: SYSTEMCTL_NO_SUCH_UNIT,
            ..Default::default()
        };
        assert!(!svc.exists("nope"));
    }
}
