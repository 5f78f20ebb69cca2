//! Built-in templates and profile group definitions.
//!
//! Pure data. Template text can be overridden per id from the configured
//! template directory; group definitions cannot.

use crate::profile::Profile;
use crate::subsystem::Subsystem;
use crate::template::Variables;

/// One file a group deploys
#[derive(Debug, Clone, Copy)]
pub struct ItemDef {
    pub template_id: &'static str,
    pub target: &'static str,
    pub required: &'static [&'static str],
    pub mode: u32,
    pub user: &'static str,
    pub group: &'static str,
}

/// Items applied and validated together
#[derive(Debug, Clone, Copy)]
pub struct GroupDef {
    pub id: &'static str,
    /// Lowest profile that includes the group
    pub level: Profile,
    pub subsystem: Subsystem,
    pub items: &'static [ItemDef],
}

const fn root_file(
    template_id: &'static str,
    target: &'static str,
    required: &'static [&'static str],
    mode: u32,
) -> ItemDef {
    ItemDef {
        template_id,
        target,
        required,
        mode,
        user: "root",
        group: "root",
    }
}

/// Every group in install order. Within a profile level the order is fixed;
/// across levels all lower-level groups come first.
pub static GROUPS: &[GroupDef] = &[
    // minimal
    GroupDef {
        id: "kernel-base",
        level: Profile::Minimal,
        subsystem: Subsystem::Kernel,
        items: &[root_file("sysctl-base", "/etc/sysctl.d/60-harden-base.conf", &[], 0o644)],
    },
    GroupDef {
        id: "ssh-daemon",
        level: Profile::Minimal,
        subsystem: Subsystem::RemoteAccess,
        items: &[root_file(
            "sshd-config",
            "/etc/ssh/sshd_config",
            &[
                "SSH_PORT",
                "SSH_PERMIT_ROOT_LOGIN",
                "SSH_PASSWORD_AUTH",
                "SSH_MAX_AUTH_TRIES",
                "SSH_LOGIN_GRACE_TIME",
                "SSH_ALLOW_TCP_FORWARDING",
                "SSH_CLIENT_ALIVE_INTERVAL",
            ],
            0o600,
        )],
    },
    // standard
    GroupDef {
        id: "kernel-network",
        level: Profile::Standard,
        subsystem: Subsystem::Kernel,
        items: &[root_file(
            "sysctl-network",
            "/etc/sysctl.d/61-harden-network.conf",
            &[],
            0o644,
        )],
    },
    GroupDef {
        id: "login-banner",
        level: Profile::Standard,
        subsystem: Subsystem::Banner,
        items: &[
            root_file("login-banner", "/etc/issue.net", &["BANNER_ORGANIZATION"], 0o644),
            root_file("login-banner", "/etc/issue", &["BANNER_ORGANIZATION"], 0o644),
        ],
    },
    GroupDef {
        id: "intrusion-prevention",
        level: Profile::Standard,
        subsystem: Subsystem::IntrusionPrevention,
        items: &[root_file(
            "fail2ban-jail",
            "/etc/fail2ban/jail.d/harden.local",
            &["SSH_PORT", "F2B_BANTIME", "F2B_FINDTIME", "F2B_MAXRETRY"],
            0o644,
        )],
    },
    // hardened
    GroupDef {
        id: "kernel-strict",
        level: Profile::Hardened,
        subsystem: Subsystem::Kernel,
        items: &[root_file("sysctl-strict", "/etc/sysctl.d/62-harden-strict.conf", &[], 0o644)],
    },
    GroupDef {
        id: "mac-profiles",
        level: Profile::Hardened,
        subsystem: Subsystem::AccessControl,
        items: &[root_file("apparmor-web", "/etc/apparmor.d/harden.nginx", &[], 0o644)],
    },
    GroupDef {
        id: "container-runtime",
        level: Profile::Hardened,
        subsystem: Subsystem::Container,
        items: &[root_file(
            "docker-daemon",
            "/etc/docker/daemon.json",
            &["DOCKER_LOG_MAX_SIZE", "DOCKER_LOG_MAX_FILE"],
            0o644,
        )],
    },
    GroupDef {
        id: "web-server",
        level: Profile::Hardened,
        subsystem: Subsystem::WebServer,
        items: &[root_file(
            "nginx-hardening",
            "/etc/nginx/conf.d/harden.conf",
            &["NGINX_CLIENT_MAX_BODY"],
            0o644,
        )],
    },
];

/// Variable defaults for a profile. Operator variables override these.
pub fn default_variables(profile: Profile) -> Variables {
    let by_level = |minimal: &str, standard: &str, hardened: &str| match profile {
        Profile::Minimal => minimal.to_string(),
        Profile::Standard => standard.to_string(),
        Profile::Hardened => hardened.to_string(),
    };

    let mut vars = Variables::new();
    vars.insert(
        "SSH_PERMIT_ROOT_LOGIN".into(),
        by_level("prohibit-password", "no", "no"),
    );
    vars.insert("SSH_PASSWORD_AUTH".into(), by_level("yes", "no", "no"));
    vars.insert("SSH_MAX_AUTH_TRIES".into(), by_level("6", "4", "3"));
    vars.insert("SSH_LOGIN_GRACE_TIME".into(), by_level("60", "30", "20"));
    vars.insert("SSH_ALLOW_TCP_FORWARDING".into(), by_level("yes", "no", "no"));
    vars.insert("SSH_CLIENT_ALIVE_INTERVAL".into(), by_level("300", "300", "120"));
    vars.insert("BANNER_ORGANIZATION".into(), "the system owner".into());
    vars.insert("F2B_BANTIME".into(), by_level("10m", "1h", "24h"));
    vars.insert("F2B_FINDTIME".into(), "10m".into());
    vars.insert("F2B_MAXRETRY".into(), by_level("5", "5", "3"));
    vars.insert("DOCKER_LOG_MAX_SIZE".into(), "10m".into());
    vars.insert("DOCKER_LOG_MAX_FILE".into(), "3".into());
    vars.insert("NGINX_CLIENT_MAX_BODY".into(), "10m".into());
    vars
}

pub fn builtin_template(id: &str) -> Option<&'static str> {
    match id {
        "sysctl-base" => Some(SYSCTL_BASE),
        "sysctl-network" => Some(SYSCTL_NETWORK),
        "sysctl-strict" => Some(SYSCTL_STRICT),
        "sshd-config" => Some(SSHD_CONFIG),
        "login-banner" => Some(LOGIN_BANNER),
        "fail2ban-jail" => Some(FAIL2BAN_JAIL),
        "apparmor-web" => Some(APPARMOR_WEB),
        "docker-daemon" => Some(DOCKER_DAEMON),
        "nginx-hardening" => Some(NGINX_HARDENING),
        _ => None,
    }
}

const SYSCTL_BASE: &str = "\
# Managed by harden. Local changes are overwritten.
kernel.kptr_restrict = 2
kernel.dmesg_restrict = 1
kernel.randomize_va_space = 2
fs.protected_hardlinks = 1
fs.protected_symlinks = 1
fs.suid_dumpable = 0
";

const SYSCTL_NETWORK: &str = "\
# Managed by harden. Local changes are overwritten.
net.ipv4.tcp_syncookies = 1
net.ipv4.conf.all.rp_filter = 1
net.ipv4.conf.default.rp_filter = 1
net.ipv4.conf.all.accept_redirects = 0
net.ipv4.conf.default.accept_redirects = 0
net.ipv4.conf.all.send_redirects = 0
net.ipv4.conf.all.accept_source_route = 0
net.ipv4.icmp_echo_ignore_broadcasts = 1
net.ipv4.conf.all.log_martians = 1
-net.ipv6.conf.all.accept_redirects = 0
-net.ipv6.conf.default.accept_redirects = 0
";

const SYSCTL_STRICT: &str = "\
# Managed by harden. Local changes are overwritten.
kernel.yama.ptrace_scope = 2
kernel.kexec_load_disabled = 1
kernel.unprivileged_bpf_disabled = 1
net.core.bpf_jit_harden = 2
-kernel.unprivileged_userns_clone = 0
";

const SSHD_CONFIG: &str = "\
# Managed by harden. Local changes are overwritten.
Include /etc/ssh/sshd_config.d/*.conf

Port ${SSH_PORT}
Protocol 2
PermitRootLogin ${SSH_PERMIT_ROOT_LOGIN}
PasswordAuthentication ${SSH_PASSWORD_AUTH}
PermitEmptyPasswords no
KbdInteractiveAuthentication no
PubkeyAuthentication yes
UsePAM yes

MaxAuthTries ${SSH_MAX_AUTH_TRIES}
LoginGraceTime ${SSH_LOGIN_GRACE_TIME}
MaxSessions 4
ClientAliveInterval ${SSH_CLIENT_ALIVE_INTERVAL}
ClientAliveCountMax 2

AllowTcpForwarding ${SSH_ALLOW_TCP_FORWARDING}
X11Forwarding no
AllowAgentForwarding no
PermitUserEnvironment no

Banner /etc/issue.net
PrintMotd no
AcceptEnv LANG LC_*
Subsystem sftp /usr/lib/openssh/sftp-server
";

const LOGIN_BANNER: &str = "\
Authorized access only. This system is the property of ${BANNER_ORGANIZATION}.
All activity may be monitored and reported.
";

const FAIL2BAN_JAIL: &str = "\
# Managed by harden. Local changes are overwritten.
[DEFAULT]
bantime = ${F2B_BANTIME}
findtime = ${F2B_FINDTIME}
maxretry = ${F2B_MAXRETRY}
backend = systemd

[sshd]
enabled = true
port = ${SSH_PORT}
";

const APPARMOR_WEB: &str = "\
# Managed by harden. Local changes are overwritten.
abi <abi/3.0>,
include <tunables/global>

profile harden-nginx /usr/sbin/nginx flags=(complain) {
  include <abstractions/base>
  include <abstractions/nameservice>

  capability dac_override,
  capability net_bind_service,
  capability setgid,
  capability setuid,

  /etc/nginx/** r,
  /etc/ssl/** r,
  /usr/share/nginx/** r,
  /var/www/** r,
  /var/log/nginx/** w,
  /run/nginx.pid rw,
}
";

const DOCKER_DAEMON: &str = r#"{
  "icc": false,
  "live-restore": true,
  "no-new-privileges": true,
  "userland-proxy": false,
  "log-driver": "json-file",
  "log-opts": {
    "max-size": "${DOCKER_LOG_MAX_SIZE}",
    "max-file": "${DOCKER_LOG_MAX_FILE}"
  }
}
"#;

const NGINX_HARDENING: &str = "\
# Managed by harden. Local changes are overwritten.
server_tokens off;
client_max_body_size ${NGINX_CLIENT_MAX_BODY};
client_body_timeout 10s;
client_header_timeout 10s;
keepalive_timeout 15s;
send_timeout 10s;

add_header X-Frame-Options SAMEORIGIN always;
add_header X-Content-Type-Options nosniff always;
add_header Referrer-Policy strict-origin-when-cross-origin always;

ssl_protocols TLSv1.2 TLSv1.3;
ssl_prefer_server_ciphers on;
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{referenced_variables, render_text};

    #[test]
    fn test_every_item_has_a_template() {
        for group in GROUPS {
            for item in group.items {
                assert!(
                    builtin_template(item.template_id).is_some(),
                    "{} has no template",
                    item.template_id
                );
                assert!(item.target.starts_with('/'));
            }
        }
    }

    #[test]
    fn test_declared_variables_cover_placeholders() {
        for group in GROUPS {
            for item in group.items {
                let text = builtin_template(item.template_id).unwrap();
                for name in referenced_variables(text) {
                    assert!(
                        item.required.contains(&name.as_str()),
                        "{} references undeclared {}",
                        item.template_id,
                        name
                    );
                }
            }
        }
    }

    #[test]
    fn test_defaults_plus_port_render_everything() {
        for profile in Profile::ALL {
            let mut vars = default_variables(profile);
            vars.insert("SSH_PORT".into(), "22".into());
            for group in GROUPS {
                for item in group.items {
                    let required: Vec<String> = item.required.iter().map(|s| s.to_string()).collect();
                    let text = builtin_template(item.template_id).unwrap();
                    assert!(render_text(item.template_id, text, &required, &vars).is_ok());
                }
            }
        }
    }

    #[test]
    fn test_groups_are_ordered_by_level() {
        let levels: Vec<Profile> = GROUPS.iter().map(|g| g.level).collect();
        let mut sorted = levels.clone();
        sorted.sort();
        assert_eq!(levels, sorted);
    }

    #[test]
    fn test_stricter_profiles_tighten_ssh() {
        let tries = |p| default_variables(p)["SSH_MAX_AUTH_TRIES"].clone();
        assert_eq!(tries(Profile::Minimal), "6");
        assert_eq!(tries(Profile::Standard), "4");
        assert_eq!(tries(Profile::Hardened), "3");
    }
}
