use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{ProbeArgs, ServeArgs};
use crate::error::ConfigError;
use crate::probe::PollPolicy;
use crate::server::pty::{default_shell, home_dir, SpawnConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub template: SpawnConfig,
    pub static_site: Option<StaticSite>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSite {
    pub dir: PathBuf,
    pub addr: SocketAddr,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr = parse_addr(&args.listen_addr)?;
        if args.cols == 0 || args.rows == 0 {
            return Err(ConfigError::InvalidSize {
                cols: args.cols,
                rows: args.rows,
            });
        }

        let mut template = SpawnConfig::new(args.shell.unwrap_or_else(default_shell))
            .args(args.shell_args)
            .size(args.cols, args.rows);
        for entry in &args.env {
            let (key, value) = parse_env_entry(entry)?;
            template = template.env(key, value);
        }
        if !args.clear_env {
            template = template.with_host_env();
        }
        template.cwd = args.cwd.or_else(home_dir);

        let static_site = match args.static_dir {
            Some(dir) => Some(StaticSite {
                dir,
                addr: parse_addr(&args.static_addr)?,
            }),
            None => None,
        };

        Ok(ServerConfig {
            listen_addr,
            template,
            static_site,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub policy: PollPolicy,
    pub timeout: Duration,
}

impl TryFrom<ProbeArgs> for ProbeConfig {
    type Error = ConfigError;

    fn try_from(args: ProbeArgs) -> Result<Self, Self::Error> {
        if args.interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(ProbeConfig {
            url: args.url,
            policy: PollPolicy {
                interval: Duration::from_secs(args.interval_secs),
                window: Duration::from_secs(args.window_secs),
                stop_when_connected: true,
            },
            timeout: Duration::from_millis(args.timeout_ms),
        })
    }
}

fn parse_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidAddr(raw.to_string()))
}

fn parse_env_entry(entry: &str) -> Result<(&str, &str), ConfigError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ConfigError::InvalidEnv(entry.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["beach-pier"];
        argv.extend_from_slice(extra);
        crate::cli::Cli::try_parse_from(argv).expect("parse").serve
    }

    #[test]
    fn explicit_env_wins_over_host_env() {
        let config = ServerConfig::try_from(serve_args(&["--env", "PATH=/opt/bin"])).unwrap();
        assert_eq!(
            config.template.env.get("PATH").map(String::as_str),
            Some("/opt/bin")
        );
    }

    #[test]
    fn clear_env_keeps_only_overrides() {
        let config = ServerConfig::try_from(serve_args(&[
            "--clear-env",
            "--env",
            "PS1=$ ",
            "--env",
            "EMPTY=",
        ]))
        .unwrap();
        assert_eq!(config.template.env.len(), 2);
        assert_eq!(config.template.env["PS1"], "$ ");
        assert_eq!(config.template.env["EMPTY"], "");
    }

    #[test]
    fn malformed_env_entry_is_rejected() {
        let err = ServerConfig::try_from(serve_args(&["--env", "NOEQUALS"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(entry) if entry == "NOEQUALS"));
        let err = ServerConfig::try_from(serve_args(&["--env", "=value"])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(_)));
    }

    #[test]
    fn bad_listen_addr_and_zero_size_are_rejected() {
        assert!(matches!(
            ServerConfig::try_from(serve_args(&["--listen-addr", "localhost"])),
            Err(ConfigError::InvalidAddr(_))
        ));
        assert!(matches!(
            ServerConfig::try_from(serve_args(&["--cols", "0"])),
            Err(ConfigError::InvalidSize { cols: 0, rows: 30 })
        ));
    }

    #[test]
    fn static_site_only_when_dir_given() {
        let config = ServerConfig::try_from(serve_args(&[])).unwrap();
        assert!(config.static_site.is_none());

        let config = ServerConfig::try_from(serve_args(&["--static-dir", "labs"])).unwrap();
        let site = config.static_site.expect("static site");
        assert_eq!(site.dir, PathBuf::from("labs"));
        assert_eq!(site.addr, "127.0.0.1:8000".parse().unwrap());
    }

    #[test]
    fn probe_config_rejects_zero_interval() {
        let args = ProbeArgs {
            url: "http://127.0.0.1:7681/health".into(),
            interval_secs: 0,
            window_secs: 60,
            timeout_ms: 2000,
        };
        assert!(matches!(
            ProbeConfig::try_from(args),
            Err(ConfigError::ZeroInterval)
        ));
    }
}
