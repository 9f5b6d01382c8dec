//! CLI surface and validated runtime configuration.

use clap::Parser;

use crate::error::BroadcasterError;

pub const MAX_SAFEKEEPERS: usize = 32;

#[derive(Debug, Parser)]
#[command(name = "wal_broadcaster", version, about = "WAL quorum broadcaster")]
pub struct Args {
    /// Comma-separated safekeeper addresses, host:port each.
    #[arg(short = 's', long = "safekeepers", value_delimiter = ',')]
    pub safekeepers: Vec<String>,

    /// Required acknowledgements before a write is considered durable.
    /// Defaults to floor(N/2)+1.
    #[arg(short = 'q', long = "quorum")]
    pub quorum: Option<usize>,

    /// Connection string / dbname for the primary.
    #[arg(short = 'd', long = "dbname", default_value = "postgres")]
    pub dbname: String,

    #[arg(short = 'h', long = "host", default_value = "localhost")]
    pub host: String,

    #[arg(short = 'p', long = "port", default_value_t = 5432)]
    pub port: u16,

    #[arg(short = 'U', long = "username", default_value = "postgres")]
    pub username: String,

    /// Force a password prompt (ignored; trust/cleartext auth only).
    #[arg(short = 'W', long = "force-password", default_value_t = false)]
    pub force_password: bool,

    /// Never prompt for a password (ignored; trust/cleartext auth only).
    #[arg(short = 'w', long = "no-password", default_value_t = false)]
    pub no_password: bool,

    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// One configured safekeeper endpoint.
#[derive(Debug, Clone)]
pub struct SafekeeperAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for SafekeeperAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn parse_safekeeper(raw: &str) -> Result<SafekeeperAddr, BroadcasterError> {
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
        BroadcasterError::Config(format!("safekeeper address {raw:?} is missing a port"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        BroadcasterError::Config(format!("safekeeper address {raw:?} has an invalid port"))
    })?;
    if host.is_empty() {
        return Err(BroadcasterError::Config(format!(
            "safekeeper address {raw:?} is missing a host"
        )));
    }
    Ok(SafekeeperAddr {
        host: host.to_string(),
        port,
    })
}

/// Immutable, validated configuration the broadcaster runs with.
#[derive(Debug, Clone)]
pub struct BroadcasterConf {
    pub safekeepers: Vec<SafekeeperAddr>,
    pub quorum: usize,
    pub primary_dbname: String,
    pub primary_host: String,
    pub primary_port: u16,
    pub primary_username: String,
    pub verbose: u8,
}

impl BroadcasterConf {
    pub fn from_args(args: Args) -> Result<Self, BroadcasterError> {
        if args.safekeepers.is_empty() {
            return Err(BroadcasterError::Config(
                "at least one safekeeper must be configured with --safekeepers".to_string(),
            ));
        }
        if args.safekeepers.len() > MAX_SAFEKEEPERS {
            return Err(BroadcasterError::Config(format!(
                "at most {MAX_SAFEKEEPERS} safekeepers are supported, got {}",
                args.safekeepers.len()
            )));
        }

        let safekeepers = args
            .safekeepers
            .iter()
            .map(|s| parse_safekeeper(s))
            .collect::<Result<Vec<_>, _>>()?;

        let n = safekeepers.len();
        let default_quorum = n / 2 + 1;
        let quorum = args.quorum.unwrap_or(default_quorum);
        if quorum < default_quorum || quorum > n {
            return Err(BroadcasterError::Config(format!(
                "quorum {quorum} out of range [{default_quorum}, {n}]"
            )));
        }

        Ok(BroadcasterConf {
            safekeepers,
            quorum,
            primary_dbname: args.dbname,
            primary_host: args.host,
            primary_port: args.port,
            primary_username: args.username,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(safekeepers: &[&str], quorum: Option<usize>) -> Args {
        Args {
            safekeepers: safekeepers.iter().map(|s| s.to_string()).collect(),
            quorum,
            dbname: "postgres".into(),
            host: "localhost".into(),
            port: 5432,
            username: "postgres".into(),
            force_password: false,
            no_password: false,
            verbose: 0,
        }
    }

    #[test]
    fn default_quorum_is_majority() {
        let conf = BroadcasterConf::from_args(args(&["a:1", "b:2", "c:3"], None)).unwrap();
        assert_eq!(conf.quorum, 2);
    }

    #[test]
    fn explicit_quorum_within_bounds_is_accepted() {
        let conf = BroadcasterConf::from_args(args(&["a:1", "b:2", "c:3"], Some(3))).unwrap();
        assert_eq!(conf.quorum, 3);
    }

    #[test]
    fn quorum_below_majority_is_rejected() {
        assert!(BroadcasterConf::from_args(args(&["a:1", "b:2", "c:3"], Some(1))).is_err());
    }

    #[test]
    fn quorum_above_n_is_rejected() {
        assert!(BroadcasterConf::from_args(args(&["a:1", "b:2", "c:3"], Some(4))).is_err());
    }

    #[test]
    fn empty_safekeeper_list_is_rejected() {
        assert!(BroadcasterConf::from_args(args(&[], None)).is_err());
    }

    #[test]
    fn malformed_address_is_rejected() {
        assert!(BroadcasterConf::from_args(args(&["no-port-here"], None)).is_err());
    }

    #[test]
    fn too_many_safekeepers_is_rejected() {
        let many: Vec<String> = (0..MAX_SAFEKEEPERS + 1)
            .map(|i| format!("host{i}:{i}"))
            .collect();
        let refs: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
        assert!(BroadcasterConf::from_args(args(&refs, None)).is_err());
    }
}
