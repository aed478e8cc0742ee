//! Server configuration from command-line arguments.
//!
//! ```text
//! relaykv [--host HOST] [--port PORT] [--replicaof "HOST PORT"]
//!         [--dir DIR] [--dbfilename FILE] [--help] [--version]
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Default directory holding the snapshot file
pub const DEFAULT_DIR: &str = "/tmp/redis-files";

/// Default snapshot file name
pub const DEFAULT_DBFILENAME: &str = "dump.rdb";

/// Errors raised while parsing arguments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid port number: {0}")]
    InvalidPort(String),

    #[error("invalid --replicaof value: {0} (expected \"<host> <port>\")")]
    InvalidReplicaOf(String),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cli {
    Serve(Config),
    Help,
    Version,
}

/// Read-only server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (also announced to the leader)
    pub port: u16,
    /// Leader address as `host:port`; `Some` makes this process a replica
    pub replica_of: Option<String>,
    /// Directory holding the snapshot
    pub dir: PathBuf,
    /// Snapshot file name inside `dir`
    pub dbfilename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            replica_of: None,
            dir: PathBuf::from(DEFAULT_DIR),
            dbfilename: DEFAULT_DBFILENAME.to_string(),
        }
    }
}

impl Cli {
    /// Parses arguments, excluding the program name.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" => return Ok(Cli::Help),
                "--version" | "-v" => return Ok(Cli::Version),
                "--host" | "-h" => {
                    config.host = value_of(&args, i)?.to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = parse_port(value_of(&args, i)?)?;
                    i += 2;
                }
                "--dir" => {
                    config.dir = PathBuf::from(value_of(&args, i)?);
                    i += 2;
                }
                "--dbfilename" => {
                    config.dbfilename = value_of(&args, i)?.to_string();
                    i += 2;
                }
                "--replicaof" => {
                    let value = value_of(&args, i)?;
                    let (leader, used) = parse_replica_of(value, args.get(i + 2))?;
                    config.replica_of = Some(leader);
                    i += 1 + used;
                }
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
        }

        Ok(Cli::Serve(config))
    }
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Full path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }

    /// True when started with `--replicaof`
    pub fn is_replica(&self) -> bool {
        self.replica_of.is_some()
    }
}

fn value_of(args: &[String], i: usize) -> Result<&str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(args[i].clone()))
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidPort(raw.to_string()))
}

/// Accepts `"host port"`, `host:port`, or `host` followed by a separate port
/// argument. Returns the `host:port` address and how many arguments it used.
fn parse_replica_of(value: &str, next: Option<&String>) -> Result<(String, usize), ConfigError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    match parts.as_slice() {
        [host, port] => {
            parse_port(port).map_err(|_| ConfigError::InvalidReplicaOf(value.to_string()))?;
            Ok((format!("{}:{}", host, port), 1))
        }
        [single] => {
            if let Some((_, port)) = single.rsplit_once(':') {
                parse_port(port).map_err(|_| ConfigError::InvalidReplicaOf(value.to_string()))?;
                return Ok((single.to_string(), 1));
            }
            match next {
                Some(port) if parse_port(port).is_ok() => Ok((format!("{}:{}", single, port), 2)),
                _ => Err(ConfigError::InvalidReplicaOf(value.to_string())),
            }
        }
        _ => Err(ConfigError::InvalidReplicaOf(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve(args: &[&str]) -> Config {
        match Cli::from_args(args.iter().copied()).unwrap() {
            Cli::Serve(config) => config,
            other => panic!("expected Serve, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = serve(&[]);
        assert_eq!(config.port, 6379);
        assert_eq!(config.bind_address(), "127.0.0.1:6379");
        assert!(!config.is_replica());
        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/redis-files/dump.rdb"));
    }

    #[test]
    fn test_all_flags() {
        let config = serve(&[
            "--host", "0.0.0.0", "--port", "6380", "--dir", "/data", "--dbfilename", "x.rdb",
        ]);
        assert_eq!(config.bind_address(), "0.0.0.0:6380");
        assert_eq!(config.snapshot_path(), PathBuf::from("/data/x.rdb"));
    }

    #[test]
    fn test_replicaof_forms() {
        let quoted = serve(&["--port", "6380", "--replicaof", "localhost 6379"]);
        assert_eq!(quoted.replica_of.as_deref(), Some("localhost:6379"));

        let split = serve(&["--replicaof", "localhost", "6379", "--port", "6381"]);
        assert_eq!(split.replica_of.as_deref(), Some("localhost:6379"));
        assert_eq!(split.port, 6381);

        let joined = serve(&["--replicaof", "10.0.0.1:7000"]);
        assert_eq!(joined.replica_of.as_deref(), Some("10.0.0.1:7000"));
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(Cli::from_args(["--help"]), Ok(Cli::Help));
        assert_eq!(Cli::from_args(["-v"]), Ok(Cli::Version));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Cli::from_args(["--port"]),
            Err(ConfigError::MissingValue("--port".to_string()))
        );
        assert_eq!(
            Cli::from_args(["--port", "99999"]),
            Err(ConfigError::InvalidPort("99999".to_string()))
        );
        assert_eq!(
            Cli::from_args(["--replicaof", "localhost"]),
            Err(ConfigError::InvalidReplicaOf("localhost".to_string()))
        );
        assert_eq!(
            Cli::from_args(["--replicaof", "a b c"]),
            Err(ConfigError::InvalidReplicaOf("a b c".to_string()))
        );
        assert_eq!(
            Cli::from_args(["--bogus"]),
            Err(ConfigError::UnknownArgument("--bogus".to_string()))
        );
    }
}
