//! Command Handler Module
//!
//! Resolves a parsed [`Command`] to a [`Verb`], validates its arguments, and
//! runs it against the store and the replication state.
//!
//! ## Supported Commands
//!
//! - `PING [message]` - Test connection
//! - `ECHO message` - Echo message
//! - `GET key` - Get a key's value
//! - `SET key value [PX milliseconds]` - Set a key (propagated by a leader)
//! - `KEYS pattern` - Find keys by glob pattern
//! - `INFO [section]` - Server information
//! - `CONFIG GET parameter [parameter ...]` - Read `dir` / `dbfilename`
//! - `REPLCONF GETACK | ACK | listening-port | capa ...` - Replication control
//! - `PSYNC replid offset` - Start a full resynchronization
//! - `WAIT numreplicas timeout` - Wait for replica acknowledgements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Verb::from  │───>│  dispatch() │───>│   Outcome   │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                            │                                │
//! │                  ┌─────────┴─────────┐                      │
//! │                  ▼                   ▼                      │
//! │            StorageEngine     ReplicationState               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::config::Config;
use crate::connection::ConnectionStats;
use crate::protocol::{Command, RespValue};
use crate::replication::{ReplicationState, Role};
use crate::storage::{StorageEngine, StorageError};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that end the connection that sent the command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("invalid argument for '{command}': {reason}")]
    InvalidArgument { command: String, reason: String },

    #[error("'{command}' is not allowed on a {role}")]
    RoleViolation { command: String, role: Role },
}

impl CommandError {
    fn invalid(command: &str, reason: impl Into<String>) -> Self {
        CommandError::InvalidArgument {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// The verbs this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Ping,
    Echo,
    Get,
    Set,
    Keys,
    Info,
    Config,
    Replconf,
    Psync,
    Wait,
}

impl Verb {
    /// Resolves a lower-cased verb.
    pub fn from_name(name: &str) -> Option<Self> {
        let verb = match name {
            "ping" => Verb::Ping,
            "echo" => Verb::Echo,
            "get" => Verb::Get,
            "set" => Verb::Set,
            "keys" => Verb::Keys,
            "info" => Verb::Info,
            "config" => Verb::Config,
            "replconf" => Verb::Replconf,
            "psync" => Verb::Psync,
            "wait" => Verb::Wait,
            _ => return None,
        };
        Some(verb)
    }

    /// True for verbs a leader forwards to its replicas.
    pub fn is_write(self) -> bool {
        matches!(self, Verb::Set)
    }
}

/// Offset advertised in `FULLRESYNC`. A new replica counts the stream from
/// the end of its snapshot, so it starts at zero whatever the leader's offset.
pub const FULLRESYNC_OFFSET: u64 = 0;

/// What the connection should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// An ordinary reply, suppressed on the leader link
    Reply(RespValue),
    /// The answer to `REPLCONF GETACK`, written on every link
    Ack(RespValue),
    /// Nothing to write
    Silent,
    /// Attach the connection as a replica: the header and a snapshot of the
    /// store become its first frame
    FullResync { header: RespValue },
}

/// Which side of a connection we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// A client (or a replica still in its handshake)
    Client,
    /// A replica's inbound link from its leader
    Leader,
}

/// Per-connection state visible to commands.
#[derive(Debug, Clone)]
pub struct Session {
    /// Peer address
    pub addr: SocketAddr,
    /// What the peer is
    pub link: LinkKind,
    /// Port announced via `REPLCONF listening-port`
    pub listening_port: Option<u16>,
}

impl Session {
    pub fn client(addr: SocketAddr) -> Self {
        Self {
            addr,
            link: LinkKind::Client,
            listening_port: None,
        }
    }

    pub fn leader(addr: SocketAddr) -> Self {
        Self {
            addr,
            link: LinkKind::Leader,
            listening_port: None,
        }
    }
}

/// Executes commands against the shared node state.
///
/// Cheap to clone; every connection task owns one.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage engine
    storage: Arc<StorageEngine>,
    /// Role, offset, and replica registry
    replication: Arc<ReplicationState>,
    /// Startup configuration, for `CONFIG GET`
    config: Arc<Config>,
    /// Connection counters, for `INFO stats`
    stats: Arc<ConnectionStats>,
    /// Server start time for INFO command
    start_time: std::time::Instant,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(
        storage: Arc<StorageEngine>,
        replication: Arc<ReplicationState>,
        config: Arc<Config>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            storage,
            replication,
            config,
            stats,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn replication(&self) -> &Arc<ReplicationState> {
        &self.replication
    }

    /// Executes a command.
    ///
    /// # Arguments
    ///
    /// * `session` - State of the connection the command arrived on
    /// * `command` - The parsed command
    ///
    /// # Returns
    ///
    /// What to write back, or an error that should close the connection.
    /// A zero-argument command is ignored.
    pub async fn execute(
        &self,
        session: &mut Session,
        command: &Command,
    ) -> Result<Outcome, CommandError> {
        if command.is_empty() {
            trace!(client = %session.addr, "Ignoring empty command");
            return Ok(Outcome::Silent);
        }

        let verb = Verb::from_name(command.name())
            .ok_or_else(|| CommandError::UnknownCommand(command.name().to_string()))?;
        trace!(client = %session.addr, ?verb, args = command.arity(), "Dispatching");

        if verb.is_write() && self.replication.is_master() {
            // Applied and queued for replicas in one step; the reply waits
            // until every replica socket has taken the frame.
            return self
                .replication
                .apply_and_propagate(&command.to_resp(), || self.dispatch(verb, command))
                .await;
        }

        match verb {
            Verb::Replconf => self.cmd_replconf(session, command),
            Verb::Psync => Ok(self.cmd_psync(session)),
            Verb::Wait => self.cmd_wait(command).await,
            _ => self.dispatch(verb, command),
        }
    }

    /// Runs the verbs that need neither the session nor an await.
    fn dispatch(&self, verb: Verb, command: &Command) -> Result<Outcome, CommandError> {
        match verb {
            Verb::Ping => Ok(self.cmd_ping(command)),
            Verb::Echo => self.cmd_echo(command),
            Verb::Get => self.cmd_get(command),
            Verb::Set => self.cmd_set(command),
            Verb::Keys => self.cmd_keys(command),
            Verb::Info => self.cmd_info(command),
            Verb::Config => self.cmd_config(command),
            Verb::Replconf | Verb::Psync | Verb::Wait => {
                Err(CommandError::UnknownCommand(command.name().to_string()))
            }
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn require_args(command: &Command, min: usize) -> Result<(), CommandError> {
        if command.arity() < min {
            return Err(CommandError::WrongArity(command.name().to_string()));
        }
        Ok(())
    }

    fn require_role(&self, command: &Command, role: Role) -> Result<(), CommandError> {
        if self.replication.role() != role {
            return Err(CommandError::RoleViolation {
                command: command.to_string(),
                role: self.replication.role(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // String Commands
    // ========================================================================

    /// GET key
    fn cmd_get(&self, command: &Command) -> Result<Outcome, CommandError> {
        Self::require_args(command, 1)?;
        let key = &command.args()[1];

        let reply = match self.storage.get(key) {
            Ok(value) => RespValue::bulk_string(value),
            Err(StorageError::KeyNotFound(_)) => RespValue::null(),
        };
        Ok(Outcome::Reply(reply))
    }

    /// SET key value [PX milliseconds]
    fn cmd_set(&self, command: &Command) -> Result<Outcome, CommandError> {
        let ttl_ms = match command.arity() {
            2 => 0,
            4 => {
                let option = command.arg_str(3).unwrap_or_default();
                if !option.eq_ignore_ascii_case("px") {
                    return Err(CommandError::invalid(
                        "set",
                        format!("unsupported option '{}'", option),
                    ));
                }
                let raw = command.arg_str(4).unwrap_or_default();
                raw.parse::<u64>().map_err(|_| {
                    CommandError::invalid(
                        "set",
                        format!("PX value is not a non-negative integer: '{}'", raw),
                    )
                })?
            }
            3 => return Err(CommandError::invalid("set", "syntax error")),
            _ => return Err(CommandError::WrongArity("set".to_string())),
        };

        let args = command.args();
        self.storage.set(args[1].clone(), args[2].clone(), ttl_ms);
        Ok(Outcome::Reply(RespValue::ok()))
    }

    /// KEYS pattern
    fn cmd_keys(&self, command: &Command) -> Result<Outcome, CommandError> {
        if command.arity() != 1 {
            return Err(CommandError::WrongArity("keys".to_string()));
        }

        let mut keys = self.storage.keys_matching(&command.args()[1]);
        keys.sort();

        Ok(Outcome::Reply(RespValue::array(
            keys.into_iter().map(RespValue::bulk_string).collect(),
        )))
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, command: &Command) -> Outcome {
        match command.arg(1) {
            Some(message) => Outcome::Reply(RespValue::bulk_string(message.clone())),
            None => Outcome::Reply(RespValue::pong()),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, command: &Command) -> Result<Outcome, CommandError> {
        Self::require_args(command, 1)?;
        let message = command.args()[1].clone();
        Ok(Outcome::Reply(RespValue::bulk_string(message)))
    }

    /// INFO [section]
    fn cmd_info(&self, command: &Command) -> Result<Outcome, CommandError> {
        let section = command.arg_str(1).map(|s| s.to_ascii_lowercase());

        let info = match section.as_deref() {
            None | Some("all") | Some("everything") | Some("default") => [
                self.info_server(),
                self.info_replication(),
                self.info_stats(),
                self.info_keyspace(),
            ]
            .join("\r\n"),
            Some("replication") => self.info_replication(),
            Some("server") => self.info_server(),
            Some("stats") => self.info_stats(),
            Some("keyspace") => self.info_keyspace(),
            Some(other) => {
                return Err(CommandError::invalid(
                    "info",
                    format!("unknown section '{}'", other),
                ))
            }
        };

        Ok(Outcome::Reply(RespValue::bulk_string(info)))
    }

    fn info_replication(&self) -> String {
        format!(
            "# Replication\r\n\
             role:{}\r\n\
             connected_slaves:{}\r\n\
             master_replid:{}\r\n\
             master_repl_offset:{}\r\n",
            self.replication.role(),
            self.replication.replica_count(),
            self.replication.replication_id(),
            self.replication.offset(),
        )
    }

    fn info_server(&self) -> String {
        format!(
            "# Server\r\n\
             relaykv_version:{}\r\n\
             os:{}\r\n\
             tcp_port:{}\r\n\
             uptime_in_seconds:{}\r\n",
            crate::VERSION,
            std::env::consts::OS,
            self.config.port,
            self.start_time.elapsed().as_secs(),
        )
    }

    fn info_stats(&self) -> String {
        let storage = self.storage.stats();
        format!(
            "# Stats\r\n\
             total_connections_received:{}\r\n\
             connected_clients:{}\r\n\
             total_commands_processed:{}\r\n\
             total_net_input_bytes:{}\r\n\
             total_net_output_bytes:{}\r\n\
             get_ops:{}\r\n\
             set_ops:{}\r\n\
             del_ops:{}\r\n\
             expired_keys:{}\r\n",
            self.stats.connections_accepted.load(Ordering::Relaxed),
            self.stats.active_connections.load(Ordering::Relaxed),
            self.stats.commands_processed.load(Ordering::Relaxed),
            self.stats.bytes_read.load(Ordering::Relaxed),
            self.stats.bytes_written.load(Ordering::Relaxed),
            storage.get_ops,
            storage.set_ops,
            storage.del_ops,
            storage.expired,
        )
    }

    fn info_keyspace(&self) -> String {
        let mut info = String::from("# Keyspace\r\n");
        let keys = self.storage.stats().keys;
        if keys > 0 {
            let _ = write!(info, "db0:keys={}\r\n", keys);
        }
        info
    }

    /// CONFIG GET parameter [parameter ...]
    fn cmd_config(&self, command: &Command) -> Result<Outcome, CommandError> {
        Self::require_args(command, 2)?;

        let subcommand = command.arg_str(1).unwrap_or_default();
        if !subcommand.eq_ignore_ascii_case("get") {
            return Err(CommandError::invalid(
                "config",
                format!("unsupported subcommand '{}'", subcommand),
            ));
        }

        let mut reply = Vec::new();
        for param in &command.args()[2..] {
            let name = String::from_utf8_lossy(param).to_ascii_lowercase();
            let value = match name.as_str() {
                "dir" => self.config.dir.display().to_string(),
                "dbfilename" => self.config.dbfilename.clone(),
                _ => continue,
            };
            reply.push(RespValue::bulk_string(name));
            reply.push(RespValue::bulk_string(value));
        }

        Ok(Outcome::Reply(RespValue::array(reply)))
    }

    // ========================================================================
    // Replication Commands
    // ========================================================================

    /// REPLCONF GETACK * | ACK offset | listening-port port | capa ...
    fn cmd_replconf(
        &self,
        session: &mut Session,
        command: &Command,
    ) -> Result<Outcome, CommandError> {
        Self::require_args(command, 1)?;
        let subcommand = command.arg_str(1).unwrap_or_default().to_ascii_lowercase();

        match subcommand.as_str() {
            "getack" => {
                self.require_role(command, Role::Slave)?;
                let offset = self.replication.offset().to_string();
                Ok(Outcome::Ack(RespValue::command(["REPLCONF", "ACK", offset.as_str()])))
            }
            "ack" => {
                self.require_role(command, Role::Master)?;
                let acks = self.replication.record_ack();
                debug!(
                    replica = %session.addr,
                    offset = ?command.arg_str(2),
                    acks,
                    "Replica acknowledged"
                );
                Ok(Outcome::Silent)
            }
            "listening-port" => {
                Self::require_args(command, 2)?;
                let raw = command.arg_str(2).unwrap_or_default();
                let port = raw.parse::<u16>().map_err(|_| {
                    CommandError::invalid("replconf", format!("invalid port '{}'", raw))
                })?;
                session.listening_port = Some(port);
                Ok(Outcome::Reply(RespValue::ok()))
            }
            _ => Ok(Outcome::Reply(RespValue::ok())),
        }
    }

    /// PSYNC replid offset
    ///
    /// Always answers with a full resynchronization. The connection captures
    /// the store when it attaches the replica.
    fn cmd_psync(&self, session: &Session) -> Outcome {
        let header = RespValue::simple_string(format!(
            "FULLRESYNC {} {}",
            self.replication.replication_id(),
            FULLRESYNC_OFFSET
        ));
        debug!(replica = %session.addr, "Full resync requested");
        Outcome::FullResync { header }
    }

    /// WAIT numreplicas timeout
    async fn cmd_wait(&self, command: &Command) -> Result<Outcome, CommandError> {
        self.require_role(command, Role::Master)?;
        if command.arity() != 2 {
            return Err(CommandError::WrongArity("wait".to_string()));
        }

        let needed = command.arg_str(1).unwrap_or_default();
        let needed = needed.parse::<usize>().map_err(|_| {
            CommandError::invalid("wait", format!("invalid numreplicas '{}'", needed))
        })?;
        let timeout = command.arg_str(2).unwrap_or_default();
        let timeout = timeout.parse::<u64>().map_err(|_| {
            CommandError::invalid("wait", format!("invalid timeout '{}'", timeout))
        })?;

        let acked = self
            .replication
            .wait_for_replicas(needed, Duration::from_millis(timeout))
            .await;
        Ok(Outcome::Reply(RespValue::integer(acked as i64)))
    }
}
