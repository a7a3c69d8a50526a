//! Node configuration: session timeouts and the join-party version gate.

use std::{ffi::OsString, time::Duration};

use anyhow::anyhow;
use clap::{value_parser, Arg, ArgMatches, Command};

use crate::{join_party::VersionGate, TssResult};

pub const DEFAULT_KEYGEN_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_KEYSIGN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PARTY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_TIMEOUT: Duration = crate::p2p::stream::DEFAULT_STREAM_TIMEOUT;
/// first request version that joins parties through a leader
pub const DEFAULT_LEADER_JOIN_VERSION: &str = "0.14.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssConfig {
    /// overall bound of a keygen session
    pub keygen_timeout: Duration,
    /// overall bound of a keysign session
    pub keysign_timeout: Duration,
    /// max time without local round progress
    pub round_timeout: Duration,
    /// bound of the join-party phase
    pub party_timeout: Duration,
    /// bound of a single stream read or write
    pub stream_timeout: Duration,
    pub leader_join_version: String,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            keygen_timeout: DEFAULT_KEYGEN_TIMEOUT,
            keysign_timeout: DEFAULT_KEYSIGN_TIMEOUT,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            party_timeout: DEFAULT_PARTY_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            leader_join_version: DEFAULT_LEADER_JOIN_VERSION.to_string(),
        }
    }
}

impl TssConfig {
    /// The join-party policy this configuration selects
    pub fn version_gate(&self) -> TssResult<VersionGate> {
        VersionGate::new(&self.leader_join_version)
    }
}

pub fn parse_args() -> TssResult<TssConfig> {
    parse_args_from(std::env::args_os())
}

pub fn parse_args_from<I, T>(args: I) -> TssResult<TssConfig>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let secs = |name: &'static str| {
        Arg::new(name)
            .long(name)
            .required(false)
            .value_parser(value_parser!(u64))
            .help("timeout in seconds")
    };

    let matches = Command::new("tss-bridge")
        .about("Threshold signature coordination for bridge validators")
        .arg(secs("keygen-timeout"))
        .arg(secs("keysign-timeout"))
        .arg(secs("round-timeout"))
        .arg(secs("party-timeout"))
        .arg(secs("stream-timeout"))
        .arg(
            Arg::new("leader-join-version")
                .long("leader-join-version")
                .required(false)
                .default_value(DEFAULT_LEADER_JOIN_VERSION),
        )
        .try_get_matches_from(args)?;

    let cfg = TssConfig {
        keygen_timeout: duration_of(&matches, "keygen-timeout", DEFAULT_KEYGEN_TIMEOUT)?,
        keysign_timeout: duration_of(&matches, "keysign-timeout", DEFAULT_KEYSIGN_TIMEOUT)?,
        round_timeout: duration_of(&matches, "round-timeout", DEFAULT_ROUND_TIMEOUT)?,
        party_timeout: duration_of(&matches, "party-timeout", DEFAULT_PARTY_TIMEOUT)?,
        stream_timeout: duration_of(&matches, "stream-timeout", DEFAULT_STREAM_TIMEOUT)?,
        leader_join_version: matches
            .get_one::<String>("leader-join-version")
            .ok_or_else(|| anyhow!("leader-join-version value"))?
            .clone(),
    };
    // reject a gate that cannot be parsed now rather than on the first request
    cfg.version_gate()?;
    Ok(cfg)
}

fn duration_of(matches: &ArgMatches, name: &str, default: Duration) -> TssResult<Duration> {
    let Some(secs) = matches.get_one::<u64>(name) else {
        return Ok(default);
    };
    if *secs == 0 {
        return Err(anyhow!("{} must be positive", name));
    }
    Ok(Duration::from_secs(*secs))
}
