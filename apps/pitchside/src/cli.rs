use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use pitchside_core::identity::ParticipantId;
use pitchside_core::match_state::{MatchState, RosterEntry};
use pitchside_core::store::StoreError;
use pitchside_core::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "pitchside",
    about = "Pair two Pitchside clients and keep their match state in sync",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Base URL of the pitchside-road signaling server (overrides config)"
    )]
    pub signaling_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Directory for the durable match store (overrides config)"
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Read configuration from this TOML file"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PITCHSIDE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PITCHSIDE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host a match: print a pairing code and wait for the other player
    Host(SideArgs),
    /// Join a hosted match with its pairing code
    Join(JoinArgs),
    /// Resume the saved match after a restart
    Reconnect,
    /// Leave the network match and forget it
    Leave,
    /// Show the saved session and both sides' match state
    Status,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    /// Four digit code shown on the host's screen
    pub code: u32,

    #[command(flatten)]
    pub side: SideArgs,
}

/// Team sheet applied to your side once the match is connected.
#[derive(Args, Debug, Default)]
pub struct SideArgs {
    #[arg(long, value_name = "NAME", help = "Guild you are playing")]
    pub guild: Option<String>,

    #[arg(
        long,
        value_name = "NAME=HEALTH",
        value_delimiter = ',',
        value_parser = parse_roster_entry,
        help = "Roster entries, e.g. Boiler=16,Meathook=12"
    )]
    pub roster: Vec<RosterEntry>,
}

impl SideArgs {
    pub async fn apply(&self, state: &MatchState, player: ParticipantId) -> Result<(), StoreError> {
        if let Some(guild) = &self.guild {
            state.select_guild(player, guild.clone()).await?;
        }
        if !self.roster.is_empty() {
            state.set_roster(player, self.roster.clone()).await?;
        }
        Ok(())
    }
}

fn parse_roster_entry(raw: &str) -> Result<RosterEntry, String> {
    let (name, health) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=HEALTH, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing model name in {raw:?}"));
    }
    let health = health
        .trim()
        .parse()
        .map_err(|_| format!("health for {name} must be a whole number"))?;
    Ok(RosterEntry::new(name, health))
}

/// One line typed into an attached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Roster(Vec<RosterEntry>),
    Guild(String),
    Health { model: String, delta: i32 },
    Score(u32),
    Momentum(u32),
    Screen(String),
    Show,
    Leave,
}

pub const SESSION_HELP: &str =
    "commands: roster NAME=HEALTH..., guild NAME, health MODEL DELTA, score N, momentum N, screen NAME, show, leave";

impl FromStr for SessionCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| SESSION_HELP.to_owned())?;
        let rest: Vec<&str> = words.collect();
        let joined = || {
            let text = rest.join(" ");
            if text.is_empty() {
                Err(format!("{verb} needs a name"))
            } else {
                Ok(text)
            }
        };
        let number = || match rest.as_slice() {
            [value] => value
                .parse::<u32>()
                .map_err(|_| format!("{verb} must be a whole number")),
            _ => Err(format!("usage: {verb} N")),
        };
        match verb {
            "roster" if !rest.is_empty() => rest
                .iter()
                .map(|entry| parse_roster_entry(entry))
                .collect::<Result<_, _>>()
                .map(SessionCommand::Roster),
            "roster" => Err("usage: roster NAME=HEALTH...".to_owned()),
            "guild" => joined().map(SessionCommand::Guild),
            "screen" => joined().map(SessionCommand::Screen),
            "health" => {
                let Some((delta, model)) = rest
                    .split_last()
                    .filter(|(_, model)| !model.is_empty())
                else {
                    return Err("usage: health MODEL DELTA".to_owned());
                };
                let delta = delta
                    .parse()
                    .map_err(|_| format!("health change must be signed whole number, got {delta:?}"))?;
                Ok(SessionCommand::Health {
                    model: model.join(" "),
                    delta,
                })
            }
            "score" => number().map(SessionCommand::Score),
            "momentum" => number().map(SessionCommand::Momentum),
            "show" => Ok(SessionCommand::Show),
            "leave" => Ok(SessionCommand::Leave),
            _ => Err(format!("unknown command {verb:?}; {SESSION_HELP}")),
        }
    }
}

impl SessionCommand {
    /// Apply an edit to `player`'s side. Returns a line to print, if any.
    /// `Show` and `Leave` are handled by the caller.
    pub async fn apply(
        self,
        state: &MatchState,
        player: ParticipantId,
    ) -> Result<Option<String>, StoreError> {
        match self {
            SessionCommand::Roster(roster) => {
                state.set_roster(player, roster).await?;
            }
            SessionCommand::Guild(guild) => {
                state.select_guild(player, guild).await?;
            }
            SessionCommand::Health { model, delta } => {
                let health = state.adjust_health(player, &model, delta).await?;
                return Ok(Some(format!("{model}: {health}")));
            }
            SessionCommand::Score(score) => {
                state.set_score(player, score).await?;
            }
            SessionCommand::Momentum(momentum) => {
                state.set_momentum(player, momentum).await?;
            }
            SessionCommand::Screen(screen) => {
                state.navigate_to(player, screen).await?;
            }
            SessionCommand::Show | SessionCommand::Leave => {}
        }
        Ok(None)
    }
}
