use std::fs;
use std::io::{self, Write};

use anyhow::{Result, anyhow};
use log::{Level, debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{ENV_DEBUG, FILE_PROC_CMDLINE};
use crate::error::is_no_config_source;
use crate::logger::init_logger;
use crate::platform::{AnyPlatform, Platform, current_platform_name};

const ARG_DEBUG: &str = "DEBUG";
const ARG_PLATFORM: &str = "PLATFORM";
const ARG_COMMAND: &str = "COMMAND";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Command {
    #[default]
    Network,
    Config,
    KernelArgs,
}

impl Command {
    const NAMES: [&'static str; 3] = ["network", "config", "kernel-args"];

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "network" => Some(Command::Network),
            "config" => Some(Command::Config),
            "kernel-args" => Some(Command::KernelArgs),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Args {
    pub debug: bool,
    pub platform: Option<String>,
    pub command: Command,
}

impl Args {
    pub fn new_cmd() -> clap::Command {
        clap::Command::new("platform-metadata")
            .about("Fetch platform metadata and print the machine's network configuration")
            .arg(
                clap::Arg::new(ARG_DEBUG)
                    .short('d')
                    .long("debug")
                    .env(ENV_DEBUG)
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable debug logging"),
            )
            .arg(
                clap::Arg::new(ARG_PLATFORM)
                    .required(false)
                    .index(1)
                    .help("Platform name, defaults to platform= on the kernel command line"),
            )
            .arg(
                clap::Arg::new(ARG_COMMAND)
                    .required(false)
                    .index(2)
                    .value_parser(Command::NAMES)
                    .help("What to print, network by default"),
            )
    }

    pub fn from_matches(matches: &clap::ArgMatches) -> Self {
        let mut platform = matches.get_one::<String>(ARG_PLATFORM).cloned();
        let mut command = matches
            .get_one::<String>(ARG_COMMAND)
            .and_then(|name| Command::from_name(name.as_str()));
        // A lone positional naming a command is the command.
        if command.is_none()
            && let Some(name) = platform.as_deref()
            && let Some(c) = Command::from_name(name)
        {
            command = Some(c);
            platform = None;
        }
        Self {
            debug: matches.get_flag(ARG_DEBUG),
            platform,
            command: command.unwrap_or_default(),
        }
    }

    pub fn try_parse_from<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::new_cmd().try_get_matches_from(args)?;
        Ok(Self::from_matches(&matches))
    }
}

fn platform_from_cmdline() -> Result<String> {
    let cmdline = fs::read_to_string(FILE_PROC_CMDLINE)
        .map_err(|e| anyhow!("unable to read {}: {}", FILE_PROC_CMDLINE, e))?;
    current_platform_name(&cmdline)
        .map(String::from)
        .ok_or_else(|| anyhow!("no platform given and none set on the kernel command line"))
}

pub fn run() -> Result<()> {
    let args = Args::from_matches(&Args::new_cmd().get_matches());

    let level = if args.debug {
        Level::Debug
    } else {
        Level::Info
    };
    init_logger(level).map_err(|e| anyhow!("unable to initialize logger: {}", e))?;

    let command = args.command;
    let name = match args.platform {
        Some(name) => name,
        None => platform_from_cmdline()?,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("unable to create async runtime: {}", e))?;

    rt.block_on(async {
        let platform = AnyPlatform::from_name(&name)?;
        debug!("Using platform {} in {} mode", platform.name(), platform.mode());

        let ctx = CancellationToken::new();
        let interrupt = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                interrupt.cancel();
            }
        });

        execute(&platform, command, &ctx).await
    })
}

async fn execute(platform: &AnyPlatform, command: Command, ctx: &CancellationToken) -> Result<()> {
    let mut stdout = io::stdout();
    match command {
        Command::KernelArgs => {
            writeln!(stdout, "{}", platform.kernel_args())?;
        }
        Command::Config => match platform.configuration(ctx).await {
            Ok(config) => stdout.write_all(&config)?,
            Err(e) if is_no_config_source(&e) => {
                info!("Platform {} offers no machine configuration", platform.name());
            }
            Err(e) => return Err(e),
        },
        Command::Network => {
            let (tx, mut rx) = mpsc::channel(1);
            platform.network_configuration(ctx, &tx).await?;
            drop(tx);
            match rx.recv().await {
                Some(config) => {
                    let json = serde_json::to_string_pretty(&config)
                        .map_err(|e| anyhow!("unable to encode network configuration: {}", e))?;
                    writeln!(stdout, "{}", json)?;
                }
                None => info!("Platform {} produced no network configuration", platform.name()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    macro_rules! case__args__parse {
        ($name:ident, $input:expr, $expected:expr) => {
            #[test]
            fn $name() {
                let input: &[&str] = $input;
                let expected: Option<Args> = $expected;
                let argv = std::iter::once("platform-metadata").chain(input.iter().copied());
                let result = Args::try_parse_from(argv);
                match expected {
                    Some(e) => assert_eq!(e, result.unwrap()),
                    None => assert!(result.is_err()),
                }
            }
        };
    }

    case__args__parse!(test_args_parse_empty, &[], Some(Args::default()));
    case__args__parse!(
        test_args_parse_debug_platform,
        &["-d", "hcloud"],
        Some(Args {
            debug: true,
            platform: Some("hcloud".into()),
            command: Command::Network,
        })
    );
    case__args__parse!(
        test_args_parse_long_debug,
        &["--debug", "scaleway", "kernel-args"],
        Some(Args {
            debug: true,
            platform: Some("scaleway".into()),
            command: Command::KernelArgs,
        })
    );
    case__args__parse!(
        test_args_parse_command_only,
        &["kernel-args"],
        Some(Args {
            command: Command::KernelArgs,
            ..Default::default()
        })
    );
    case__args__parse!(
        test_args_parse_platform_and_command,
        &["nocloud", "config"],
        Some(Args {
            debug: false,
            platform: Some("nocloud".into()),
            command: Command::Config,
        })
    );
    case__args__parse!(test_args_parse_bad_command, &["aws", "reboot"], None);
    case__args__parse!(test_args_parse_unknown_flag, &["-x"], None);
    case__args__parse!(test_args_parse_too_many, &["aws", "network", "extra"], None);

    #[test]
    fn test_args_help_is_not_parsed() {
        let err = Args::try_parse_from(["platform-metadata", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cmd_definition() {
        Args::new_cmd().debug_assert();
    }
}
