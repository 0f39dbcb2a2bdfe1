use clap::{Args, Parser, Subcommand};

use crate::config::{ServerMode, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the storage server until idle (instance) or interrupted (daemon).
    Serve(ServeArgs),
    /// Print the value stored under a name.
    Get(KeyArgs),
    /// Print the values stored under prefix+item, one per line.
    GetMulti(GetMultiArgs),
    /// Store a value under a name.
    Set(SetArgs),
    /// Delete entries matching a LIKE pattern.
    Del(KeyArgs),
    /// Try to take an advisory lock; prints true or false.
    Lock(KeyArgs),
    /// Release an advisory lock.
    Unlock(KeyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Override the mode implied by --autostart.
    #[arg(long, value_enum)]
    pub mode: Option<ServerMode>,
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    /// Table (namespace) the entry lives in.
    #[arg(long)]
    pub table: String,

    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct SetArgs {
    #[arg(long)]
    pub table: String,

    pub name: String,

    pub data: String,
}

#[derive(Args, Debug, Clone)]
pub struct GetMultiArgs {
    #[arg(long)]
    pub table: String,

    pub prefix: String,

    #[arg(required = true)]
    pub items: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_settings_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "storage_server",
            "serve",
            "--mode",
            "daemon",
            "--idle-timeout",
            "3",
            "--temp-dir",
            "/tmp/cache",
        ])
        .expect("parse");

        assert_eq!(cli.settings.idle_timeout_secs, 3);
        assert_eq!(cli.settings.temp_dir, std::path::PathBuf::from("/tmp/cache"));
        match cli.command {
            Command::Serve(args) => assert_eq!(args.mode, Some(ServerMode::Daemon)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn get_multi_takes_prefix_and_items() {
        let cli = Cli::try_parse_from([
            "storage_server",
            "get-multi",
            "--table",
            "movies",
            "page",
            "1",
            "2",
        ])
        .expect("parse");

        match cli.command {
            Command::GetMulti(args) => {
                assert_eq!(args.table, "movies");
                assert_eq!(args.prefix, "page");
                assert_eq!(args.items, vec!["1", "2"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
