use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "snapcache")]
#[command(about = "Browse the snap store and manage published snaps")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Keep responses in memory only instead of the on-disk cache
    #[arg(long, global = true)]
    pub no_disk_cache: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show stable-channel details for one or more snaps
    Details(DetailsArgs),
    /// Search the store
    Search(SearchArgs),
    /// List featured snaps
    Featured,
    /// List promoted snaps
    Promoted,
    /// Installed base by country for a snap
    Metrics(MetricsArgs),
    /// Start or complete a login
    Login(LoginArgs),
    /// Forget the stored credentials
    Logout,
    /// Show the logged-in identity
    Whoami,
    /// Show or update the publisher account
    Account(AccountArgs),
    /// Show the status of a published snap
    Status(SnapArgs),
    /// Show or update listing metadata of a published snap
    Metadata(MetadataArgs),
}

#[derive(Args)]
pub struct DetailsArgs {
    /// Snap names
    #[arg(required = true)]
    pub names: Vec<String>,
}

#[derive(Args)]
pub struct SearchArgs {
    pub query: String,
    /// Results per page
    #[arg(long, default_value_t = 10)]
    pub size: u32,
    /// Index of the first result
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

#[derive(Args)]
pub struct MetricsArgs {
    pub name: String,
    /// Days of history to request
    #[arg(long, default_value_t = 30)]
    pub days: i64,
}

#[derive(Args)]
pub struct LoginArgs {
    /// Request a root macaroon and print the caveat id to discharge
    #[arg(long, conflicts_with_all = ["root", "discharge"])]
    pub begin: bool,
    /// Serialized root macaroon (defaults to the one from `--begin`)
    #[arg(long, env = "SNAPCACHE_ROOT_MACAROON")]
    pub root: Option<String>,
    /// Serialized discharge macaroon issued by the SSO
    #[arg(long, env = "SNAPCACHE_DISCHARGE_MACAROON")]
    pub discharge: Option<String>,
    #[arg(long)]
    pub nickname: Option<String>,
    #[arg(long)]
    pub fullname: Option<String>,
    #[arg(long)]
    pub email: Option<String>,
}

#[derive(Args)]
pub struct AccountArgs {
    /// Choose the store username
    #[arg(long)]
    pub set_username: Option<String>,
    /// Accept the developer programme agreement
    #[arg(long)]
    pub accept_agreement: bool,
}

#[derive(Args)]
pub struct SnapArgs {
    /// Snap name
    pub name: String,
}

#[derive(Args)]
pub struct MetadataArgs {
    /// Snap name
    pub name: String,
    /// Field to update, as key=value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search_defaults() {
        let cli = Cli::try_parse_from(["snapcache", "search", "editor"]).unwrap();
        match cli.command {
            Commands::Search(args) => {
                assert_eq!(args.query, "editor");
                assert_eq!(args.size, 10);
                assert_eq!(args.offset, 0);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_login_begin_conflicts_with_tokens() {
        assert!(Cli::try_parse_from(["snapcache", "login", "--begin", "--discharge", "x"]).is_err());
    }

    #[test]
    fn test_metadata_repeated_set() {
        let cli = Cli::try_parse_from([
            "snapcache", "metadata", "hello", "--set", "title=Hi", "--set", "summary=Short",
        ])
        .unwrap();
        match cli.command {
            Commands::Metadata(args) => assert_eq!(args.set, vec!["title=Hi", "summary=Short"]),
            _ => panic!("expected metadata"),
        }
    }
}
