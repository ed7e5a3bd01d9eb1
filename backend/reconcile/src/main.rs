use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare stored tallies with approved ballots
    Check,

    /// Overwrite drifted tallies with the recounted values
    Repair,

    /// Add a voter id to the admin set
    GrantAdmin { voter_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let store = reconcile::connect(&args.redis_url).await?;

    match args.command {
        Command::Check => {
            reconcile::reconcile_polls(&store, false).await?;
        }
        Command::Repair => {
            reconcile::reconcile_polls(&store, true).await?;
        }
        Command::GrantAdmin { voter_id } => reconcile::grant_admin(&store, &voter_id).await?,
    }

    Ok(())
}
