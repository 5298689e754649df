use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use powledger::api::{self, AppState};
use powledger::blockchain::{self, Blockchain, SledStore};
use powledger::config::{LedgerConfig, DEFAULT_BLOCK_REWARD, DEFAULT_DIFFICULTY};

/// Single-node proof-of-work ledger with a REST API
#[derive(Parser, Debug)]
#[command(name = "powledger", version, about)]
struct Cli {
    /// Address the HTTP server binds to
    #[arg(long, env = "POWLEDGER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port the HTTP server listens on
    #[arg(long, short = 'p', env = "POWLEDGER_PORT", default_value_t = 8080)]
    port: u16,

    /// Directory of the sled database
    #[arg(long, short = 'd', env = "POWLEDGER_DATA_DIR", default_value = "data/blockchain")]
    data_dir: PathBuf,

    /// Keep everything in memory and never touch the data directory
    #[arg(long, env = "POWLEDGER_IN_MEMORY")]
    in_memory: bool,

    /// Leading zero hex digits required of each mined block
    #[arg(long, env = "POWLEDGER_DIFFICULTY", default_value_t = DEFAULT_DIFFICULTY,
          value_parser = clap::value_parser!(u8).range(0..=64))]
    difficulty: u8,

    /// Reward paid to the miner of each block
    #[arg(long, env = "POWLEDGER_REWARD", default_value_t = DEFAULT_BLOCK_REWARD)]
    reward: f64,
}

impl Cli {
    fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            block_reward: self.reward,
            ..LedgerConfig::with_difficulty(self.difficulty)
        }
    }
}

// Opens the persistent chain, falling back to memory when the database cannot be opened
fn initialize_blockchain(cli: &Cli) -> anyhow::Result<Blockchain> {
    let config = cli.ledger_config();

    if cli.in_memory {
        info!("Running with an in-memory blockchain");
        return Ok(Blockchain::new(config));
    }

    if let Err(e) = std::fs::create_dir_all(&cli.data_dir) {
        warn!("Failed to create data directory: {}", e);
    }

    match SledStore::open(&cli.data_dir) {
        Ok(store) => {
            let blockchain = Blockchain::with_store(config, Arc::new(store))
                .with_context(|| format!("failed to load blockchain from {}", cli.data_dir.display()))?;
            info!("Loaded blockchain from storage at {}", cli.data_dir.display());
            Ok(blockchain)
        }
        Err(err) => {
            warn!("Failed to open storage: {}", err);
            warn!("Creating in-memory blockchain instead");
            Ok(Blockchain::new(config))
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::get_block_by_hash,
        api::handlers::get_transaction,
        api::handlers::get_pending_transactions,
        api::handlers::submit_transaction,
        api::handlers::sign_transaction,
        api::handlers::mine_block,
        api::handlers::cancel_mining,
        api::handlers::validate_chain,
        api::handlers::create_wallet,
        api::handlers::get_wallet_balance,
        api::handlers::get_wallet_history
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::Transfer,
            blockchain::Reward,
            blockchain::Address,
            blockchain::PublicKey,
            blockchain::DigitalSignature,
            blockchain::HistoryEntry,
            blockchain::Direction,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MinedTransactionResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::ValidationResponse,
            api::handlers::WalletResponse,
            api::handlers::BalanceResponse
        )
    ),
    tags(
        (name = "powledger", description = "Proof-of-work ledger API endpoints")
    ),
    info(
        title = "Powledger API",
        version = "1.0.0",
        description = "A single-node proof-of-work ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let blockchain = Arc::new(initialize_blockchain(&cli)?);
    info!(
        "Chain height {}, next difficulty {}",
        blockchain.height(),
        blockchain.next_difficulty()
    );

    let state = web::Data::new(AppState::new(blockchain));

    info!("Starting HTTP server at http://{}:{}", cli.host, cli.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::configure_routes)
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi))
    })
    .bind((cli.host.as_str(), cli.port))
    .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_builds_ledger_config() {
        let cli = Cli::parse_from(["powledger", "--difficulty", "2", "--reward", "25", "--in-memory"]);
        let config = cli.ledger_config();

        assert!(cli.in_memory);
        assert_eq!(config.block_reward, 25.0);
        assert_eq!(config.difficulty, powledger::config::DifficultyPolicy::Fixed(2));
        assert!(Cli::try_parse_from(["powledger", "--difficulty", "65"]).is_err());
    }
}
