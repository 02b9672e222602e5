//! ledger-tasks - personal task list kept on a ledger contract
//!
//! Connects a wallet, binds the task contract to the authorized account and
//! runs task and fund operations as confirmed ledger transactions.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

pub mod config;
pub mod contract;
pub mod feedback;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod wallet;

#[cfg(test)]
mod testing;

use config::ClientConfig;
use contract::LedgerBinder;
use feedback::ConsoleFeedback;
use orchestrator::{Operation, TxOrchestrator};
use session::SessionManager;
use store::{BalanceStore, TaskStore};
use wallet::{KeyWallet, RpcWallet, WalletGateway};

/// ledger-tasks: manage your tasks on a ledger contract
#[derive(Parser)]
#[command(name = "ledger-tasks")]
#[command(about = "Personal task list kept on a ledger contract", long_about = None)]
struct Cli {
    /// Wallet / node JSON-RPC endpoint
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Task contract address
    #[arg(long, global = true)]
    contract: Option<String>,

    /// Seconds to wait for a confirmation (0 = no limit)
    #[arg(long, global = true)]
    confirm_timeout: Option<u64>,

    /// Print tasks as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List your tasks
    Tasks,

    /// Add a task
    Add {
        /// Task title
        #[arg(short, long)]
        title: String,

        /// Task description
        #[arg(short = 'x', long)]
        text: String,
    },

    /// Delete a task by id
    Delete {
        #[arg(value_name = "ID")]
        id: u64,
    },

    /// Deposit ETH into the contract
    Deposit {
        /// Amount in ETH (e.g. 0.01)
        #[arg(value_name = "AMOUNT")]
        amount: String,
    },

    /// Withdraw ETH from the contract
    Withdraw {
        /// Amount in ETH (e.g. 0.01)
        #[arg(value_name = "AMOUNT")]
        amount: String,
    },

    /// Show the contract balance
    Balance,

    /// Stay connected and follow wallet account/chain changes
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✘ {}", e);
            std::process::exit(2);
        }
    };
    info!("Using {:?}", config);

    let (gateway, rpc) = match build_gateway(&config).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("✘ {}", e);
            std::process::exit(2);
        }
    };

    let tasks = Arc::new(TaskStore::new());
    let balance = Arc::new(BalanceStore::new());
    let binder = Arc::new(
        LedgerBinder::new(gateway.clone(), config.contract_address)
            .with_poll_interval(config.poll_interval),
    );
    let session = Arc::new(SessionManager::new(
        gateway,
        binder,
        tasks.clone(),
        balance.clone(),
    ));
    let orchestrator = Arc::new(
        TxOrchestrator::new(session, tasks, balance, Arc::new(ConsoleFeedback))
            .with_confirmation_timeout(config.confirmation_timeout),
    );

    // Failures are already reported through feedback
    if orchestrator.connect().await.is_err() {
        return;
    }

    match cli.command {
        Commands::Tasks => print_tasks(&orchestrator, cli.json),
        Commands::Add { title, text } => {
            if orchestrator
                .execute(Operation::add_task(&title, &text))
                .await
                .is_ok()
            {
                print_tasks(&orchestrator, cli.json);
            }
        }
        Commands::Delete { id } => {
            if orchestrator.execute(Operation::delete_task(id)).await.is_ok() {
                print_tasks(&orchestrator, cli.json);
            }
        }
        Commands::Deposit { amount } => {
            if orchestrator.execute(Operation::deposit(&amount)).await.is_ok() {
                print_balance(&orchestrator);
            }
        }
        Commands::Withdraw { amount } => {
            if orchestrator.execute(Operation::withdraw(&amount)).await.is_ok() {
                print_balance(&orchestrator);
            }
        }
        Commands::Balance => print_balance(&orchestrator),
        Commands::Watch => {
            print_balance(&orchestrator);
            print_tasks(&orchestrator, cli.json);

            let watcher = rpc.spawn_watcher(config.watch_interval);
            let follower = orchestrator.clone().watch_wallet();
            info!("Watching wallet for changes, Ctrl-C to stop");

            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("✘ Failed to listen for Ctrl-C: {}", e);
            }
            watcher.abort();
            follower.abort();
            orchestrator.session().disconnect();
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig, config::ConfigError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.rpc_url {
        config = config.with_rpc_url(url);
    }
    if let Some(address) = &cli.contract {
        config = config.with_contract(address)?;
    }
    if let Some(secs) = cli.confirm_timeout {
        config = config.with_confirmation_timeout_secs(secs);
    }
    Ok(config)
}

/// Pick the wallet: a local key when one is configured, node accounts otherwise
async fn build_gateway(
    config: &ClientConfig,
) -> Result<(Arc<dyn WalletGateway>, Arc<RpcWallet>), wallet::WalletError> {
    let rpc = Arc::new(RpcWallet::new(&config.rpc_url));

    let gateway: Arc<dyn WalletGateway> = match &config.private_key {
        Some(key) => {
            let chain_id = rpc.chain_id().await?;
            Arc::new(KeyWallet::from_private_key(key, chain_id, rpc.clone())?)
        }
        None => rpc.clone(),
    };
    Ok((gateway, rpc))
}

fn print_tasks(orchestrator: &TxOrchestrator, json: bool) {
    let tasks = orchestrator.tasks();

    if json {
        match serde_json::to_string_pretty(&*tasks) {
            Ok(out) => println!("{}", out),
            Err(e) => eprintln!("✘ Failed to encode tasks: {}", e),
        }
        return;
    }

    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│  YOUR TASKS                                                 │");
    println!("├─────────────────────────────────────────────────────────────┤");
    if tasks.is_empty() {
        println!("│  No tasks found.");
    }
    for task in tasks.iter() {
        println!("│  #{:<5} {}", task.id, task.title);
        println!("│         {}", task.text);
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}

fn print_balance(orchestrator: &TxOrchestrator) {
    println!("Contract balance: {} ETH", orchestrator.balance_display());
}
