use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy_primitives::{Address, utils::parse_ether};
use clap::{Args, Parser, Subcommand};
use eyre::{WrapErr, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod account;
mod bridge;
mod config;
mod driver;
mod error;
mod funding;
mod metrics;
mod reconcile;
mod rpc;
mod store;
mod transaction;

#[cfg(test)]
mod mock;

use crate::{
    account::{AccountSpec, AccountStatus, CredentialRef, Layer, named_pool},
    bridge::BridgeCoordinator,
    config::{AccountSelection, BridgeConfig, LayerConfig, RetryPolicy, StressConfig},
    driver::LoadDriver,
    funding::Funder,
    rpc::{AlloyRpc, RpcClientPool},
    store::AccountStore,
    transaction::{ChainParams, Signer},
};

const ROOT_ACCOUNT_ID: &str = "root";

#[derive(Parser, Debug)]
#[command(name = "testnet-stress", about = "Drive transaction load against an L1/L2 test network")]
struct Cli {
    #[command(flatten)]
    network: NetworkArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct NetworkArgs {
    #[arg(long, env = "L1_RPC_URL", default_value = "http://localhost:8545")]
    l1_rpc: String,
    #[arg(long, default_value_t = 1337)]
    l1_chain_id: u64,
    #[arg(long, env = "L2_RPC_URL", default_value = "http://localhost:8547")]
    l2_rpc: String,
    #[arg(long, default_value_t = 412346)]
    l2_chain_id: u64,
    #[arg(long, default_value_t = 20)]
    max_fee_gwei: u64,
    #[arg(long, default_value_t = 1)]
    priority_fee_gwei: u64,

    /// redb file holding account state.
    #[arg(long, default_value = "accounts.redb")]
    store: PathBuf,
    /// Use Redis instead of the local redb file.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
    #[arg(long, default_value = "testnet")]
    redis_namespace: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the root account and a named pool, optionally funding it.
    Provision {
        /// Environment variable holding the hex root key.
        #[arg(long, default_value = "ROOT_PRIVATE_KEY")]
        root_key_env: String,
        #[arg(long, default_value = "threaduser_")]
        prefix: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Ether sent from root to every pool account.
        #[arg(long)]
        fund: Option<String>,
        #[arg(long, value_delimiter = ',', default_value = "l1")]
        fund_layers: Vec<Layer>,
    },
    /// Move value between layers for pool accounts.
    Bridge {
        #[arg(long, default_value = "threaduser_")]
        prefix: String,
        /// Ether per account.
        #[arg(long)]
        amount: String,
        #[arg(long, default_value = "l1")]
        from: Layer,
        /// L1 inbox contract.
        #[arg(long)]
        inbox: Address,
        #[arg(long, default_value_t = 600)]
        deadline_secs: u64,
        #[arg(long, default_value_t = 2)]
        poll_secs: u64,
    },
    /// Run the load driver.
    Stress(StressArgs),
    /// Compare stored nonces with the chains.
    Reconcile,
}

#[derive(Args, Debug)]
struct StressArgs {
    #[arg(long, default_value = "stress")]
    run_id: String,
    #[arg(long, default_value_t = 10.0)]
    rate: f64,
    #[arg(long)]
    duration_secs: Option<u64>,
    #[arg(long)]
    volume: Option<u64>,
    #[arg(long, default_value_t = 64)]
    max_in_flight: usize,
    #[arg(long, value_delimiter = ',', default_value = "l2")]
    layers: Vec<Layer>,
    /// `id=weight` pairs; round-robin when empty.
    #[arg(long, value_delimiter = ',')]
    weights: Vec<String>,
    #[arg(long)]
    recipient: Option<Address>,
    #[arg(long, default_value_t = 1)]
    min_value_gwei: u64,
    #[arg(long, default_value_t = 1)]
    max_value_gwei: u64,
    #[arg(long, default_value_t = 60)]
    confirmation_timeout_secs: u64,
    #[arg(long, default_value_t = 30)]
    drain_grace_secs: u64,
    #[arg(long, default_value_t = 0.5)]
    failure_threshold: f64,
    #[arg(long, default_value_t = 50)]
    failure_window: usize,
    #[arg(long)]
    persist_outcomes: bool,
    /// Log a live snapshot this often.
    #[arg(long, default_value_t = 10)]
    report_secs: u64,
}

struct Context {
    store: AccountStore,
    signer: Signer,
    rpc: Arc<RpcClientPool<AlloyRpc>>,
}

impl NetworkArgs {
    fn layer_config(&self, layer: Layer) -> LayerConfig {
        let (url, chain_id) = match layer {
            Layer::L1 => (&self.l1_rpc, self.l1_chain_id),
            Layer::L2 => (&self.l2_rpc, self.l2_chain_id),
        };
        LayerConfig::new(url.clone(), chain_id).with_fees(
            u128::from(self.max_fee_gwei) * 1_000_000_000,
            u128::from(self.priority_fee_gwei) * 1_000_000_000,
        )
    }

    fn context(&self) -> eyre::Result<Context> {
        let store = match &self.redis_url {
            Some(url) => AccountStore::open_redis(url, &self.redis_namespace)?,
            None => AccountStore::open_redb(&self.store)
                .wrap_err_with(|| format!("opening {}", self.store.display()))?,
        };

        let (l1, l2) = (self.layer_config(Layer::L1), self.layer_config(Layer::L2));
        let rpc = RpcClientPool::new(
            AlloyRpc::connect(&l1.rpc_url)?,
            AlloyRpc::connect(&l2.rpc_url)?,
            RetryPolicy::default(),
        );
        let signer = Signer::new(ChainParams::from(&l1), ChainParams::from(&l2));

        Ok(Context {
            store,
            signer,
            rpc: Arc::new(rpc),
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let ctx = cli.network.context()?;

    match cli.command {
        Command::Provision {
            root_key_env,
            prefix,
            count,
            fund,
            fund_layers,
        } => provision(&ctx, root_key_env, &prefix, count, fund, &fund_layers).await,
        Command::Bridge {
            prefix,
            amount,
            from,
            inbox,
            deadline_secs,
            poll_secs,
        } => {
            let amount =
                parse_ether(&amount).wrap_err_with(|| format!("invalid ether amount {amount}"))?;
            let ids = pool_ids(&ctx.store, &prefix)?;
            let config = BridgeConfig::new(inbox)
                .with_deadline(Duration::from_secs(deadline_secs))
                .with_poll_interval(Duration::from_secs(poll_secs));
            let coordinator = Arc::new(BridgeCoordinator::new(
                ctx.store.clone(),
                ctx.signer.clone(),
                ctx.rpc.clone(),
                config,
            ));

            let report = coordinator.bridge_all(&ids, from, amount).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failures.is_empty() {
                bail!("{} bridge operations failed", report.failures.len());
            }
            Ok(())
        }
        Command::Stress(args) => stress(&ctx, args).await,
        Command::Reconcile => {
            let report = reconcile::reconcile(&ctx.store, &ctx.rpc, &Layer::ALL).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn provision(
    ctx: &Context,
    root_key_env: String,
    prefix: &str,
    count: usize,
    fund: Option<String>,
    fund_layers: &[Layer],
) -> eyre::Result<()> {
    let funder = Funder::new(ctx.store.clone(), ctx.signer.clone(), ctx.rpc.clone());

    let root = AccountSpec::from_credential(ROOT_ACCOUNT_ID, CredentialRef::Env(root_key_env))?;
    funder.provision(&[root], AccountStatus::Active).await?;

    let specs = named_pool(prefix, count)?;
    let status = if fund.is_some() {
        AccountStatus::Funding
    } else {
        AccountStatus::Active
    };
    let accounts = funder.provision(&specs, status).await?;
    for account in &accounts {
        info!(id = %account.id, address = %account.address, "Pool account");
    }

    if let Some(amount) = fund {
        let amount = parse_ether(&amount).wrap_err_with(|| format!("invalid ether amount {amount}"))?;
        let ids: Vec<_> = specs.into_iter().map(|s| s.id).collect();
        for &layer in fund_layers {
            let report = funder.fund(ROOT_ACCOUNT_ID, layer, &ids, amount).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn stress(ctx: &Context, args: StressArgs) -> eyre::Result<()> {
    if !args.rate.is_finite() || args.rate <= 0.0 {
        bail!("--rate must be a positive number, got {}", args.rate);
    }
    let selection = if args.weights.is_empty() {
        AccountSelection::RoundRobin
    } else {
        AccountSelection::Weighted(parse_weights(&args.weights)?)
    };

    let mut config = StressConfig::default()
        .with_run_id(args.run_id)
        .with_tx_rate(args.rate)
        .with_max_in_flight(args.max_in_flight)
        .with_layers(args.layers)
        .with_selection(selection)
        .with_confirmation_timeout(Duration::from_secs(args.confirmation_timeout_secs))
        .with_drain_grace(Duration::from_secs(args.drain_grace_secs))
        .with_failure_threshold(args.failure_threshold, args.failure_window)
        .with_persist_outcomes(args.persist_outcomes);
    config.recipient = args.recipient;
    config.value_gwei = (args.min_value_gwei, args.max_value_gwei);
    config.duration = args.duration_secs.map(Duration::from_secs);
    if let Some(volume) = args.volume {
        config = config.with_volume(volume);
    }
    if config.duration.is_none() && config.volume.is_none() {
        bail!("either --duration-secs or --volume is required");
    }

    let driver = LoadDriver::new(ctx.store.clone(), ctx.signer.clone(), ctx.rpc.clone(), config);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, draining");
            on_ctrl_c.cancel();
        }
    });

    let stats = driver.stats();
    let every = Duration::from_secs(args.report_secs.max(1));
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snap = stats.snapshot();
            info!(
                dispatched = snap.dispatched,
                confirmed = snap.confirmed,
                failed = snap.failed,
                timed_out = snap.timed_out,
                rejected = snap.rejected,
                rate = %format!("{:.2}", snap.achieved_rate),
                p50_ms = %format!("{:.1}", snap.latency.p50_ms),
                "Progress"
            );
        }
    });

    let summary = driver.run(cancel).await;
    reporter.abort();

    summary.print();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let report = reconcile::reconcile(&ctx.store, &ctx.rpc, &summary_layers(&summary)).await?;
    if !report.is_consistent() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn summary_layers(summary: &driver::RunSummary) -> Vec<Layer> {
    let mut layers = Vec::new();
    if summary.stats.l1_outcomes > 0 {
        layers.push(Layer::L1);
    }
    if summary.stats.l2_outcomes > 0 {
        layers.push(Layer::L2);
    }
    layers
}

fn parse_weights(pairs: &[String]) -> eyre::Result<Vec<(String, u32)>> {
    pairs
        .iter()
        .map(|pair| {
            let Some((id, weight)) = pair.split_once('=') else {
                bail!("weight `{pair}` is not of the form id=weight");
            };
            let weight = weight
                .parse()
                .wrap_err_with(|| format!("weight of {id} is not a number"))?;
            Ok((id.to_string(), weight))
        })
        .collect()
}

fn pool_ids(store: &AccountStore, prefix: &str) -> eyre::Result<Vec<String>> {
    let ids: Vec<_> = store
        .list()?
        .into_iter()
        .filter(|a| a.id.starts_with(prefix) && a.is_active())
        .map(|a| a.id)
        .collect();
    if ids.is_empty() {
        bail!("no active accounts with prefix {prefix}");
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_stress_flags() {
        let cli = Cli::try_parse_from([
            "testnet-stress",
            "stress",
            "--rate",
            "25",
            "--duration-secs",
            "5",
            "--layers",
            "l1,l2",
            "--weights",
            "threaduser_0=3",
        ])
        .unwrap();
        let Command::Stress(args) = cli.command else {
            panic!("expected stress");
        };
        assert_eq!(args.rate, 25.0);
        assert_eq!(args.layers, [Layer::L1, Layer::L2]);
        assert_eq!(
            parse_weights(&args.weights).unwrap(),
            [("threaduser_0".to_string(), 3)]
        );
    }

    #[test]
    fn malformed_weights_are_rejected() {
        assert!(parse_weights(&["threaduser_0".into()]).is_err());
        assert!(parse_weights(&["a=x".into()]).is_err());
    }
}
