use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use sponsored_userop::account::{FeeOracle, ProviderFeeOracle, SimpleAccount, SmartAccount};
use sponsored_userop::bundler::BundlerClient;
use sponsored_userop::encoding::{self, parse_bytes};
use sponsored_userop::nonce::NonceAllocator;
use sponsored_userop::paymaster::{ClockIds, PaymasterClient};
use sponsored_userop::stages::StageDeps;
use sponsored_userop::{load_config, Config, ConfigRaw, Intent, UserOpSender};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// In --json mode stdout carries a single JSON object; everything else goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "sponsored-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(CommonArgs),

    /// Build, sponsor and sign a UserOperation without sending it.
    Build(CallArgs),

    /// Build a sponsored UserOperation and drive it to inclusion.
    Send(CallArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON config file (camelCase keys). Flags and environment variables override it.
    #[arg(long, env = "SPONSORED_USEROP_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    settings: ConfigRaw,

    /// Smart account owner private key.
    ///
    /// Recommended: set via env var SPONSORED_USEROP_OWNER_PRIVATE_KEY.
    #[arg(long, env = "SPONSORED_USEROP_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// Print a single JSON object to stdout; all other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct CallArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call target.
    #[arg(long)]
    to: String,

    /// Wei sent with the call (decimal).
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata (hex).
    #[arg(long, default_value = "0x")]
    data: String,
}

impl CallArgs {
    fn intent(&self) -> Result<Intent> {
        Ok(Intent {
            target: Address::from_str(&self.to).context("invalid --to address")?,
            value: U256::from_dec_str(&self.value)
                .with_context(|| format!("invalid --value (expected integer wei): {}", self.value))?,
            data: parse_bytes(&self.data).context("invalid --data hex")?,
        })
    }
}

struct Runtime {
    config: Config,
    chain_id: u64,
    account: Arc<SimpleAccount<Provider<Http>>>,
    sender: UserOpSender,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Build(args) => cmd_build(args).await,
        Command::Send(args) => cmd_send(args).await,
    }
}

async fn cmd_account(args: CommonArgs) -> Result<()> {
    let machine_mode = args.json;
    let rt = setup(args).await?;
    let deployed = rt.account.is_deployed().await?;
    let smart_account = rt.account.address().await?;

    if machine_mode {
        let out = serde_json::json!({
            "chainId": rt.chain_id,
            "owner": encoding::fmt_address(rt.account.owner()),
            "smartAccount": encoding::fmt_address(smart_account),
            "isDeployed": deployed,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", rt.chain_id);
    outln!(machine_mode, "entryPoint:     {:?}", rt.config.entry_point);
    outln!(machine_mode, "factory:        {:?}", rt.config.factory);
    outln!(machine_mode, "owner:          {:?}", rt.account.owner());
    outln!(machine_mode, "smartAccount:   {:?}", smart_account);
    outln!(machine_mode, "isDeployed:     {}", deployed);
    Ok(())
}

async fn cmd_build(args: CallArgs) -> Result<()> {
    let intent = args.intent()?;
    let machine_mode = args.common.json;
    let rt = setup(args.common).await?;

    let draft = rt.sender.build(intent).await?;
    let op = draft.finalize()?;
    let json = encoding::user_op_to_json(&op);

    if machine_mode {
        println!("{}", json);
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("failed to render user operation")?
        );
    }
    Ok(())
}

async fn cmd_send(args: CallArgs) -> Result<()> {
    let intent = args.intent()?;
    let machine_mode = args.common.json;
    let rt = setup(args.common).await?;

    let inclusion = rt.sender.send(intent).await?;

    if machine_mode {
        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(inclusion.user_op_hash),
            "transactionHash": encoding::fmt_h256(inclusion.receipt.transaction_hash),
            "success": inclusion.receipt.success,
            "attempts": inclusion.attempts,
            "userOperation": encoding::user_op_to_json(&inclusion.user_operation),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "userOpHash:     {:?}", inclusion.user_op_hash);
    outln!(machine_mode, "txHash:         {:?}", inclusion.receipt.transaction_hash);
    outln!(machine_mode, "success:        {}", inclusion.receipt.success);
    outln!(machine_mode, "attempts:       {}", inclusion.attempts);
    Ok(())
}

async fn setup(args: CommonArgs) -> Result<Runtime> {
    let config = load_config(args.config.as_deref(), args.settings)?;

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let rpc_url = reqwest::Url::parse(&config.rpc_url).context("invalid RPC URL")?;
    let provider = Provider::new(Http::new_with_client(rpc_url, http.clone()))
        .interval(Duration::from_millis(350));
    let provider = Arc::new(provider);

    let oracle = Arc::new(ProviderFeeOracle::new(provider.clone()));
    let chain_id = oracle.chain_id().await?;

    let wallet = LocalWallet::from_str(&args.owner_private_key)
        .context("invalid owner private key")?
        .with_chain_id(chain_id);

    let account = Arc::new(
        SimpleAccount::connect(
            provider.clone(),
            wallet,
            config.entry_point,
            config.factory,
            config.salt,
        )
        .await?,
    );

    let deps = StageDeps {
        account: account.clone(),
        bundler: Arc::new(BundlerClient::new(config.bundler_url.clone(), http.clone())),
        oracle,
        sponsor: Arc::new(PaymasterClient::new(
            config.paymaster_url.clone(),
            config.sponsorship_method.clone(),
            http,
            Arc::new(ClockIds::default()),
        )),
        nonces: Arc::new(NonceAllocator::new()),
        dummy_paymaster: config.dummy_paymaster.clone(),
        fee_policy: config.fee_policy,
        replacement_bump_percentage: config.retry_policy.replacement_bump_percentage,
        policy_id: config.policy_id.clone(),
        entry_point: config.entry_point,
    };
    let sender = UserOpSender::new(deps, config.retry_policy.clone())?;

    Ok(Runtime {
        config,
        chain_id,
        account,
        sender,
    })
}
