use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use thrift_reconciler::client::config::ReconcilerConfig;
use thrift_reconciler::client::guard::Action;
use thrift_reconciler::client::history::{ContributionSync, HistoryStore, MemoryHistoryStore, RedisHistoryStore};
use thrift_reconciler::client::services::memory_chain::{ChainFixture, MemoryChain};
use thrift_reconciler::client::services::thrift_service::{ActionOutcome, ActionRequest, ThriftService};
use thrift_reconciler::common::models::Address;
use thrift_reconciler::utils::logger::init_logger;

#[derive(Parser)]
#[command(name = "thrift-inspect")]
#[command(about = "Inspect thrift groups from a chain fixture and replay actions against it")]
struct Args {
    /// JSON fixture describing groups, members and balances
    #[arg(short, long)]
    fixture: PathBuf,
    /// Address acting as the connected wallet
    #[arg(short, long)]
    caller: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print derived status and guard decisions for every group
    Status,
    /// Run one action through guard and orchestrator, printing each step
    Act {
        #[arg(short, long)]
        group: u64,
        #[arg(short, long, value_enum)]
        action: ActionArg,
        /// Comma-separated addresses for set-payout-order
        #[arg(long, value_delimiter = ',')]
        order: Vec<String>,
        /// Address for add-member
        #[arg(long)]
        member: Option<String>,
        #[arg(long)]
        confirm: bool,
        /// Submit even if the guard denies
        #[arg(long)]
        force: bool,
    },
    /// Rebuild contribution history from events
    History {
        #[arg(short, long)]
        group: u64,
        #[arg(long)]
        full: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Join,
    Contribute,
    Activate,
    Distribute,
    SetPayoutOrder,
    AddMember,
    EmergencyWithdraw,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ReconcilerConfig::from_env();
    init_logger(&config.log_level);

    let raw = std::fs::read_to_string(&args.fixture)
        .with_context(|| format!("reading fixture {}", args.fixture.display()))?;
    let fixture: ChainFixture = serde_json::from_str(&raw).context("parsing fixture")?;
    let chain = Arc::new(MemoryChain::new());
    let group_ids = chain.load_fixture(fixture)?;
    let caller = Address::parse(&args.caller)?;

    let clock = chain.clone();
    let service = ThriftService::new(chain.clone(), caller.clone(), config.clone()).with_clock(move || clock.now());

    match args.command {
        Commands::Status => {
            for id in group_ids {
                print_status(&service, id).await?;
            }
        }
        Commands::Act { group, action, order, member, confirm, force } => {
            let action = match action {
                ActionArg::Join => Action::Join,
                ActionArg::Contribute => Action::Contribute,
                ActionArg::Activate => Action::Activate,
                ActionArg::Distribute => Action::Distribute,
                ActionArg::SetPayoutOrder => Action::SetPayoutOrder {
                    order: order.iter().map(|a| Address::parse(a)).collect::<Result<_, _>>()?,
                },
                ActionArg::AddMember => Action::AddMember {
                    member: Address::parse(member.as_deref().ok_or_else(|| anyhow!("--member is required"))?)?,
                },
                ActionArg::EmergencyWithdraw => Action::EmergencyWithdraw,
            };
            let mut request = ActionRequest::new(group, action);
            request.user_name = caller.short();
            request.confirmed = confirm;
            request.force = force;

            let outcome = service.perform(request).await?;
            for step in service.orchestrator().steps() {
                match &step.error_message {
                    Some(msg) => println!("  [{}] {} - {}", step.status, step.title, msg),
                    None => println!("  [{}] {}", step.status, step.title),
                }
            }
            println!("Outcome: {}", outcome);
            if let ActionOutcome::Completed { snapshot: Some(_), .. } = outcome {
                print_status(&service, group).await?;
            }
        }
        Commands::History { group, full } => match &config.redis_url {
            Some(url) => {
                let store = RedisHistoryStore::new(url, config.history_ttl_secs).await?;
                store.health_check().await?;
                print_history(&service, chain.clone(), Arc::new(store), &config, group, full).await?;
            }
            None => {
                let store = Arc::new(MemoryHistoryStore::new());
                print_history(&service, chain.clone(), store, &config, group, full).await?;
            }
        },
    }

    Ok(())
}

async fn print_status(service: &ThriftService<MemoryChain>, id: u64) -> anyhow::Result<()> {
    let view = service.group_view(id).await?;
    let group = match &view.snapshot.group {
        Some(g) => g,
        None => {
            println!("Group #{}: {}", id, view.status.reason.map(|r| r.to_string()).unwrap_or_default());
            return Ok(());
        }
    };

    println!("Group #{} '{}' ({} members of {})", id, group.name, group.total_members, group.max_members);
    println!(
        "  active={} started={} canContribute={} reason={}",
        view.status.is_active,
        view.status.is_started,
        view.status.can_contribute,
        view.status.reason.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
    );
    if let Some(start) = view.status.start_date {
        println!("  starts {}", start.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  round={} completedPayouts={}", group.current_round, group.completed_payouts);
    if let Some(next) = &view.next_recipient {
        println!("  next recipient {}", next.short());
    }
    println!(
        "  caller member={} canJoin={}",
        view.join.is_member,
        view.join.reason.map(|r| r.to_string()).unwrap_or_else(|| "yes".to_string())
    );

    let order = if group.payout_order.is_empty() {
        view.snapshot.member_addresses()
    } else {
        group.payout_order.clone()
    };
    let actions = [
        Action::Join,
        Action::Contribute,
        Action::Activate,
        Action::Distribute,
        Action::SetPayoutOrder { order },
        Action::EmergencyWithdraw,
    ];
    for action in actions {
        let decision = service.decide(id, &action).await?;
        let verdict = match (&decision.reason, decision.requires_confirmation) {
            (Some(reason), _) => format!("no ({})", reason),
            (None, true) => "yes, after confirmation".to_string(),
            (None, false) => "yes".to_string(),
        };
        println!("  {:<18} {}", action.name(), verdict);
    }
    Ok(())
}

async fn print_history<S: HistoryStore>(
    service: &ThriftService<MemoryChain>,
    chain: Arc<MemoryChain>,
    store: Arc<S>,
    config: &ReconcilerConfig,
    group: u64,
    full: bool,
) -> anyhow::Result<()> {
    let sync = ContributionSync::new(chain, store, config);
    let records = service.contribution_history(&sync, group, full).await?;
    println!("{} contributions for group #{}", records.len(), group);
    for r in records {
        println!(
            "  {} {} {} {} (block {})",
            r.date.format("%Y-%m-%d %H:%M"),
            r.member.short(),
            r.amount,
            r.token_symbol,
            r.block_number
        );
    }
    Ok(())
}
