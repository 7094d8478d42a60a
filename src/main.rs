// LEALT v1.3.2 -- MEMORY-LATENCY-AWARE FREQUENCY/LLC GOVERNOR
// CLOSED-LOOP MEMORY CLOCK + LLC REGION CONTROL
//
// DECISIONS HAPPEN IN THE GOVERNOR CORE (lealt LIBRARY)
// THIS BINARY HANDLES: CONFIGURATION, SIMULATED HARDWARE, REPORTING

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use lealt::bridge::{CpufreqNotifier, SysbusyNotifier, SysbusyState};
use lealt::config::Config;
use lealt::governor::{Governor, GovernorContext};
use lealt::llc::LlcControl;
use lealt::sim::SimWorld;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SIM_STEP_MS: u64 = 5;

#[derive(Parser)]
#[command(name = "lealt")]
#[command(about = "LEALT -- MEMORY-LATENCY-AWARE FREQUENCY/LLC GOVERNOR")]
struct Cli {
    // DEVICE CONFIGURATION (TOML). REFERENCE BOARD WHEN OMITTED
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    // PER-TICK DECISION LOGGING
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    // DRIVE THE GOVERNOR AGAINST THE SIMULATED BOARD
    Run(RunArgs),
    // VALIDATE AND SUMMARISE A DEVICE CONFIGURATION
    Check,
    // LIST EVERY TUNABLE WITH ITS RANGE AND CURRENT VALUE
    Tunables,
}

#[derive(Args)]
struct RunArgs {
    // SECONDS TO RUN (CTRL+C STOPS EARLY)
    #[arg(long, default_value_t = 10)]
    duration: u64,

    // DUMP FULL SAMPLE TRACE ON EXIT
    #[arg(long)]
    dump_log: bool,

    // RUNTIME TUNABLE OVERRIDE, REPEATABLE: --set node1/ratio_ceil=30
    #[arg(long = "set", value_name = "PATH=VALUE")]
    set: Vec<String>,

    // WORKLOAD SEED
    #[arg(long, default_value_t = 1)]
    seed: u64,

    // RAISE SYSBUSY TO THIS LEVEL HALFWAY THROUGH, DROP IT 1S LATER
    #[arg(long)]
    sysbusy: Option<u64>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            duration: 10,
            dump_log: false,
            set: Vec::new(),
            seed: 1,
            sysbusy: None,
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let cfg = Config::load_or_builtin(cli.config.as_deref())?;
    match cli.command {
        Some(Command::Check) => cli::check::run_check(&cfg, cli.config.as_deref()),
        Some(Command::Tunables) => cli::tunables::run_tunables(&cfg),
        Some(Command::Run(args)) => run(&cfg, &args),
        None => run(&cfg, &RunArgs::default()),
    }
}

// BUILD THE CONTEXT FROM CONFIG, WIRED TO THE SIMULATED BOARD
pub(crate) fn build_context(cfg: &Config, world: &SimWorld) -> Result<GovernorContext> {
    let llc = LlcControl::new(Box::new(world.cache()), cfg.llc.region, cfg.llc.ways);
    let ctx = GovernorContext::new(
        Box::new(world.device(cfg.opp_table.clone())),
        llc,
        cfg.governor_tunables()?,
        cfg.domain_tunables(),
    );
    for (i, n) in cfg.nodes.iter().enumerate() {
        ctx.register_node(
            n.name.clone(),
            n.capabilities()?,
            n.freq_map(),
            n.tunables(),
            Box::new(world.monitor(i)),
        );
    }
    Ok(ctx)
}

fn run(cfg: &Config, args: &RunArgs) -> Result<()> {
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("setting Ctrl-C handler")?;

    let world = SimWorld::new(cfg, args.seed);
    let ctx = build_context(cfg, &world)?;
    for kv in &args.set {
        let (path, value) = kv
            .split_once('=')
            .with_context(|| format!("--set expects PATH=VALUE, got `{}`", kv))?;
        ctx.set_tunable(path, value)
            .with_context(|| format!("--set {}", kv))?;
    }
    world.attach_cpufreq(CpufreqNotifier::new(&ctx));

    let tun = ctx.tunables();
    println!("LEALT v1.3.2");
    println!("OPPS:            {} ({}..{} kHz)", cfg.opp_table.len(),
             cfg.opp_table.first().copied().unwrap_or(0),
             cfg.opp_table.last().copied().unwrap_or(0));
    println!("NODES:           {}", cfg.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", "));
    println!("DOMAINS:         {}", cfg.domains.len());
    println!("POLLING:         {}..{} ms", tun.polling_ms_min, tun.polling_ms_max);
    println!("HOLD:            freq={} us, llc={} us", tun.hold_time_freq, tun.hold_time_llc);
    println!("LLC THRESHOLDS:  on={} off={} floor={}", tun.llc_on_th, tun.llc_off_th, tun.llc_freq);
    println!("SEED:            {}", args.seed);
    println!();

    let mut gov = Governor::new(ctx);
    gov.start()?;
    let busy = SysbusyNotifier::new(gov.context());

    println!("LEALT IS ACTIVE (CTRL+C TO EXIT)");

    let start = Instant::now();
    let total = Duration::from_secs(args.duration);
    let busy_on = total / 2;
    let busy_off = busy_on + Duration::from_secs(1);
    let mut busy_raised = false;
    let mut last_step = start;
    let mut last_report = start;

    while !SHUTDOWN.load(Ordering::Relaxed) && start.elapsed() < total {
        std::thread::sleep(Duration::from_millis(SIM_STEP_MS));
        let now = Instant::now();
        world.step((now - last_step).as_micros() as u64);
        last_step = now;

        if let Some(level) = args.sysbusy {
            let t = now - start;
            if !busy_raised && t >= busy_on && t < busy_off {
                busy.notify(SysbusyState::from_level(level));
                busy_raised = true;
            } else if busy_raised && t >= busy_off {
                busy.notify(SysbusyState::Normal);
                busy_raised = false;
            }
        }

        if now - last_report >= Duration::from_secs(1) {
            last_report = now;
            let st = gov.context().stats();
            let poll = gov.context().poll_state();
            println!(
                "[{:>4.1}s] phase={:<9} mem={:<8} llc={:<4} poll={:<4}ms ticks={} accel={}",
                (now - start).as_secs_f64(), world.phase().label(), world.mem_freq(),
                st.llc_state.label(), poll.polling_ms(), st.engine.sampled_ticks, st.accelerations,
            );
        }
    }

    println!("LEALT IS SHUTTING DOWN");
    gov.stop();

    let st = gov.context().stats();
    if args.dump_log {
        gov.context().with_log(|log| log.dump());
    }
    gov.context().with_log(|log| log.summary());
    println!("  FORCED-MAX TICKS:  {}", st.engine.forced_max_ticks);
    println!("  LLC TRANSITIONS:   {}", st.llc_transitions);
    println!("  FAST-POLL PULLS:   {}", st.accelerations);
    println!("  WORK RUNS:         {}", st.work_runs);
    println!("  MONITORS RUNNING:  {}", world.monitors_running());

    println!("LEALT OUT.");
    Ok(())
}
